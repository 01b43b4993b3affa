//! Synthetic rasters and GeoTIFF fixtures shared by unit tests.

use std::fs::File;
use std::path::Path;

use common::Buffer2;
use glam::DVec2;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::raster::{Crs, GeoTransform};

/// Georeferencing written into a test GeoTIFF.
#[derive(Debug, Clone, Copy)]
pub struct TestGeoref {
    pub origin: DVec2,
    pub pixel_size: f64,
    pub crs: Option<Crs>,
}

impl TestGeoref {
    /// One-degree-per-1000-pixels WGS84 grid anchored at `(lon, lat)`.
    pub fn wgs84(lon: f64, lat: f64) -> Self {
        Self {
            origin: DVec2::new(lon, lat),
            pixel_size: 0.001,
            crs: Some(Crs::WGS84),
        }
    }

    pub fn transform(&self) -> GeoTransform {
        GeoTransform::north_up(self.origin, self.pixel_size, self.pixel_size)
    }
}

fn geokey_directory(crs: Crs) -> Vec<u16> {
    let (model_type, key, code) = match crs {
        Crs::Geographic { epsg } => (2u16, 2048u16, epsg.unwrap_or(32767) as u16),
        Crs::Projected { epsg } => (1u16, 3072u16, epsg.unwrap_or(32767) as u16),
    };
    vec![1, 1, 0, 2, 1024, 0, 1, model_type, key, 0, 1, code]
}

/// Writes a single-band f32 GeoTIFF.
pub fn write_geotiff(path: &Path, pixels: &Buffer2<f32>, georef: Option<TestGeoref>) {
    let file = File::create(path).unwrap();
    let mut tiff = TiffEncoder::new(file).unwrap();
    let mut image = tiff
        .new_image::<colortype::Gray32Float>(pixels.width() as u32, pixels.height() as u32)
        .unwrap();

    if let Some(georef) = georef {
        let scale = [georef.pixel_size, georef.pixel_size, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, georef.origin.x, georef.origin.y, 0.0];
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &scale[..])
            .unwrap();
        image
            .encoder()
            .write_tag(Tag::ModelTiepointTag, &tiepoint[..])
            .unwrap();
        if let Some(crs) = georef.crs {
            let keys = geokey_directory(crs);
            image
                .encoder()
                .write_tag(Tag::GeoKeyDirectoryTag, &keys[..])
                .unwrap();
        }
    }

    image.write_data(pixels.pixels()).unwrap();
}

/// Writes an interleaved RGB8 TIFF without georeferencing.
pub fn write_rgb8_tiff(path: &Path, width: u32, height: u32, data: &[u8]) {
    let file = File::create(path).unwrap();
    let mut tiff = TiffEncoder::new(file).unwrap();
    tiff.write_image::<colortype::RGB8>(width, height, data)
        .unwrap();
}

/// Writes an uncompressed RGB8 TIFF with one strip per band
/// (`PlanarConfiguration = 2`), which the encoder cannot produce.
pub fn write_planar_rgb8_tiff(path: &Path, width: u32, height: u32, planes: [&[u8]; 3]) {
    const SHORT: u16 = 3;
    const LONG: u16 = 4;
    let plane_len = width * height;
    for plane in planes {
        assert_eq!(plane.len(), plane_len as usize);
    }

    let entries_at = 8u32;
    let entry_count = 10u16;
    let bits_at = entries_at + 2 + 12 * entry_count as u32 + 4;
    let offsets_at = bits_at + 6;
    let counts_at = offsets_at + 12;
    let data_at = counts_at + 12;

    let entries: [(u16, u16, u32, u32); 10] = [
        (256, LONG, 1, width),
        (257, LONG, 1, height),
        (258, SHORT, 3, bits_at),
        (259, SHORT, 1, 1),
        (262, SHORT, 1, 2),
        (273, LONG, 3, offsets_at),
        (277, SHORT, 1, 3),
        (278, LONG, 1, height),
        (279, LONG, 3, counts_at),
        (284, SHORT, 1, 2),
    ];

    let mut out = Vec::new();
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&entries_at.to_le_bytes());
    out.extend_from_slice(&entry_count.to_le_bytes());
    for (tag, kind, count, value) in entries {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    for _ in 0..3 {
        out.extend_from_slice(&8u16.to_le_bytes());
    }
    for band in 0..3 {
        out.extend_from_slice(&(data_at + band * plane_len).to_le_bytes());
    }
    for _ in 0..3 {
        out.extend_from_slice(&plane_len.to_le_bytes());
    }
    assert_eq!(out.len() as u32, data_at);
    for plane in planes {
        out.extend_from_slice(plane);
    }
    std::fs::write(path, out).unwrap();
}

/// Sum of circular Gaussian spots `(x, y, sigma, amplitude)` over a constant
/// background.
pub fn gaussian_field(
    width: usize,
    height: usize,
    background: f32,
    spots: &[(f64, f64, f64, f64)],
) -> Buffer2<f32> {
    Buffer2::from_fn(width, height, |x, y| {
        let mut v = background as f64;
        for &(sx, sy, sigma, amp) in spots {
            let dx = x as f64 - sx;
            let dy = y as f64 - sy;
            v += amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
        }
        v as f32
    })
}
