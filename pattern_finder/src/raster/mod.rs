//! Georeferenced raster loading.
//!
//! Reads a (Geo)TIFF, collapses all bands (interleaved or planar) to one
//! grayscale band by averaging, rescales it to [0, 1] and extracts the
//! pixel→world transform and CRS from the GeoTIFF tags.


mod error;
pub mod geo;

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use common::Buffer2;
use tiff::decoder::{ChunkType, Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tiff::{ColorType, TiffResult};

pub use error::RasterError;
pub use geo::{Crs, GeoTransform};

/// Single-band raster normalized to [0, 1] with its georeferencing.
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub pixels: Buffer2<f32>,
    pub transform: GeoTransform,
    /// `None` when the file carries no GeoKeys.
    pub crs: Option<Crs>,
}

impl GeoRaster {
    pub fn width(&self) -> usize {
        self.pixels.width()
    }

    pub fn height(&self) -> usize {
        self.pixels.height()
    }
}

/// Load a georeferenced raster as normalized grayscale.
///
/// # Arguments
/// * `path` - Path to a TIFF/GeoTIFF file
///
/// # Returns
/// The grayscale grid (bands averaged, min subtracted, divided by the peak),
/// the forward affine transform and the CRS. A raster without georeferencing
/// tags gets the identity transform.
pub fn load_raster(path: &Path) -> Result<GeoRaster, RasterError> {
    let decode_err = |source| RasterError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let unsupported = |reason: String| RasterError::Unsupported {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(decode_err)?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions().map_err(decode_err)?;
    let (width, height) = (width as usize, height as usize);
    let bands = match decoder.colortype().map_err(decode_err)? {
        ColorType::Gray(_) => 1,
        ColorType::GrayA(_) => 2,
        ColorType::RGB(_) | ColorType::YCbCr(_) => 3,
        ColorType::RGBA(_) | ColorType::CMYK(_) => 4,
        ColorType::Multiband { num_samples, .. } => num_samples as usize,
        other => return Err(unsupported(format!("color type {:?}", other))),
    };

    let planar = decoder
        .find_tag_unsigned::<u16>(Tag::PlanarConfiguration)
        .map_err(decode_err)?
        == Some(PLANAR_SEPARATE);

    let georef = read_georeference(&mut decoder, path)?;

    let gray = if planar && bands > 1 {
        read_planar_gray(&mut decoder, width, height, bands)
            .map_err(decode_err)?
            .map_err(|format| unsupported(format!("sample format {format}")))?
    } else {
        let image = decoder.read_image().map_err(decode_err)?;
        let samples = samples_f64(&image)
            .ok_or_else(|| unsupported(format!("sample format {}", sample_format_name(&image))))?;
        average_interleaved(&samples, bands)
    };

    if gray.len() != width * height {
        return Err(unsupported(format!(
            "expected {} samples for {}x{}x{} image, decoded {}",
            width * height * bands,
            width,
            height,
            bands,
            gray.len() * bands
        )));
    }

    let mut pixels = Buffer2::new(width, height, gray);
    normalize_unit_range(&mut pixels);

    tracing::debug!(
        path = %path.display(),
        width,
        height,
        bands,
        crs = ?georef.crs,
        "Loaded raster"
    );

    Ok(GeoRaster {
        pixels,
        transform: georef.transform,
        crs: georef.crs,
    })
}

/// Rescale in place: subtract the minimum and divide by the resulting peak.
///
/// A flat image stays all-zero. Non-finite samples become 0.
pub fn normalize_unit_range(pixels: &mut Buffer2<f32>) {
    let Some((min, max)) = pixels.min_max() else {
        pixels.pixels_mut().fill(0.0);
        return;
    };

    let peak = max - min;
    for v in pixels.pixels_mut() {
        *v = if !v.is_finite() {
            0.0
        } else if peak > 0.0 {
            (*v - min) / peak
        } else {
            0.0
        };
    }
}

struct Georeference {
    transform: GeoTransform,
    crs: Option<Crs>,
}

fn read_georeference(
    decoder: &mut Decoder<BufReader<File>>,
    path: &Path,
) -> Result<Georeference, RasterError> {
    let georef_err = |reason: String| RasterError::Georeference {
        path: path.to_path_buf(),
        reason,
    };

    let mut f64_tag = |tag: Tag| -> Result<Option<Vec<f64>>, RasterError> {
        decoder
            .find_tag(tag)
            .and_then(|value| value.map(|v| v.into_f64_vec()).transpose())
            .map_err(|source| RasterError::Decode {
                path: path.to_path_buf(),
                source,
            })
    };

    let model_transformation = f64_tag(Tag::ModelTransformationTag)?;
    let tiepoints = f64_tag(Tag::ModelTiepointTag)?;
    let pixel_scale = f64_tag(Tag::ModelPixelScaleTag)?;

    let geokey_directory = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .and_then(|value| value.map(|v| v.into_u32_vec()).transpose())
        .map_err(|source| RasterError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    let geokeys = match geokey_directory {
        Some(dir) => geo::parse_geokeys(&dir).map_err(georef_err)?,
        None => geo::GeoKeys::default(),
    };

    let transform = geo::transform_from_tags(
        model_transformation.as_deref(),
        tiepoints.as_deref(),
        pixel_scale.as_deref(),
    )
    .map_err(georef_err)?;

    let transform = match transform {
        Some(t) if geokeys.pixel_is_point => t.shifted_to_area(),
        Some(t) => t,
        None => {
            tracing::debug!(path = %path.display(), "No georeferencing tags, using identity transform");
            GeoTransform::IDENTITY
        }
    };

    if !transform.is_invertible() {
        return Err(georef_err("singular pixel to world transform".to_string()));
    }

    Ok(Georeference {
        transform,
        crs: geokeys.crs,
    })
}

/// `PlanarConfiguration` value for one plane per band.
const PLANAR_SEPARATE: u16 = 2;

fn samples_f64(image: &DecodingResult) -> Option<Vec<f64>> {
    fn widen<T: Copy>(data: &[T], to_f64: impl Fn(T) -> f64) -> Vec<f64> {
        data.iter().map(|&v| to_f64(v)).collect()
    }

    #[allow(unreachable_patterns)]
    let samples = match image {
        DecodingResult::U8(buf) => widen(buf.as_slice(), f64::from),
        DecodingResult::U16(buf) => widen(buf.as_slice(), f64::from),
        DecodingResult::U32(buf) => widen(buf.as_slice(), f64::from),
        DecodingResult::U64(buf) => widen(buf.as_slice(), |v| v as f64),
        DecodingResult::I8(buf) => widen(buf.as_slice(), f64::from),
        DecodingResult::I16(buf) => widen(buf.as_slice(), f64::from),
        DecodingResult::I32(buf) => widen(buf.as_slice(), f64::from),
        DecodingResult::I64(buf) => widen(buf.as_slice(), |v| v as f64),
        DecodingResult::F16(buf) => widen(buf.as_slice(), |v| f64::from(v.to_f32())),
        DecodingResult::F32(buf) => widen(buf.as_slice(), f64::from),
        DecodingResult::F64(buf) => widen(buf.as_slice(), |v| v),
        _ => return None,
    };
    Some(samples)
}

/// Mean over `bands` interleaved samples per pixel.
fn average_interleaved(samples: &[f64], bands: usize) -> Vec<f32> {
    if bands <= 1 {
        return samples.iter().map(|&v| v as f32).collect();
    }
    samples
        .chunks_exact(bands)
        .map(|px| (px.iter().sum::<f64>() / bands as f64) as f32)
        .collect()
}

/// Mean over band planes stored as separate strips or tiles.
///
/// Chunk indices run plane by plane. The inner `Err` names an unsupported
/// sample format.
fn read_planar_gray<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    width: usize,
    height: usize,
    bands: usize,
) -> TiffResult<Result<Vec<f32>, &'static str>> {
    let chunks = match decoder.get_chunk_type() {
        ChunkType::Strip => decoder.strip_count()?,
        ChunkType::Tile => decoder.tile_count()?,
    } as usize;
    let per_plane = chunks / bands;
    let (chunk_w, chunk_h) = decoder.chunk_dimensions();
    let (chunk_w, chunk_h) = (chunk_w.max(1) as usize, chunk_h as usize);
    let across = width.div_ceil(chunk_w);

    let mut sum = vec![0.0f64; width * height];
    for index in 0..per_plane * bands {
        let chunk = decoder.read_chunk(index as u32)?;
        let Some(values) = samples_f64(&chunk) else {
            return Ok(Err(sample_format_name(&chunk)));
        };
        let stride = decoder.chunk_data_dimensions(index as u32).0 as usize;

        let within = index % per_plane;
        let x0 = (within % across) * chunk_w;
        let y0 = (within / across) * chunk_h;
        for (row, line) in values.chunks(stride.max(1)).enumerate() {
            let y = y0 + row;
            if y >= height {
                break;
            }
            for (col, &v) in line.iter().enumerate() {
                let x = x0 + col;
                if x >= width {
                    break;
                }
                sum[y * width + x] += v;
            }
        }
    }

    tracing::trace!(bands, chunks, "Averaged planar bands");
    Ok(Ok(sum.into_iter().map(|v| (v / bands as f64) as f32).collect()))
}

fn sample_format_name(image: &DecodingResult) -> &'static str {
    #[allow(unreachable_patterns)]
    match image {
        DecodingResult::U8(_) => "u8",
        DecodingResult::U16(_) => "u16",
        DecodingResult::U32(_) => "u32",
        DecodingResult::U64(_) => "u64",
        DecodingResult::I8(_) => "i8",
        DecodingResult::I16(_) => "i16",
        DecodingResult::I32(_) => "i32",
        DecodingResult::I64(_) => "i64",
        DecodingResult::F16(_) => "f16",
        DecodingResult::F32(_) => "f32",
        DecodingResult::F64(_) => "f64",
        _ => "unknown",
    }
}
