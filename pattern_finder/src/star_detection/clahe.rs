//! Contrast-limited adaptive histogram equalization.
//!
//! The image is split into a grid of tiles roughly `kernel_size` pixels on a
//! side. Each tile gets a clipped-histogram equalization lookup table; output
//! pixels blend the four surrounding tile tables bilinearly by distance to the
//! tile centers.

use common::Buffer2;
use rayon::prelude::*;

const NBINS: usize = 256;

/// Kernel size used by the detector: `max(32, min(height, width) / 8)`.
pub fn adaptive_kernel_size(width: usize, height: usize) -> usize {
    (width.min(height) / 8).max(32)
}

/// Equalize a [0, 1] image. Output is also in [0, 1].
///
/// # Arguments
/// * `image` - Input image, values outside [0, 1] are clamped
/// * `kernel_size` - Approximate tile edge length in pixels
/// * `clip_limit` - Histogram clip as a fraction of tile pixel count
pub fn equalize_adapthist(image: &Buffer2<f32>, kernel_size: usize, clip_limit: f64) -> Buffer2<f32> {
    let (width, height) = (image.width(), image.height());
    if image.is_empty() {
        return image.clone();
    }

    let kernel_size = kernel_size.max(1);
    let tiles_x = width.div_ceil(kernel_size).max(1);
    let tiles_y = height.div_ceil(kernel_size).max(1);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);

    let bins = image.map(|&v| quantize(v));

    let luts: Vec<[f32; NBINS]> = (0..tiles_x * tiles_y)
        .into_par_iter()
        .map(|t| {
            let (tx, ty) = (t % tiles_x, t / tiles_x);
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            tile_lut(&bins, x0..x1, y0..y1, clip_limit)
        })
        .collect();

    let mut output = Buffer2::new_default(width, height);
    output
        .pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let (ty0, ty1, wy) = neighbours(y, tile_h, tiles_y);
            for (x, out) in row.iter_mut().enumerate() {
                let (tx0, tx1, wx) = neighbours(x, tile_w, tiles_x);
                let b = *bins.get(x, y) as usize;
                let v00 = luts[ty0 * tiles_x + tx0][b];
                let v01 = luts[ty0 * tiles_x + tx1][b];
                let v10 = luts[ty1 * tiles_x + tx0][b];
                let v11 = luts[ty1 * tiles_x + tx1][b];
                let top = v00 + (v01 - v00) * wx;
                let bottom = v10 + (v11 - v10) * wx;
                *out = top + (bottom - top) * wy;
            }
        });

    output
}

#[inline]
fn quantize(v: f32) -> u8 {
    let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    (v * (NBINS - 1) as f32).round() as u8
}

/// Tile indices on either side of `pos` and the blend weight toward the second.
#[inline]
fn neighbours(pos: usize, tile: usize, tiles: usize) -> (usize, usize, f32) {
    let f = (pos as f32 + 0.5) / tile as f32 - 0.5;
    if f <= 0.0 {
        return (0, 0, 0.0);
    }
    let i0 = (f.floor() as usize).min(tiles - 1);
    let i1 = (i0 + 1).min(tiles - 1);
    let w = if i1 == i0 { 0.0 } else { f - i0 as f32 };
    (i0, i1, w)
}

fn tile_lut(
    bins: &Buffer2<u8>,
    xs: std::ops::Range<usize>,
    ys: std::ops::Range<usize>,
    clip_limit: f64,
) -> [f32; NBINS] {
    let mut hist = [0usize; NBINS];
    for y in ys {
        for x in xs.clone() {
            hist[*bins.get(x, y) as usize] += 1;
        }
    }

    let count: usize = hist.iter().sum();
    let mut lut = [0.0f32; NBINS];
    if count == 0 {
        return lut;
    }

    let clip = ((clip_limit * count as f64) as usize).max(1);
    clip_histogram(&mut hist, clip);

    let mut cdf = 0usize;
    for (out, h) in lut.iter_mut().zip(hist.iter()) {
        cdf += h;
        *out = (cdf as f32 / count as f32).min(1.0);
    }
    lut
}

/// Clip every bin at `clip` and spread the excess evenly, remainder first-come.
fn clip_histogram(hist: &mut [usize; NBINS], clip: usize) {
    let mut excess = 0usize;
    for h in hist.iter_mut() {
        if *h > clip {
            excess += *h - clip;
            *h = clip;
        }
    }

    let per_bin = excess / NBINS;
    let mut remainder = excess % NBINS;
    for h in hist.iter_mut() {
        *h += per_bin;
    }
    if remainder > 0 {
        let step = (NBINS / remainder).max(1);
        let mut i = 0;
        while remainder > 0 && i < NBINS {
            hist[i] += 1;
            remainder -= 1;
            i += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_size_floor() {
        assert_eq!(adaptive_kernel_size(64, 100), 32);
        assert_eq!(adaptive_kernel_size(4000, 3000), 375);
    }

    #[test]
    fn test_flat_image_stays_flat() {
        let image = Buffer2::new(40, 50, vec![0.3; 2000]);
        let out = equalize_adapthist(&image, 32, 0.01);
        let first = out.pixels()[0];
        assert!(out.pixels().iter().all(|&v| (v - first).abs() < 1e-6));
    }

    #[test]
    fn test_output_in_unit_range_and_monotonic_within_tile() {
        let image = Buffer2::from_fn(32, 32, |x, y| ((x + y) as f32) / 62.0);
        let out = equalize_adapthist(&image, 32, 0.01);
        assert!(out.pixels().iter().all(|&v| (0.0..=1.0).contains(&v)));
        // Single tile: equalization preserves ordering.
        assert!(out.get(0, 0) <= out.get(10, 10));
        assert!(out.get(10, 10) <= out.get(31, 31));
        assert!((out.get(31, 31) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_preserves_total() {
        let mut hist = [0usize; NBINS];
        hist[0] = 1000;
        hist[10] = 24;
        clip_histogram(&mut hist, 10);
        assert_eq!(hist.iter().sum::<usize>(), 1024);
        assert!(hist.iter().all(|&h| h <= 10 + 1014 / NBINS + 1));
    }

    #[test]
    fn test_neighbours_clamp_at_edges() {
        assert_eq!(neighbours(0, 32, 3), (0, 0, 0.0));
        let (i0, i1, w) = neighbours(95, 32, 3);
        assert_eq!((i0, i1), (2, 2));
        assert_eq!(w, 0.0);
        let (i0, i1, w) = neighbours(32, 32, 3);
        assert_eq!((i0, i1), (0, 1));
        assert!(w > 0.5 && w < 0.55);
    }
}
