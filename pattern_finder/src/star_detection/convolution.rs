//! Separable Gaussian and Laplacian-of-Gaussian filtering.
//!
//! Both passes reflect at the border (`d c b a | a b c d | d c b a`) and are
//! parallelized over row chunks.

use common::Buffer2;
use rayon::prelude::*;

/// Kernel half-width in sigmas.
const TRUNCATE: f64 = 4.0;
const ROWS_PER_CHUNK: usize = 8;

/// 1D Gaussian kernel normalized to sum 1, radius `round(4σ)`.
pub fn gaussian_kernel_1d(sigma: f64) -> Vec<f32> {
    assert!(sigma > 0.0, "Sigma must be positive");
    let radius = (TRUNCATE * sigma + 0.5) as i64;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let raw: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / two_sigma_sq).exp())
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| (v / sum) as f32).collect()
}

/// Second derivative of the normalized Gaussian, same support as
/// [`gaussian_kernel_1d`]. Shifted to sum to exactly zero so flat regions give
/// no response despite truncation.
pub fn gaussian_second_derivative_1d(sigma: f64) -> Vec<f32> {
    assert!(sigma > 0.0, "Sigma must be positive");
    let radius = (TRUNCATE * sigma + 0.5) as i64;
    let sigma_sq = sigma * sigma;
    let two_sigma_sq = 2.0 * sigma_sq;

    let raw: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / two_sigma_sq).exp())
        .collect();
    let sum: f64 = raw.iter().sum();

    let kernel: Vec<f64> = (-radius..=radius)
        .zip(raw)
        .map(|(x, g)| {
            let x = x as f64;
            g / sum * (x * x / (sigma_sq * sigma_sq) - 1.0 / sigma_sq)
        })
        .collect();
    let mean = kernel.iter().sum::<f64>() / kernel.len() as f64;
    kernel.into_iter().map(|v| (v - mean) as f32).collect()
}

/// Scale-normalized negative Laplacian of Gaussian: `-σ² ∇²(G_σ * I)`.
///
/// Bright blobs of radius ≈ σ√2 produce positive peaks.
pub fn negative_log(image: &Buffer2<f32>, sigma: f64) -> Buffer2<f32> {
    let g = gaussian_kernel_1d(sigma);
    let g2 = gaussian_second_derivative_1d(sigma);

    // d²/dx² term and d²/dy² term.
    let dxx = convolve_cols(&convolve_rows(image, &g2), &g);
    let dyy = convolve_cols(&convolve_rows(image, &g), &g2);

    let scale = -(sigma * sigma) as f32;
    let pixels = dxx
        .pixels()
        .iter()
        .zip(dyy.pixels())
        .map(|(a, b)| scale * (a + b))
        .collect();
    Buffer2::new(image.width(), image.height(), pixels)
}

/// Mirror index into `[0, len)`.
#[inline]
fn reflect(i: i64, len: usize) -> usize {
    let len = len as i64;
    if len == 1 {
        return 0;
    }
    let period = 2 * len;
    let mut m = i.rem_euclid(period);
    if m >= len {
        m = period - 1 - m;
    }
    m as usize
}

/// Horizontal pass.
pub fn convolve_rows(input: &Buffer2<f32>, kernel: &[f32]) -> Buffer2<f32> {
    let width = input.width();
    let mut output = Buffer2::new_default(width, input.height());
    if width == 0 {
        return output;
    }
    let radius = (kernel.len() / 2) as i64;
    let src = input.pixels();

    output
        .pixels_mut()
        .par_chunks_mut(width * ROWS_PER_CHUNK)
        .enumerate()
        .for_each(|(chunk_idx, out_chunk)| {
            let y_start = chunk_idx * ROWS_PER_CHUNK;
            for (local_y, out_row) in out_chunk.chunks_mut(width).enumerate() {
                let y = y_start + local_y;
                let in_row = &src[y * width..(y + 1) * width];
                for (x, out) in out_row.iter_mut().enumerate() {
                    let mut acc = 0.0f32;
                    for (k, w) in kernel.iter().enumerate() {
                        let sx = reflect(x as i64 + k as i64 - radius, width);
                        acc += in_row[sx] * w;
                    }
                    *out = acc;
                }
            }
        });

    output
}

/// Vertical pass.
pub fn convolve_cols(input: &Buffer2<f32>, kernel: &[f32]) -> Buffer2<f32> {
    let (width, height) = (input.width(), input.height());
    let mut output = Buffer2::new_default(width, height);
    if width == 0 {
        return output;
    }
    let radius = (kernel.len() / 2) as i64;
    let src = input.pixels();

    output
        .pixels_mut()
        .par_chunks_mut(width * ROWS_PER_CHUNK)
        .enumerate()
        .for_each(|(chunk_idx, out_chunk)| {
            let y_start = chunk_idx * ROWS_PER_CHUNK;
            for (local_y, out_row) in out_chunk.chunks_mut(width).enumerate() {
                let y = y_start + local_y;
                for (k, w) in kernel.iter().enumerate() {
                    let sy = reflect(y as i64 + k as i64 - radius, height);
                    let in_row = &src[sy * width..(sy + 1) * width];
                    for (out, v) in out_row.iter_mut().zip(in_row) {
                        *out += v * w;
                    }
                }
            }
        });

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_kernel_sums_to_one() {
        for sigma in [0.5, 1.0, 2.7] {
            let k = gaussian_kernel_1d(sigma);
            let sum: f32 = k.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert_eq!(k.len() % 2, 1);
        }
    }

    #[test]
    fn test_reflect_boundary() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(3, 5), 3);
        assert_eq!(reflect(-7, 1), 0);
    }

    #[test]
    fn test_constant_image_has_zero_log() {
        let image = Buffer2::new(20, 15, vec![0.4; 300]);
        let response = negative_log(&image, 2.0);
        assert!(response.pixels().iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn test_log_peaks_on_bright_spot() {
        let image = Buffer2::from_fn(31, 31, |x, y| {
            let dx = x as f32 - 15.0;
            let dy = y as f32 - 15.0;
            (-(dx * dx + dy * dy) / 8.0).exp()
        });
        let response = negative_log(&image, 2.0);
        let center = *response.get(15, 15);
        assert!(center > 0.0);
        assert!(response.pixels().iter().all(|&v| v <= center));
    }

    #[test]
    fn test_rows_then_cols_matches_smoothing() {
        let mut image = Buffer2::new_default(9, 9);
        *image.get_mut(4, 4) = 1.0f32;
        let k = gaussian_kernel_1d(1.0);
        let smoothed = convolve_cols(&convolve_rows(&image, &k), &k);
        let total: f32 = smoothed.pixels().iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!((smoothed.get(4, 3) - smoothed.get(3, 4)).abs() < 1e-6);
    }
}
