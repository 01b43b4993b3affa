//! Point-source validation for LoG blobs.
//!
//! A blob survives when its neighbourhood looks like a compact, roughly round
//! peak over a darker background. Checks run on the equalized image in this
//! order, first failure wins:
//!
//! 1. The center must lie inside the image; the window has radius
//!    `max(⌊3σ⌋, 3)` and is clipped to the image.
//! 2. The center pixel must reach `min_center_value`.
//! 3. Halo (`1.3σ² ≤ d² ≤ 2.3σ²`) and background (`3.8σ² < d² ≤ 8σ²`)
//!    annuli must be non-empty.
//! 4. `center - max(halo, bg)` must reach `min_prominence`, and the halo mean
//!    must sit strictly between `bg + 0.03` and `center - 0.03`.
//! 5. The bright core (`≥ bg + 0.65 (center - bg)`) must cover between 0.2
//!    and 2.0 times `πσ²` with at least 5 pixels, and the eigenvalue ratio of
//!    its coordinate covariance must reach `axis_ratio_limit`.
//! 6. No pixel outside the three masks may exceed `0.95 · center`.

use std::f64::consts::PI;

use common::Buffer2;

use super::blob::Blob;
use super::config::StarDetectionParams;

const INNER_MAX: f64 = 1.2;
const HALO_MIN: f64 = 1.3;
const HALO_MAX: f64 = 2.3;
const BACKGROUND_MIN: f64 = 3.8;
const BACKGROUND_MAX: f64 = 8.0;
const HALO_MARGIN: f64 = 0.03;
const CORE_LEVEL: f64 = 0.65;
const CORE_AREA_RANGE: (f64, f64) = (0.2, 2.0);
const MIN_CORE_PIXELS: usize = 5;
const EDGE_LEVEL: f64 = 0.95;

/// Why a blob was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    OutOfBounds,
    DimCenter,
    EmptyAnnulus,
    LowProminence,
    FlatHalo,
    CoreSize,
    Elongated,
    BrightSurroundings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Inner,
    Halo,
    Background,
    Outside,
}

fn zone(d2: f64, sigma_sq: f64) -> Zone {
    if d2 <= INNER_MAX * sigma_sq {
        Zone::Inner
    } else if d2 >= HALO_MIN * sigma_sq && d2 <= HALO_MAX * sigma_sq {
        Zone::Halo
    } else if d2 > BACKGROUND_MIN * sigma_sq && d2 <= BACKGROUND_MAX * sigma_sq {
        Zone::Background
    } else {
        Zone::Outside
    }
}

/// Validate one blob against `image`.
pub fn validate_blob(image: &Buffer2<f32>, blob: &Blob, params: &StarDetectionParams) -> Result<(), Rejection> {
    let sigma = blob.sigma;
    if !(sigma > 0.0) {
        return Err(Rejection::OutOfBounds);
    }
    let sigma_sq = sigma * sigma;
    let radius = ((3.0 * sigma) as i64).max(3);
    let cy = blob.row.round() as i64;
    let cx = blob.col.round() as i64;
    let (width, height) = (image.width() as i64, image.height() as i64);
    if cy < 0 || cx < 0 || cy >= height || cx >= width {
        return Err(Rejection::OutOfBounds);
    }

    let window: Vec<(i64, i64, f64, f64)> = ((cy - radius).max(0)..(cy + radius + 1).min(height))
        .flat_map(|y| {
            ((cx - radius).max(0)..(cx + radius + 1).min(width)).map(move |x| {
                let d2 = ((y - cy).pow(2) + (x - cx).pow(2)) as f64;
                (x, y, d2, *image.get(x as usize, y as usize) as f64)
            })
        })
        .collect();

    let center = *image.get(cx as usize, cy as usize) as f64;
    if center < params.min_center_value {
        return Err(Rejection::DimCenter);
    }

    let mut halo = Mean::default();
    let mut background = Mean::default();
    for &(_, _, d2, v) in &window {
        match zone(d2, sigma_sq) {
            Zone::Halo => halo.add(v),
            Zone::Background => background.add(v),
            Zone::Inner | Zone::Outside => {}
        }
    }
    let (Some(halo), Some(bg)) = (halo.value(), background.value()) else {
        return Err(Rejection::EmptyAnnulus);
    };

    if center - halo.max(bg) < params.min_prominence {
        return Err(Rejection::LowProminence);
    }
    if !(halo > bg + HALO_MARGIN && halo < center - HALO_MARGIN) {
        return Err(Rejection::FlatHalo);
    }

    let core_threshold = bg + CORE_LEVEL * (center - bg);
    let core: Vec<(f64, f64)> = window
        .iter()
        .filter(|&&(_, _, _, v)| v >= core_threshold)
        .map(|&(x, y, _, _)| (y as f64, x as f64))
        .collect();
    let theoretical = PI * sigma_sq;
    let area = core.len() as f64;
    if core.is_empty()
        || area < CORE_AREA_RANGE.0 * theoretical
        || area > CORE_AREA_RANGE.1 * theoretical
        || core.len() < MIN_CORE_PIXELS
    {
        return Err(Rejection::CoreSize);
    }
    let (major, minor) = covariance_eigenvalues(&core);
    if major <= 0.0 || minor / major < params.axis_ratio_limit {
        return Err(Rejection::Elongated);
    }

    let edge_limit = EDGE_LEVEL * center;
    if window.iter().any(|&(_, _, d2, v)| zone(d2, sigma_sq) == Zone::Outside && v > edge_limit) {
        return Err(Rejection::BrightSurroundings);
    }

    Ok(())
}

#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Eigenvalues `(largest, smallest)` of the 2×2 sample covariance of `points`.
fn covariance_eigenvalues(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let (mut my, mut mx) = (0.0, 0.0);
    for &(y, x) in points {
        my += y;
        mx += x;
    }
    my /= n;
    mx /= n;

    let (mut syy, mut sxx, mut sxy) = (0.0, 0.0, 0.0);
    for &(y, x) in points {
        let (dy, dx) = (y - my, x - mx);
        syy += dy * dy;
        sxx += dx * dx;
        sxy += dx * dy;
    }
    let denom = (n - 1.0).max(1.0);
    let (a, c, b) = (syy / denom, sxx / denom, sxy / denom);

    let half_trace = (a + c) / 2.0;
    let disc = (((a - c) / 2.0).powi(2) + b * b).sqrt();
    (half_trace + disc, half_trace - disc)
}
