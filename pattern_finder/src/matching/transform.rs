//! 2×3 affine transforms and the similarity estimators used for matching.
//!
//! All estimators work in `(x, y)` = `(col, row)` pixel space and never produce
//! reflections.

use common::EPSILON;
use glam::DVec2;
use nalgebra::Matrix2;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Pair hypotheses evaluated by the least-median fit before switching from
/// exhaustive enumeration to random sampling.
const MAX_LMEDS_HYPOTHESES: usize = 2000;

/// Row-major 2×3 affine matrix `[[a, b, tx], [c, d, ty]]`.
///
/// Serializes as a nested array, matching the response format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Affine2(pub [[f64; 3]; 2]);

impl Affine2 {
    pub const IDENTITY: Self = Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);

    /// `p ↦ scale · R(angle) · p + translation`.
    pub fn similarity(scale: f64, angle: f64, translation: DVec2) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self([
            [scale * cos, -scale * sin, translation.x],
            [scale * sin, scale * cos, translation.y],
        ])
    }

    fn from_linear(linear: &Matrix2<f64>, translation: DVec2) -> Self {
        Self([
            [linear[(0, 0)], linear[(0, 1)], translation.x],
            [linear[(1, 0)], linear[(1, 1)], translation.y],
        ])
    }

    #[inline]
    pub fn apply(&self, p: DVec2) -> DVec2 {
        let m = &self.0;
        DVec2::new(
            m[0][0] * p.x + m[0][1] * p.y + m[0][2],
            m[1][0] * p.x + m[1][1] * p.y + m[1][2],
        )
    }

    pub fn apply_all(&self, points: &[DVec2]) -> Vec<DVec2> {
        points.iter().map(|&p| self.apply(p)).collect()
    }

    /// Uniform scale, exact for similarities.
    pub fn scale(&self) -> f64 {
        let m = &self.0;
        (m[0][0] * m[1][1] - m[0][1] * m[1][0]).abs().sqrt()
    }

    /// Rotation angle in radians, exact for similarities.
    pub fn rotation(&self) -> f64 {
        self.0[1][0].atan2(self.0[0][0])
    }

    pub fn translation(&self) -> DVec2 {
        DVec2::new(self.0[0][2], self.0[1][2])
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite())
    }
}

pub(crate) fn centroid(points: &[DVec2]) -> DVec2 {
    if points.is_empty() {
        return DVec2::ZERO;
    }
    points.iter().copied().sum::<DVec2>() / points.len() as f64
}

/// Similarity from the SVD of the cross-covariance.
///
/// Rotation is `V Uᵀ` with the last singular vector flipped when that would
/// be a reflection. Scale is the ratio of summed centroid distances.
pub fn estimate_similarity_svd(src: &[DVec2], dst: &[DVec2]) -> Option<Affine2> {
    if src.len() < 2 || src.len() != dst.len() {
        return None;
    }

    let src_mean = centroid(src);
    let dst_mean = centroid(dst);

    let mut h = Matrix2::<f64>::zeros();
    let mut src_spread = 0.0;
    let mut dst_spread = 0.0;
    for (s, d) in src.iter().zip(dst) {
        let s = *s - src_mean;
        let d = *d - dst_mean;
        h[(0, 0)] += s.x * d.x;
        h[(0, 1)] += s.x * d.y;
        h[(1, 0)] += s.y * d.x;
        h[(1, 1)] += s.y * d.y;
        src_spread += s.length();
        dst_spread += d.length();
    }
    if src_spread < EPSILON {
        return None;
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let mut v_t = svd.v_t?;
    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        v_t[(1, 0)] = -v_t[(1, 0)];
        v_t[(1, 1)] = -v_t[(1, 1)];
        rotation = v_t.transpose() * u.transpose();
    }

    let linear = rotation * (dst_spread / src_spread);
    let t = dst_mean - mul(&linear, src_mean);
    let transform = Affine2::from_linear(&linear, t);
    transform.is_finite().then_some(transform)
}

#[inline]
fn mul(m: &Matrix2<f64>, p: DVec2) -> DVec2 {
    DVec2::new(m[(0, 0)] * p.x + m[(0, 1)] * p.y, m[(1, 0)] * p.x + m[(1, 1)] * p.y)
}

/// Closed-form least-squares similarity (rotation from `atan2`, scale by
/// projection onto the rotated source).
pub fn estimate_similarity_ls(src: &[DVec2], dst: &[DVec2]) -> Option<Affine2> {
    if src.len() < 2 || src.len() != dst.len() {
        return None;
    }

    let src_mean = centroid(src);
    let dst_mean = centroid(dst);

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syx = 0.0;
    let mut syy = 0.0;
    let mut src_var = 0.0;
    for (s, d) in src.iter().zip(dst) {
        let r = *s - src_mean;
        let t = *d - dst_mean;
        sxx += r.x * t.x;
        sxy += r.x * t.y;
        syx += r.y * t.x;
        syy += r.y * t.y;
        src_var += r.length_squared();
    }
    if src_var < 1e-10 {
        return None;
    }

    let angle = (sxy - syx).atan2(sxx + syy);
    let (sin_a, cos_a) = angle.sin_cos();
    let scale = ((sxx + syy) * cos_a + (sxy - syx) * sin_a) / src_var;
    if scale <= 0.0 {
        return None;
    }

    let t = DVec2::new(
        dst_mean.x - scale * (cos_a * src_mean.x - sin_a * src_mean.y),
        dst_mean.y - scale * (sin_a * src_mean.x + cos_a * src_mean.y),
    );
    Some(Affine2::similarity(scale, angle, t))
}

/// Robust 4-DOF fit (rotation, uniform scale, translation) by least median
/// of squares.
///
/// Every pair of correspondences yields an exact hypothesis; all pairs are
/// tried when there are few enough, otherwise `rng` samples them. The
/// hypothesis with the smallest median squared residual wins and is then
/// refined by least squares over the correspondences within
/// `2.5 · 1.4826 · (1 + 5 / (n - 2)) · √median`.
pub fn estimate_partial_affine_lmeds<R: Rng>(
    src: &[DVec2],
    dst: &[DVec2],
    rng: &mut R,
) -> Option<Affine2> {
    let n = src.len();
    if n < 2 || n != dst.len() {
        return None;
    }
    if n == 2 {
        return estimate_similarity_ls(src, dst);
    }

    let total_pairs = n * (n - 1) / 2;
    let pairs: Vec<(usize, usize)> = if total_pairs <= MAX_LMEDS_HYPOTHESES {
        (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect()
    } else {
        (0..MAX_LMEDS_HYPOTHESES)
            .map(|_| {
                let i = rng.random_range(0..n);
                let j = (i + rng.random_range(1..n)) % n;
                (i.min(j), i.max(j))
            })
            .collect()
    };

    let mut residuals = vec![0.0f64; n];
    let mut best: Option<(Affine2, f64)> = None;
    for (i, j) in pairs {
        if src[i].distance(src[j]) < EPSILON || dst[i].distance(dst[j]) < EPSILON {
            continue;
        }
        let Some(model) = estimate_similarity_ls(&[src[i], src[j]], &[dst[i], dst[j]]) else {
            continue;
        };
        for (r, (s, d)) in residuals.iter_mut().zip(src.iter().zip(dst)) {
            *r = model.apply(*s).distance_squared(*d);
        }
        let median = median_in_place(&mut residuals);
        if best.as_ref().map_or(true, |(_, m)| median < *m) {
            best = Some((model, median));
        }
    }

    let (model, median) = best?;
    let sigma = 2.5 * 1.4826 * (1.0 + 5.0 / (n as f64 - 2.0)) * median.sqrt();
    let limit = (sigma * sigma).max(EPSILON * EPSILON);

    let (inlier_src, inlier_dst): (Vec<DVec2>, Vec<DVec2>) = src
        .iter()
        .zip(dst)
        .filter(|(s, d)| model.apply(**s).distance_squared(**d) <= limit)
        .map(|(s, d)| (*s, *d))
        .unzip();

    Some(estimate_similarity_ls(&inlier_src, &inlier_dst).unwrap_or(model))
}

/// Upper median of `values` (reorders the slice).
fn median_in_place(values: &mut [f64]) -> f64 {
    let mid = values.len() / 2;
    let (_, median, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *median
}
