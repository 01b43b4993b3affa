//! Locating a pattern among detected stars.
//!
//! [`PatternMatcher`] runs RANSAC over minimal two-point similarity
//! hypotheses: two pattern points and two stars are drawn, the similarity
//! mapping one pair onto the other is computed, and every pattern point is
//! projected and snapped to its nearest star. The hypothesis with the most
//! projections inside the tolerance is refit on all of its correspondences and
//! scored by inlier ratio.
//!
//! Randomness is always injected so runs are reproducible from a seed.


mod spatial;
mod transform;

use std::path::PathBuf;

use glam::DVec2;
use rand::prelude::*;
use thiserror::Error;
use tracing::Span;

use crate::star_detection::Star;

pub use spatial::KdTree;
pub use transform::{
    estimate_partial_affine_lmeds, estimate_similarity_ls, estimate_similarity_svd, Affine2,
};

use common::EPSILON;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatternError {
    #[error("A pattern needs at least 2 points, got {0}")]
    TooFewPoints(usize),
    #[error("Pattern point {0} is not finite")]
    NonFinite(usize),
}

/// Ordered pattern points in `(x, y)` pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    points: Vec<DVec2>,
    name: Option<String>,
}

impl Pattern {
    pub fn new(points: Vec<DVec2>, name: Option<String>) -> Result<Self, PatternError> {
        if points.len() < 2 {
            return Err(PatternError::TooFewPoints(points.len()));
        }
        if let Some(i) = points.iter().position(|p| !p.is_finite()) {
            return Err(PatternError::NonFinite(i));
        }
        Ok(Self { points, name })
    }

    pub fn points(&self) -> &[DVec2] {
        &self.points
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Pattern point `pattern_index` snapped to star `star_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Correspondence {
    pub pattern_index: usize,
    pub star_index: usize,
}

/// The best placement of a pattern among a star set.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    /// First matched star.
    pub anchor_index: usize,
    /// Star indices of the inliers, in pattern order.
    pub matched_indices: Vec<usize>,
    pub correspondences: Vec<Correspondence>,
    /// Matched star positions `(x, y)`, parallel to `matched_indices`.
    pub points: Vec<DVec2>,
    /// Inlier ratio in [0, 1].
    pub score: f64,
    /// Refined similarity from pattern to image.
    pub transform: Affine2,
}

impl PatternMatch {
    /// Pattern points of the correspondences, parallel to `points`.
    pub fn pattern_points(&self, pattern: &Pattern) -> Vec<DVec2> {
        self.correspondences
            .iter()
            .map(|c| pattern.points()[c.pattern_index])
            .collect()
    }
}

/// Outcome of detecting and matching in one raster.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub success: bool,
    pub score: f64,
    /// Absent whenever `success` is false.
    pub transform: Option<Affine2>,
    pub matched_points: Option<Vec<DVec2>>,
    pub matches: Vec<PatternMatch>,
    pub stars: Vec<Star>,
    pub source: PathBuf,
}

impl MatchResult {
    pub fn best_match(&self) -> Option<&PatternMatch> {
        self.matches.first()
    }
}

/// RANSAC configuration.
#[derive(Debug, Clone)]
pub struct RansacConfig {
    pub max_iterations: usize,
    /// A projected point is an inlier when its nearest star is strictly closer than this (pixels).
    pub tolerance: f64,
    pub min_inlier_ratio: f64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 3.0,
            min_inlier_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternMatcher {
    config: RansacConfig,
}

impl PatternMatcher {
    pub fn new(config: RansacConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RansacConfig {
        &self.config
    }

    /// Best single placement of `pattern` among `stars`, if any satisfies the
    /// inlier ratio. Fewer than 3 pattern points or fewer stars than pattern
    /// points yields `None`.
    pub fn find<R: Rng>(
        &self,
        stars: &[Star],
        pattern: &Pattern,
        rng: &mut R,
        span: &Span,
    ) -> Option<PatternMatch> {
        let _entered = span.enter();
        let n = pattern.len();
        let m = stars.len();
        if n < 3 || m < n {
            tracing::debug!(pattern_points = n, stars = m, "Not enough points to match");
            return None;
        }

        let star_points: Vec<DVec2> = stars.iter().map(Star::position).collect();
        let tree = KdTree::build(&star_points)?;
        let pattern_points = pattern.points();
        let required = required_inliers(n, self.config.min_inlier_ratio);

        let mut best: Vec<Correspondence> = Vec::new();
        let mut best_count: Option<usize> = None;
        let mut iterations = 0;

        while iterations < self.config.max_iterations {
            iterations += 1;

            let (p0, p1) = sample_pair(rng, n);
            let (s0, s1) = sample_pair(rng, m);
            let src = [pattern_points[p0], pattern_points[p1]];
            let dst = [star_points[s0], star_points[s1]];
            if src[0].distance(src[1]) < EPSILON || dst[0].distance(dst[1]) < EPSILON {
                continue;
            }

            let Some(hypothesis) = estimate_similarity_svd(&src, &dst) else {
                continue;
            };
            let inliers = self.inliers(&hypothesis, pattern_points, &tree);
            let count = inliers.len();
            if best_count.map_or(true, |b| count > b) {
                best_count = Some(count);
                best = inliers;
            }
            if count == n {
                break;
            }
        }

        let best_count = best_count.unwrap_or(0);
        if best_count < required {
            tracing::debug!(iterations, best_count, required, "No hypothesis reached the inlier count");
            return None;
        }

        let src: Vec<DVec2> = best.iter().map(|c| pattern_points[c.pattern_index]).collect();
        let dst: Vec<DVec2> = best.iter().map(|c| star_points[c.star_index]).collect();
        let refined = estimate_similarity_svd(&src, &dst)?;

        let correspondences = self.inliers(&refined, pattern_points, &tree);
        let score = correspondences.len() as f64 / n as f64;
        if score < self.config.min_inlier_ratio || correspondences.is_empty() {
            tracing::debug!(iterations, score, "Refined hypothesis fell below the inlier ratio");
            return None;
        }

        let matched_indices: Vec<usize> = correspondences.iter().map(|c| c.star_index).collect();
        let points = matched_indices.iter().map(|&i| star_points[i]).collect();
        tracing::debug!(iterations, score, inliers = correspondences.len(), "Pattern matched");

        Some(PatternMatch {
            anchor_index: matched_indices[0],
            matched_indices,
            correspondences,
            points,
            score,
            transform: refined,
        })
    }

    fn inliers(&self, transform: &Affine2, pattern: &[DVec2], tree: &KdTree) -> Vec<Correspondence> {
        pattern
            .iter()
            .enumerate()
            .filter_map(|(pattern_index, &p)| {
                let (star_index, distance) = tree.nearest(transform.apply(p));
                (distance < self.config.tolerance).then_some(Correspondence {
                    pattern_index,
                    star_index,
                })
            })
            .collect()
    }
}

/// `ceil(n · ratio)`, tolerant of products like `10 · 0.7 = 7.000000000000001`.
pub fn required_inliers(n: usize, ratio: f64) -> usize {
    ((n as f64 * ratio) - 1e-9).ceil().max(0.0) as usize
}

/// Uniform ordered pair of distinct indices in `0..n`. Requires `n >= 2`.
fn sample_pair<R: Rng>(rng: &mut R, n: usize) -> (usize, usize) {
    let a = rng.random_range(0..n);
    let b = rng.random_range(0..n - 1);
    (a, if b >= a { b + 1 } else { b })
}
