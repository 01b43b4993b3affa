//! The CPU-bound part of searching one raster, run on the blocking pool.

use std::path::{Path, PathBuf};

use glam::DVec2;
use rand::Rng;
use tracing::Span;

use crate::coords::{pixels_to_lonlat, points_to_pixels, CoordinateSpace};
use crate::matching::{estimate_partial_affine_lmeds, MatchResult, Pattern, PatternMatcher};
use crate::raster::{load_raster, GeoRaster};
use crate::render::{render_match_preview, render_star_overview};
use crate::star_detection::StarDetector;

use super::error::DetectionError;
use super::geojson::match_feature_collection;

/// One raster after detection and matching.
#[derive(Debug)]
pub struct RasterSearch {
    pub raster: GeoRaster,
    pub pattern: Pattern,
    pub result: MatchResult,
}

impl RasterSearch {
    /// Pattern points mapped through the fitted transform.
    pub fn projected_pattern(&self) -> Option<Vec<DVec2>> {
        self.result
            .transform
            .map(|t| t.apply_all(self.pattern.points()))
    }

    /// Pixel outline of the match: matched stars when there are at least two,
    /// else the projected pattern.
    pub fn outline(&self) -> Option<Vec<DVec2>> {
        match &self.result.matched_points {
            Some(points) if points.len() >= 2 => Some(points.clone()),
            _ => self.projected_pattern(),
        }
    }

    /// GeoJSON of [`Self::outline`] in WGS84.
    pub fn geojson(&self) -> Option<serde_json::Value> {
        let outline = self.outline()?;
        let lonlat = match pixels_to_lonlat(&outline, &self.raster.transform, self.raster.crs) {
            Ok(lonlat) => lonlat,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot map match outline to WGS84");
                return None;
            }
        };
        match_feature_collection(&lonlat, self.result.score)
    }
}

/// Load `path`, project the pattern into it, detect stars and match.
///
/// The final transform is a least-median-of-squares similarity fit over the
/// matched correspondences. `span` is entered for the whole call.
#[allow(clippy::too_many_arguments)]
pub fn search_in_raster<R: Rng>(
    path: &Path,
    pattern_points: &[DVec2],
    space: CoordinateSpace,
    pattern_name: &str,
    detector: &StarDetector,
    matcher: &PatternMatcher,
    rng: &mut R,
    span: &Span,
) -> Result<RasterSearch, DetectionError> {
    let _entered = span.enter();

    let raster = load_raster(path)?;
    let pixels = points_to_pixels(pattern_points, &raster.transform, raster.crs, space)?;
    let pattern = Pattern::new(pixels, Some(pattern_name.to_string()))?;

    let detection = detector.detect(&raster.pixels, span);
    let best = matcher.find(&detection.stars, &pattern, rng, span);

    let (transform, matched_points) = match &best {
        Some(found) => {
            let src = found.pattern_points(&pattern);
            let transform = estimate_partial_affine_lmeds(&src, &found.points, rng);
            (transform, Some(found.points.clone()))
        }
        None => (None, None),
    };
    let score = best.as_ref().map_or(0.0, |m| m.score);

    tracing::info!(
        stars = detection.stars.len(),
        score,
        matched = best.is_some(),
        "Raster searched"
    );

    Ok(RasterSearch {
        result: MatchResult {
            success: transform.is_some(),
            score,
            transform,
            matched_points,
            matches: best.into_iter().collect(),
            stars: detection.stars,
            source: path.to_path_buf(),
        },
        raster,
        pattern,
    })
}

/// Where the overlays of one raster go.
#[derive(Debug, Clone)]
pub struct ArtifactTargets {
    /// Written only for successful matches.
    pub preview: Option<PathBuf>,
    /// Written only when stars were detected.
    pub stars: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct WrittenArtifacts {
    pub preview: Option<PathBuf>,
    pub stars: Option<PathBuf>,
}

/// Render the overlays. Failures are logged and leave the slot empty.
pub fn render_artifacts(search: &RasterSearch, targets: &ArtifactTargets, span: &Span) -> WrittenArtifacts {
    let _entered = span.enter();
    let mut written = WrittenArtifacts::default();
    let image = &search.raster.pixels;

    if let Some(path) = &targets.preview {
        match render_match_preview(
            image,
            search.pattern.points(),
            &search.result.stars,
            search.result.best_match(),
            path,
        ) {
            Ok(()) => written.preview = Some(path.clone()),
            Err(e) => tracing::warn!(error = %e, "Failed to generate preview"),
        }
    }

    if let Some(path) = &targets.stars {
        let projected = search.projected_pattern();
        match render_star_overview(
            image,
            &search.result.stars,
            projected.as_deref(),
            search.result.matched_points.as_deref(),
            path,
        ) {
            Ok(()) => written.stars = Some(path.clone()),
            Err(e) => tracing::warn!(error = %e, "Failed to generate stars visualization"),
        }
    }

    written
}
