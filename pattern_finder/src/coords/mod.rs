//! Geographic ↔ pixel conversion for pattern points.
//!
//! Pixel coordinates use the pixel-center convention: `(col, row)` = `(0, 0)`
//! is the center of the top-left pixel, matching the positions reported by the
//! star detector. The affine geotransform works on the corner grid, so every
//! conversion shifts by half a pixel.


mod parse;
mod reproject;

use glam::DVec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raster::{Crs, GeoTransform};

pub use parse::{parse_pattern, PatternInput, PatternParseError};
pub use reproject::Reprojection;

/// How a request's pattern coordinates should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSpace {
    /// Classify by value range; see [`looks_geographic`].
    #[default]
    Auto,
    /// WGS84 longitude/latitude.
    Geographic,
    /// Already `(col, row)` pixel positions.
    Pixel,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProjectionError {
    #[error("Raster has no coordinate reference system; geographic points cannot be placed")]
    MissingCrs,

    #[error("No projection definition for raster CRS {crs}")]
    UnsupportedCrs { crs: String },

    #[error("Reprojection failed: {reason}")]
    Reprojection { reason: String },

    #[error("Raster transform is not invertible")]
    SingularTransform,

    #[error("Pattern line points conversion failed: {found} usable points")]
    TooFewPoints { found: usize },
}

/// Range heuristic: every x within [-180, 180] and every y within [-90, 90].
///
/// Small pixel coordinates near the origin are misclassified as geographic;
/// callers that know better pass an explicit [`CoordinateSpace`].
pub fn looks_geographic(points: &[DVec2]) -> bool {
    !points.is_empty()
        && points
            .iter()
            .all(|p| (-180.0..=180.0).contains(&p.x) && (-90.0..=90.0).contains(&p.y))
}

/// Project pattern points into the raster's `(col, row)` pixel space.
///
/// Geographic input is reprojected from WGS84 into the raster CRS and mapped
/// through the inverse geotransform. With [`CoordinateSpace::Auto`], a raster
/// without a CRS treats its input as pixel coordinates. Non-finite results are
/// dropped; fewer than two remaining points is an error.
pub fn points_to_pixels(
    points: &[DVec2],
    transform: &GeoTransform,
    crs: Option<Crs>,
    space: CoordinateSpace,
) -> Result<Vec<DVec2>, ProjectionError> {
    let geographic = match space {
        CoordinateSpace::Geographic => true,
        CoordinateSpace::Pixel => false,
        CoordinateSpace::Auto => crs.is_some() && looks_geographic(points),
    };

    let pixels: Vec<DVec2> = if geographic {
        let crs = crs.ok_or(ProjectionError::MissingCrs)?;
        let reprojection = Reprojection::for_crs(crs)?;
        let mut out = Vec::with_capacity(points.len());
        for &p in points {
            let world = reprojection.forward(p)?;
            let grid = transform
                .apply_inverse(world)
                .ok_or(ProjectionError::SingularTransform)?;
            out.push(grid - DVec2::splat(0.5));
        }
        out
    } else {
        points.to_vec()
    };

    let pixels: Vec<DVec2> = pixels.into_iter().filter(|p| p.is_finite()).collect();
    if pixels.len() < 2 {
        return Err(ProjectionError::TooFewPoints {
            found: pixels.len(),
        });
    }

    tracing::debug!(
        geographic,
        count = pixels.len(),
        "Projected pattern into pixel space"
    );
    Ok(pixels)
}

/// Map `(col, row)` pixel positions to WGS84 longitude/latitude.
///
/// Uses the pixel center. Reprojects only when the CRS is known and not
/// already geographic.
pub fn pixels_to_lonlat(
    pixels: &[DVec2],
    transform: &GeoTransform,
    crs: Option<Crs>,
) -> Result<Vec<DVec2>, ProjectionError> {
    let reprojection = match crs {
        Some(crs) => Reprojection::for_crs(crs)?,
        None => Reprojection::Identity,
    };
    pixels
        .iter()
        .map(|&p| reprojection.inverse(transform.apply(p + DVec2::splat(0.5))))
        .collect()
}

/// WGS84 lon/lat → `crs` coordinates.
pub fn from_wgs84(lonlat: DVec2, crs: Crs) -> Result<DVec2, ProjectionError> {
    Reprojection::for_crs(crs)?.forward(lonlat)
}

/// `crs` coordinates → WGS84 lon/lat. Inverse of [`from_wgs84`].
pub fn to_wgs84(world: DVec2, crs: Crs) -> Result<DVec2, ProjectionError> {
    Reprojection::for_crs(crs)?.inverse(world)
}
