//! WGS84 ↔ raster CRS.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use glam::DVec2;
use proj4rs::Proj;

use super::ProjectionError;
use crate::raster::Crs;

const EARTH_RADIUS_M: f64 = 6_378_137.0;
const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_6;
const WGS84_PROJ4: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Point conversion between WGS84 lon/lat and one raster CRS.
///
/// Geographic CRSs are treated as WGS84. Web Mercator has a closed form.
/// Any other projected CRS is resolved from its EPSG code.
pub enum Reprojection {
    Identity,
    WebMercator,
    Proj {
        wgs84: Box<Proj>,
        native: Box<Proj>,
        native_is_latlong: bool,
    },
}

impl std::fmt::Debug for Reprojection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity => f.write_str("Identity"),
            Self::WebMercator => f.write_str("WebMercator"),
            Self::Proj { .. } => f.write_str("Proj"),
        }
    }
}

impl Reprojection {
    pub fn for_crs(crs: Crs) -> Result<Self, ProjectionError> {
        if crs.is_geographic() {
            return Ok(Self::Identity);
        }
        if crs.is_web_mercator() {
            return Ok(Self::WebMercator);
        }

        let unsupported = || ProjectionError::UnsupportedCrs {
            crs: crs.to_string(),
        };
        let code = crs
            .epsg()
            .and_then(|code| u16::try_from(code).ok())
            .ok_or_else(unsupported)?;
        let definition = crs_definitions::from_code(code).ok_or_else(unsupported)?;

        let native = Proj::from_proj_string(definition.proj4).map_err(|e| ProjectionError::Reprojection {
            reason: format!("{crs}: {e}"),
        })?;
        let wgs84 = Proj::from_proj_string(WGS84_PROJ4).map_err(|e| ProjectionError::Reprojection {
            reason: format!("WGS84: {e}"),
        })?;

        tracing::debug!(%crs, proj4 = definition.proj4, "Resolved raster CRS");
        Ok(Self::Proj {
            wgs84: Box::new(wgs84),
            native: Box::new(native),
            native_is_latlong: definition.proj4.contains("+proj=longlat"),
        })
    }

    /// WGS84 lon/lat → raster CRS.
    pub fn forward(&self, lonlat: DVec2) -> Result<DVec2, ProjectionError> {
        match self {
            Self::Identity => Ok(lonlat),
            Self::WebMercator => Ok(web_mercator_forward(lonlat)),
            Self::Proj {
                wgs84,
                native,
                native_is_latlong,
            } => {
                let out = run(wgs84, native, (lonlat.x.to_radians(), lonlat.y.to_radians()))?;
                Ok(if *native_is_latlong {
                    DVec2::new(out.x.to_degrees(), out.y.to_degrees())
                } else {
                    out
                })
            }
        }
    }

    /// Raster CRS → WGS84 lon/lat.
    pub fn inverse(&self, world: DVec2) -> Result<DVec2, ProjectionError> {
        match self {
            Self::Identity => Ok(world),
            Self::WebMercator => Ok(web_mercator_inverse(world)),
            Self::Proj {
                wgs84,
                native,
                native_is_latlong,
            } => {
                let input = if *native_is_latlong {
                    (world.x.to_radians(), world.y.to_radians())
                } else {
                    (world.x, world.y)
                };
                let out = run(native, wgs84, input)?;
                Ok(DVec2::new(out.x.to_degrees(), out.y.to_degrees()))
            }
        }
    }
}

fn run(src: &Proj, dst: &Proj, (x, y): (f64, f64)) -> Result<DVec2, ProjectionError> {
    let mut point = (x, y, 0.0);
    proj4rs::transform::transform(src, dst, &mut point).map_err(|e| ProjectionError::Reprojection {
        reason: e.to_string(),
    })?;
    let out = DVec2::new(point.0, point.1);
    if !out.is_finite() {
        return Err(ProjectionError::Reprojection {
            reason: format!("non-finite result for ({x}, {y})"),
        });
    }
    Ok(out)
}

fn web_mercator_forward(lonlat: DVec2) -> DVec2 {
    let lat = lonlat.y.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT).to_radians();
    DVec2::new(
        EARTH_RADIUS_M * lonlat.x.to_radians(),
        EARTH_RADIUS_M * (FRAC_PI_4 + lat / 2.0).tan().ln(),
    )
}

fn web_mercator_inverse(xy: DVec2) -> DVec2 {
    DVec2::new(
        (xy.x / EARTH_RADIUS_M).to_degrees(),
        (2.0 * (xy.y / EARTH_RADIUS_M).exp().atan() - FRAC_PI_2).to_degrees(),
    )
}
