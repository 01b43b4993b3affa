//! Affine geotransform and coordinate reference system of a raster.

use std::fmt;

use glam::DVec2;

/// Forward pixel→world mapping:
///
/// ```text
/// x = a * col + b * row + c
/// y = d * col + e * row + f
/// ```
///
/// `(col, row)` here are continuous coordinates of the pixel grid's corner
/// system, i.e. the top-left corner of pixel (0, 0) is `(0.0, 0.0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 0.0,
        e: 1.0,
        f: 0.0,
    };

    /// North-up transform from the world position of the top-left corner and
    /// the pixel size.
    pub fn north_up(origin: DVec2, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            a: pixel_width,
            b: 0.0,
            c: origin.x,
            d: 0.0,
            e: -pixel_height,
            f: origin.y,
        }
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    pub fn is_invertible(&self) -> bool {
        self.determinant().abs() > f64::EPSILON
    }

    /// Maps continuous grid coordinates `(col, row)` to world coordinates.
    pub fn apply(&self, grid: DVec2) -> DVec2 {
        DVec2::new(
            self.a * grid.x + self.b * grid.y + self.c,
            self.d * grid.x + self.e * grid.y + self.f,
        )
    }

    /// Maps world coordinates back to continuous grid coordinates.
    /// Returns `None` when the transform is singular.
    pub fn apply_inverse(&self, world: DVec2) -> Option<DVec2> {
        let det = self.determinant();
        if det.abs() <= f64::EPSILON {
            return None;
        }
        let dx = world.x - self.c;
        let dy = world.y - self.f;
        Some(DVec2::new(
            (self.e * dx - self.b * dy) / det,
            (-self.d * dx + self.a * dy) / det,
        ))
    }

    /// Shifts the origin by half a pixel, converting a PixelIsPoint
    /// georeference into the PixelIsArea convention used here.
    pub(crate) fn shifted_to_area(self) -> Self {
        Self {
            c: self.c - 0.5 * self.a - 0.5 * self.b,
            f: self.f - 0.5 * self.d - 0.5 * self.e,
            ..self
        }
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Coordinate reference system as declared by the raster's GeoKeys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// Longitude/latitude in degrees. `epsg` is `None` for user-defined datums.
    Geographic { epsg: Option<u32> },
    /// Projected coordinates in linear units.
    Projected { epsg: Option<u32> },
}

pub const EPSG_WGS84: u32 = 4326;
pub const EPSG_WEB_MERCATOR: u32 = 3857;
const WEB_MERCATOR_ALIASES: [u32; 3] = [3857, 3785, 900913];

impl Crs {
    pub const WGS84: Self = Self::Geographic {
        epsg: Some(EPSG_WGS84),
    };

    pub const WEB_MERCATOR: Self = Self::Projected {
        epsg: Some(EPSG_WEB_MERCATOR),
    };

    pub fn is_geographic(&self) -> bool {
        matches!(self, Self::Geographic { .. })
    }

    pub fn epsg(&self) -> Option<u32> {
        match self {
            Self::Geographic { epsg } | Self::Projected { epsg } => *epsg,
        }
    }

    pub fn is_web_mercator(&self) -> bool {
        matches!(self, Self::Projected { epsg: Some(code) } if WEB_MERCATOR_ALIASES.contains(code))
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.epsg() {
            Some(code) => write!(f, "EPSG:{}", code),
            None if self.is_geographic() => write!(f, "user-defined geographic"),
            None => write!(f, "user-defined projected"),
        }
    }
}

/// GeoKey ids from the GeoTIFF 1.0 key directory.
mod geokey {
    pub const MODEL_TYPE: u32 = 1024;
    pub const RASTER_TYPE: u32 = 1025;
    pub const GEOGRAPHIC_TYPE: u32 = 2048;
    pub const PROJECTED_CS_TYPE: u32 = 3072;

    pub const MODEL_TYPE_PROJECTED: u32 = 1;
    pub const MODEL_TYPE_GEOGRAPHIC: u32 = 2;
    pub const RASTER_PIXEL_IS_POINT: u32 = 2;
    pub const USER_DEFINED: u32 = 32767;
}

/// Values pulled out of a `GeoKeyDirectoryTag`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GeoKeys {
    pub crs: Option<Crs>,
    pub pixel_is_point: bool,
}

/// Parses the short-valued entries of a GeoKey directory.
///
/// Entries whose value lives in another tag (`location != 0`) are ignored;
/// every key read here is stored inline.
pub(crate) fn parse_geokeys(directory: &[u32]) -> Result<GeoKeys, String> {
    if directory.len() < 4 {
        return Err(format!(
            "GeoKey directory header truncated ({} values)",
            directory.len()
        ));
    }

    let count = directory[3] as usize;
    let entries = &directory[4..];
    if entries.len() < count * 4 {
        return Err(format!(
            "GeoKey directory declares {} keys but holds {}",
            count,
            entries.len() / 4
        ));
    }

    let mut model_type = None;
    let mut geographic_code = None;
    let mut projected_code = None;
    let mut pixel_is_point = false;

    for entry in entries.chunks_exact(4).take(count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 {
            continue;
        }
        match key {
            geokey::MODEL_TYPE => model_type = Some(value),
            geokey::RASTER_TYPE => pixel_is_point = value == geokey::RASTER_PIXEL_IS_POINT,
            geokey::GEOGRAPHIC_TYPE => geographic_code = Some(value),
            geokey::PROJECTED_CS_TYPE => projected_code = Some(value),
            _ => {}
        }
    }

    let known = |code: Option<u32>| code.filter(|c| *c != geokey::USER_DEFINED && *c != 0);

    let crs = match model_type {
        Some(geokey::MODEL_TYPE_PROJECTED) => Some(Crs::Projected {
            epsg: known(projected_code),
        }),
        Some(geokey::MODEL_TYPE_GEOGRAPHIC) => Some(Crs::Geographic {
            epsg: known(geographic_code),
        }),
        _ if projected_code.is_some() => Some(Crs::Projected {
            epsg: known(projected_code),
        }),
        _ if geographic_code.is_some() => Some(Crs::Geographic {
            epsg: known(geographic_code),
        }),
        _ => None,
    };

    Ok(GeoKeys {
        crs,
        pixel_is_point,
    })
}

/// Builds the forward transform from either a 4x4 model transformation
/// matrix or a tie point plus pixel scale.
pub(crate) fn transform_from_tags(
    model_transformation: Option<&[f64]>,
    tiepoints: Option<&[f64]>,
    pixel_scale: Option<&[f64]>,
) -> Result<Option<GeoTransform>, String> {
    if let Some(m) = model_transformation {
        if m.len() < 16 {
            return Err(format!(
                "ModelTransformationTag needs 16 values, found {}",
                m.len()
            ));
        }
        return Ok(Some(GeoTransform {
            a: m[0],
            b: m[1],
            c: m[3],
            d: m[4],
            e: m[5],
            f: m[7],
        }));
    }

    match (tiepoints, pixel_scale) {
        (Some(tie), Some(scale)) => {
            if tie.len() < 6 || scale.len() < 2 {
                return Err(format!(
                    "tie point ({} values) or pixel scale ({} values) too short",
                    tie.len(),
                    scale.len()
                ));
            }
            let (i, j, x, y) = (tie[0], tie[1], tie[3], tie[4]);
            let (sx, sy) = (scale[0], scale[1]);
            Ok(Some(GeoTransform::north_up(
                DVec2::new(x - i * sx, y + j * sy),
                sx,
                sy,
            )))
        }
        (None, None) => Ok(None),
        (Some(_), None) => Err("tie point present without ModelPixelScaleTag".to_string()),
        (None, Some(_)) => Err("ModelPixelScaleTag present without tie point".to_string()),
    }
}
