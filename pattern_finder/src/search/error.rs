use std::path::PathBuf;

use thiserror::Error;

use crate::coords::ProjectionError;
use crate::matching::PatternError;
use crate::raster::RasterError;
use crate::star_detection::ParamsError;

/// Request rejected before any file is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("linePoints must contain at least three coordinates.")]
    TooFewPoints { found: usize },

    #[error("linePoints[{index}] is not a finite coordinate.")]
    NonFinitePoint { index: usize },

    #[error("patternName must be at most {max} characters, got {len}.")]
    PatternNameTooLong { len: usize, max: usize },

    #[error("verifyTolPx must be at least 0.1, got {0}.")]
    VerifyTolerance(f64),

    #[error("scoreThreshold must be within [0, 1], got {0}.")]
    ScoreThreshold(f64),

    #[error("starParams.max_sigma must be greater or equal to min_sigma.")]
    SigmaRange { min: f64, max: f64 },

    #[error("Invalid starParams: {0}")]
    StarParams(#[from] ParamsError),
}

/// Failure talking to the dataset catalog.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("Dataset server request failed ({status}).")]
    Status { status: u16, body: String },

    #[error("Dataset server is unavailable.")]
    Unavailable { reason: String },

    #[error("Dataset server returned invalid JSON.")]
    InvalidJson { reason: String },
}

impl CatalogError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Asset could not be chosen or fetched for one file.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("No downloadable assets available for dataset file {file_id}.")]
    Unavailable { file_id: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Downloaded asset exceeded configured size limit.")]
    TooLarge { limit: u64 },

    #[error("Cannot write downloaded asset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download cancelled.")]
    Cancelled,
}

/// MBTiles to GeoTIFF conversion failure.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("{binary} command not found. It is required to process MBTiles files.")]
    NotFound { binary: String },

    #[error("Cannot run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to convert MBTiles to GeoTIFF: {detail}")]
    Failed { code: Option<i32>, detail: String },

    #[error("Failed to convert MBTiles to GeoTIFF: no output written to {path}")]
    MissingOutput { path: PathBuf },

    #[error("Cannot remove stale conversion output {path}: {source}")]
    StaleOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} timed out after {seconds} seconds")]
    TimedOut { binary: String, seconds: f64 },

    #[error("Conversion cancelled.")]
    Cancelled,
}

/// Failure while loading, projecting, detecting or matching one raster.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("Analysis worker failed: {0}")]
    Worker(String),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Dataset file(s) not found: {}", .0.join(", "))]
    FileNotFound(Vec<String>),

    #[error("Dataset file(s) are not READY: {}", .0.join(", "))]
    FileNotReady(Vec<String>),

    #[error("No READY files available in the selected dataset.")]
    NoFilesAvailable,

    #[error("Cannot prepare run directory {path}: {source}")]
    RunDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
