use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when loading a georeferenced raster from disk.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Failed to open raster '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to decode raster '{path}': {source}")]
    Decode {
        path: PathBuf,
        source: tiff::TiffError,
    },

    #[error("Unsupported raster layout in '{path}': {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("Invalid georeferencing in '{path}': {reason}")]
    Georeference { path: PathBuf, reason: String },
}
