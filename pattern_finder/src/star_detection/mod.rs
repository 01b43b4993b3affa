//! Point-source detection on normalized rasters.
//!
//! # Algorithm Overview
//!
//! 1. **Equalization**: CLAHE with kernel `max(32, min(h, w) / 8)` lifts faint
//!    sources in dark regions without blowing out bright ones.
//!
//! 2. **Blob detection**: Multi-scale Laplacian of Gaussian over the configured
//!    sigma schedule. Scale-space maxima above the threshold become blobs;
//!    overlapping blobs keep the larger scale.
//!
//! 3. **Validation**: Each blob's neighbourhood must look like a compact round
//!    peak over a darker background (see [`candidate`]).
//!
//! Reported positions are integer pixel centers `(row, col)`.

mod blob;
pub mod candidate;
mod clahe;
mod config;
mod convolution;


use std::collections::HashMap;

use common::Buffer2;
use glam::DVec2;
use tracing::Span;

pub use blob::{blob_overlap, detect_blobs, Blob};
pub use candidate::{validate_blob, Rejection};
pub use clahe::{adaptive_kernel_size, equalize_adapthist};
pub use config::{ParamsError, StarDetectionParams};
pub use convolution::negative_log;

/// A detected star at a pixel center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub row: f64,
    pub col: f64,
}

impl Star {
    /// Position as `(x, y)` = `(col, row)`.
    #[inline]
    pub fn position(&self) -> DVec2 {
        DVec2::new(self.col, self.row)
    }
}

impl From<DVec2> for Star {
    fn from(p: DVec2) -> Self {
        Self { row: p.y, col: p.x }
    }
}

/// Counts from each detection stage.
#[derive(Debug, Clone, Default)]
pub struct StarDetectionDiagnostics {
    pub blobs: usize,
    pub rejected: HashMap<Rejection, usize>,
    pub stars: usize,
}

#[derive(Debug, Clone)]
pub struct StarDetectionResult {
    pub stars: Vec<Star>,
    pub diagnostics: StarDetectionDiagnostics,
}

/// Star detector with validated parameters.
#[derive(Debug, Clone)]
pub struct StarDetector {
    params: StarDetectionParams,
}

impl StarDetector {
    pub fn new(params: StarDetectionParams) -> Result<Self, ParamsError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &StarDetectionParams {
        &self.params
    }

    /// Detect stars in a [0, 1] image.
    ///
    /// `span` is entered for the duration of the call so log events are
    /// attributed to the caller's file or run.
    pub fn detect(&self, image: &Buffer2<f32>, span: &Span) -> StarDetectionResult {
        let _entered = span.enter();
        let params = &self.params;

        if image.is_empty() {
            return StarDetectionResult {
                stars: Vec::new(),
                diagnostics: StarDetectionDiagnostics::default(),
            };
        }

        let kernel = adaptive_kernel_size(image.width(), image.height());
        let equalized = equalize_adapthist(image, kernel, params.clahe_clip_limit);

        let sigmas = params.sigma_schedule();
        let blobs = detect_blobs(&equalized, &sigmas, params.threshold as f32, params.overlap);

        let mut diagnostics = StarDetectionDiagnostics {
            blobs: blobs.len(),
            ..Default::default()
        };
        let mut stars = Vec::new();
        for blob in &blobs {
            match validate_blob(&equalized, blob, params) {
                Ok(()) => stars.push(Star {
                    row: blob.row,
                    col: blob.col,
                }),
                Err(reason) => *diagnostics.rejected.entry(reason).or_default() += 1,
            }
        }
        diagnostics.stars = stars.len();

        tracing::debug!(
            width = image.width(),
            height = image.height(),
            kernel,
            blobs = diagnostics.blobs,
            stars = diagnostics.stars,
            "Star detection finished"
        );
        if !diagnostics.rejected.is_empty() {
            tracing::trace!(rejected = ?diagnostics.rejected, "Rejected blobs");
        }

        StarDetectionResult { stars, diagnostics }
    }
}
