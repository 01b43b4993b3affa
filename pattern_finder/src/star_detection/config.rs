//! Star detection parameters.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamsError {
    #[error("min_sigma must be at least 0.1, got {0}")]
    MinSigmaTooSmall(f64),
    #[error("max_sigma ({max}) must not be smaller than min_sigma ({min})")]
    SigmaRangeInverted { min: f64, max: f64 },
    #[error("num_sigma must be at least 1")]
    NoSigmaSteps,
    #[error("{name} must be a finite non-negative number, got {value}")]
    InvalidValue { name: &'static str, value: f64 },
}

/// Tuning for the LoG detector and its validation filter.
#[derive(Debug, Clone, PartialEq)]
pub struct StarDetectionParams {
    // ------------------------------------------------------------------------
    // Blob detection
    // ------------------------------------------------------------------------
    pub min_sigma: f64,
    pub max_sigma: f64,
    pub num_sigma: usize,
    /// Minimum scale-normalized LoG response on the equalized image.
    pub threshold: f64,
    /// Log-spaced instead of linearly spaced sigma steps.
    pub log_scale: bool,
    /// Blobs overlapping by more than this fraction of the smaller area are merged.
    pub overlap: f64,

    // ------------------------------------------------------------------------
    // Contrast equalization
    // ------------------------------------------------------------------------
    pub clahe_clip_limit: f64,

    // ------------------------------------------------------------------------
    // Candidate validation
    // ------------------------------------------------------------------------
    pub min_prominence: f64,
    pub min_center_value: f64,
    /// Minimum minor/major eigenvalue ratio of the bright core.
    pub axis_ratio_limit: f64,

    // ------------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------------
    /// Inlier distance used when these stars are matched against a pattern.
    pub tolerance_px: f64,
}

impl Default for StarDetectionParams {
    fn default() -> Self {
        Self {
            min_sigma: 1.0,
            max_sigma: 4.0,
            num_sigma: 10,
            threshold: 0.02,
            log_scale: false,
            overlap: 0.5,
            clahe_clip_limit: 0.01,
            min_prominence: 0.08,
            min_center_value: 0.14,
            axis_ratio_limit: 0.1,
            tolerance_px: 3.0,
        }
    }
}

impl StarDetectionParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        for (name, value) in [
            ("threshold", self.threshold),
            ("overlap", self.overlap),
            ("clahe_clip_limit", self.clahe_clip_limit),
            ("min_prominence", self.min_prominence),
            ("min_center_value", self.min_center_value),
            ("axis_ratio_limit", self.axis_ratio_limit),
            ("tolerance_px", self.tolerance_px),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ParamsError::InvalidValue { name, value });
            }
        }
        if !(self.min_sigma >= 0.1) {
            return Err(ParamsError::MinSigmaTooSmall(self.min_sigma));
        }
        if !(self.max_sigma >= self.min_sigma) {
            return Err(ParamsError::SigmaRangeInverted {
                min: self.min_sigma,
                max: self.max_sigma,
            });
        }
        if self.num_sigma == 0 {
            return Err(ParamsError::NoSigmaSteps);
        }
        Ok(())
    }

    /// Sigma values tried by the blob detector, ascending.
    pub fn sigma_schedule(&self) -> Vec<f64> {
        let n = self.num_sigma.max(1);
        if n == 1 {
            return vec![self.min_sigma];
        }
        let step = |i: usize| i as f64 / (n - 1) as f64;
        if self.log_scale {
            let (lo, hi) = (self.min_sigma.log10(), self.max_sigma.log10());
            (0..n).map(|i| 10f64.powf(lo + (hi - lo) * step(i))).collect()
        } else {
            (0..n)
                .map(|i| self.min_sigma + (self.max_sigma - self.min_sigma) * step(i))
                .collect()
        }
    }
}
