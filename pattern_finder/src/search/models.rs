//! Request, response and catalog records. All JSON is camelCase.

use chrono::{DateTime, Utc};
use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::coords::CoordinateSpace;
use crate::matching::Affine2;
use crate::star_detection::StarDetectionParams;

use super::error::ValidationError;

pub const MAX_PATTERN_NAME_LEN: usize = 120;
const MIN_VERIFY_TOL_PX: f64 = 0.1;

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFileStatus {
    Uploaded,
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFile {
    pub id: String,
    pub original_filename: String,
    #[serde(default)]
    pub mime_type: String,
    pub status: DatasetFileStatus,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Present when the original raster can be downloaded.
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub mbtiles_key: Option<String>,
    #[serde(default)]
    pub mbtiles_download_url: Option<String>,
    #[serde(default)]
    pub mbtiles_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub files: Vec<DatasetFile>,
}

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetPreference {
    #[default]
    Auto,
    Mbtiles,
    Original,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinePoint {
    pub x: f64,
    pub y: f64,
}

impl From<LinePoint> for DVec2 {
    fn from(p: LinePoint) -> Self {
        DVec2::new(p.x, p.y)
    }
}

impl From<DVec2> for LinePoint {
    fn from(p: DVec2) -> Self {
        Self { x: p.x, y: p.y }
    }
}

/// Detector overrides accepted from callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StarParams {
    pub min_sigma: f64,
    pub max_sigma: f64,
    pub num_sigma: usize,
    pub threshold: f64,
    pub log_scale: bool,
}

impl Default for StarParams {
    fn default() -> Self {
        let defaults = StarDetectionParams::default();
        Self {
            min_sigma: defaults.min_sigma,
            max_sigma: defaults.max_sigma,
            num_sigma: defaults.num_sigma,
            threshold: defaults.threshold,
            log_scale: defaults.log_scale,
        }
    }
}

impl StarParams {
    /// Full detector parameters with these overrides applied.
    pub fn to_detection_params(&self) -> StarDetectionParams {
        StarDetectionParams {
            min_sigma: self.min_sigma,
            max_sigma: self.max_sigma,
            num_sigma: self.num_sigma,
            threshold: self.threshold,
            log_scale: self.log_scale,
            ..Default::default()
        }
    }
}

fn default_pattern_name() -> String {
    "pattern".to_string()
}

fn default_verify_tol_px() -> f64 {
    3.0
}

fn default_score_threshold() -> f64 {
    0.05
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRunRequest {
    pub line_points: Vec<LinePoint>,
    #[serde(default)]
    pub dataset_file_ids: Option<Vec<String>>,
    #[serde(default = "default_pattern_name")]
    pub pattern_name: String,
    #[serde(default)]
    pub star_params: Option<StarParams>,
    #[serde(default = "default_verify_tol_px")]
    pub verify_tol_px: f64,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_true")]
    pub generate_previews: bool,
    #[serde(default)]
    pub asset_preference: AssetPreference,
    #[serde(default)]
    pub coordinate_space: CoordinateSpace,
}

impl SearchRunRequest {
    /// Request with every optional field at its default.
    pub fn new(line_points: Vec<LinePoint>) -> Self {
        Self {
            line_points,
            dataset_file_ids: None,
            pattern_name: default_pattern_name(),
            star_params: None,
            verify_tol_px: default_verify_tol_px(),
            score_threshold: default_score_threshold(),
            generate_previews: true,
            asset_preference: AssetPreference::default(),
            coordinate_space: CoordinateSpace::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.line_points.len() < 3 {
            return Err(ValidationError::TooFewPoints {
                found: self.line_points.len(),
            });
        }
        if let Some(index) = self
            .line_points
            .iter()
            .position(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(ValidationError::NonFinitePoint { index });
        }

        let name_len = self.pattern_name.chars().count();
        if name_len > MAX_PATTERN_NAME_LEN {
            return Err(ValidationError::PatternNameTooLong {
                len: name_len,
                max: MAX_PATTERN_NAME_LEN,
            });
        }
        if !(self.verify_tol_px >= MIN_VERIFY_TOL_PX) || !self.verify_tol_px.is_finite() {
            return Err(ValidationError::VerifyTolerance(self.verify_tol_px));
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(ValidationError::ScoreThreshold(self.score_threshold));
        }

        if let Some(params) = &self.star_params {
            if params.max_sigma < params.min_sigma {
                return Err(ValidationError::SigmaRange {
                    min: params.min_sigma,
                    max: params.max_sigma,
                });
            }
            params.to_detection_params().validate()?;
        }
        Ok(())
    }

    /// Detector parameters with the request's overrides and `verifyTolPx` as
    /// the match tolerance.
    pub fn detection_params(&self) -> StarDetectionParams {
        let mut params = self
            .star_params
            .as_ref()
            .map(StarParams::to_detection_params)
            .unwrap_or_default();
        params.tolerance_px = self.verify_tol_px;
        params
    }

    pub fn pattern_points(&self) -> Vec<DVec2> {
        self.line_points.iter().copied().map(DVec2::from).collect()
    }
}

// ============================================================================
// Response
// ============================================================================

/// Terminal state of one file in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileOutcome {
    Succeeded,
    FailedNoTransform,
    FailedBelowThreshold,
    FailedAssetError,
    FailedConversionError,
    FailedDetectionError,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultItem {
    pub dataset_file_id: String,
    pub dataset_file_name: String,
    /// `mbtiles`, `original` or `unavailable`.
    pub asset_kind: String,
    pub status: FileOutcome,
    pub success: bool,
    pub score: f64,
    pub score_above_threshold: bool,
    pub transform: Option<Affine2>,
    pub matched_points_image: Option<Vec<[f64; 2]>>,
    pub preview_path: Option<String>,
    pub preview_url: Option<String>,
    pub stars_path: Option<String>,
    pub stars_url: Option<String>,
    pub geojson: Option<serde_json::Value>,
    pub message: Option<String>,
}

impl SearchResultItem {
    /// Failed or skipped item carrying only identity, kind and message.
    pub fn failed(file: &DatasetFile, asset_kind: &str, status: FileOutcome, message: String) -> Self {
        Self {
            dataset_file_id: file.id.clone(),
            dataset_file_name: file.original_filename.clone(),
            asset_kind: asset_kind.to_string(),
            status,
            success: false,
            score: 0.0,
            score_above_threshold: false,
            transform: None,
            matched_points_image: None,
            preview_path: None,
            preview_url: None,
            stars_path: None,
            stars_url: None,
            geojson: None,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRunResponse {
    pub run_id: String,
    pub dataset_id: String,
    pub dataset_name: String,
    pub pattern_name: String,
    pub line_points: Vec<LinePoint>,
    pub star_params: Option<StarParams>,
    pub verify_tol_px: f64,
    pub score_threshold: f64,
    pub asset_preference: AssetPreference,
    pub coordinate_space: CoordinateSpace,
    pub requested_file_ids: Option<Vec<String>>,
    pub used_file_ids: Vec<String>,
    pub results: Vec<SearchResultItem>,
    pub success_count: usize,
    pub total_files: usize,
    pub duration_ms: f64,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
}
