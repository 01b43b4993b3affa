//! Service configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RESULTS_DIR: &str = "pattern_outputs";
const DEFAULT_GDAL_TIMEOUT_SECS: u64 = 600;
const DEFAULT_GDAL_BINARY: &str = "gdal_translate";
const MIN_GDAL_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Catalog API root without a trailing slash.
    pub api_base_url: String,
    pub request_timeout: Duration,
    /// `None` means unlimited.
    pub max_download_bytes: Option<u64>,
    pub results_dir: PathBuf,
    pub gdal_timeout: Duration,
    pub gdal_binary: PathBuf,
    /// Fixed RANSAC seed; `None` seeds from the OS.
    pub ransac_seed: Option<u64>,
    /// Allowed origins for the web layer in front of the service.
    pub cors_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let seconds = |key: &str, default: u64| {
            get(key)
                .and_then(|v| match v.parse::<f64>() {
                    Ok(secs) if secs.is_finite() && secs > 0.0 => Some(secs),
                    _ => {
                        tracing::warn!(key, value = %v, "Ignoring invalid duration");
                        None
                    }
                })
                .map_or(Duration::from_secs(default), Duration::from_secs_f64)
        };

        let api_base_url = get("SERVER_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let max_download_bytes = get("PATTERN_MAX_DOWNLOAD_MB").and_then(|v| match v.parse::<f64>() {
            Ok(mb) if mb.is_finite() && mb > 0.0 => Some((mb * 1024.0 * 1024.0) as u64),
            Ok(_) => None,
            Err(_) => {
                tracing::warn!(value = %v, "Ignoring invalid PATTERN_MAX_DOWNLOAD_MB");
                None
            }
        });

        let gdal_timeout = seconds("PATTERN_GDAL_TIMEOUT", DEFAULT_GDAL_TIMEOUT_SECS)
            .max(Duration::from_secs(MIN_GDAL_TIMEOUT_SECS));

        let ransac_seed = get("PATTERN_RANSAC_SEED").and_then(|v| match v.parse::<u64>() {
            Ok(seed) => Some(seed),
            Err(_) => {
                tracing::warn!(value = %v, "Ignoring invalid PATTERN_RANSAC_SEED");
                None
            }
        });

        let cors_origins = get("PATTERN_CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let results_dir = get("PATTERN_RESULTS_DIR").unwrap_or_else(|| DEFAULT_RESULTS_DIR.to_string());
        let gdal_binary = get("PATTERN_GDAL_BINARY").unwrap_or_else(|| DEFAULT_GDAL_BINARY.to_string());

        Self {
            api_base_url,
            request_timeout: seconds("SERVER_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT_SECS),
            max_download_bytes,
            results_dir: PathBuf::from(results_dir),
            gdal_timeout,
            gdal_binary: PathBuf::from(gdal_binary),
            ransac_seed,
            cors_origins,
        }
    }
}
