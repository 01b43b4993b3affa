//! MBTiles → GeoTIFF through `gdal_translate`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::cancel::CancelSignal;
use super::error::ConversionError;

pub const MIN_CONVERSION_TIMEOUT: Duration = Duration::from_secs(5);

fn translate_args(source: &Path, target: &Path) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = [
        "--config",
        "GDAL_NUM_THREADS",
        "ALL_CPUS",
        "-co",
        "NUM_THREADS=ALL_CPUS",
        "-of",
        "GTiff",
    ]
    .into_iter()
    .map(std::ffi::OsString::from)
    .collect();
    args.push(source.into());
    args.push(target.into());
    args
}

/// Convert `source` to a sibling `.tif`, replacing any existing one.
///
/// The tool is killed when `timeout` (at least five seconds) elapses or the
/// run is cancelled.
pub async fn convert_mbtiles(
    binary: &Path,
    source: &Path,
    timeout: Duration,
    cancel: &CancelSignal,
) -> Result<PathBuf, ConversionError> {
    run_translate(binary, source, timeout.max(MIN_CONVERSION_TIMEOUT), cancel).await
}

async fn run_translate(
    binary: &Path,
    source: &Path,
    timeout: Duration,
    cancel: &CancelSignal,
) -> Result<PathBuf, ConversionError> {
    let binary_name = binary.display().to_string();
    let target = source.with_extension("tif");
    match tokio::fs::remove_file(&target).await {
        Ok(()) => tracing::debug!(target = %target.display(), "Removed stale conversion output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            tracing::warn!(target = %target.display(), error = %source, "Cannot remove stale conversion output");
            return Err(ConversionError::StaleOutput { path: target, source });
        }
    }

    let args = translate_args(source, &target);
    tracing::info!(
        command = %binary_name,
        source = %source.display(),
        target = %target.display(),
        "Converting MBTiles to GeoTIFF"
    );

    let mut command = Command::new(binary);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if std::env::var_os("GDAL_NUM_THREADS").is_none() {
        command.env("GDAL_NUM_THREADS", "ALL_CPUS");
    }

    let child = command.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConversionError::NotFound {
                binary: binary_name.clone(),
            }
        } else {
            ConversionError::Spawn {
                binary: binary_name.clone(),
                source,
            }
        }
    })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ConversionError::Cancelled),
        output = tokio::time::timeout(timeout, child.wait_with_output()) => output,
    };

    let output = match output {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ConversionError::Spawn {
                binary: binary_name,
                source,
            })
        }
        Err(_) => {
            tracing::error!(command = %binary_name, seconds = timeout.as_secs_f64(), "Conversion timed out");
            return Err(ConversionError::TimedOut {
                binary: binary_name,
                seconds: timeout.as_secs_f64(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        tracing::error!(
            command = %binary_name,
            code = ?output.status.code(),
            stdout = %stdout,
            stderr = %stderr,
            "Conversion failed"
        );
        let detail = [&stderr, &stdout]
            .into_iter()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| "Unknown error".to_string());
        return Err(ConversionError::Failed {
            code: output.status.code(),
            detail,
        });
    }

    if !stdout.is_empty() {
        tracing::debug!(command = %binary_name, output = %stdout, "Conversion stdout");
    }
    if !stderr.is_empty() {
        tracing::debug!(command = %binary_name, output = %stderr, "Conversion stderr");
    }
    if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
        tracing::error!(command = %binary_name, target = %target.display(), "Conversion produced no output");
        return Err(ConversionError::MissingOutput { path: target });
    }
    Ok(target)
}
