//! Streaming an asset to disk.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use super::cancel::CancelSignal;
use super::catalog::AssetStream;
use super::error::AssetError;

/// Write `stream` to `destination` and return the byte count.
///
/// Stops as soon as more than `limit` bytes arrive or `cancel` fires. The
/// partial file is removed on every failure.
pub async fn download_to_file(
    stream: AssetStream,
    destination: &Path,
    limit: Option<u64>,
    cancel: &CancelSignal,
) -> Result<u64, AssetError> {
    let result = write_stream(stream, destination, limit, cancel).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(destination).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %destination.display(), error = %e, "Cannot remove partial download");
            }
        }
    }
    result
}

async fn write_stream(
    mut stream: AssetStream,
    destination: &Path,
    limit: Option<u64>,
    cancel: &CancelSignal,
) -> Result<u64, AssetError> {
    let io_err = |source| AssetError::Io {
        path: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut file = File::create(destination).await.map_err(io_err)?;
    let mut total: u64 = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AssetError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk?;

        total += chunk.len() as u64;
        if let Some(limit) = limit {
            if total > limit {
                tracing::warn!(limit, received = total, "Download exceeded size limit");
                return Err(AssetError::TooLarge { limit });
            }
        }
        file.write_all(&chunk).await.map_err(io_err)?;
    }

    file.flush().await.map_err(io_err)?;
    Ok(total)
}
