//! Asset variant policy and download naming.

use std::fmt;

use common::file_utils::{dotted_extension, sanitize_filename};
use serde::{Deserialize, Serialize};

use super::models::{AssetPreference, DatasetFile};

pub const UNAVAILABLE_ASSET: &str = "unavailable";

const MBTILES_EXTENSION: &str = ".mbtiles";
const DEFAULT_RASTER_EXTENSION: &str = ".tif";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Mbtiles,
    Original,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mbtiles => "mbtiles",
            Self::Original => "original",
        }
    }

    fn is_available(self, file: &DatasetFile) -> bool {
        match self {
            Self::Mbtiles => file.mbtiles_key.as_deref().is_some_and(|k| !k.is_empty()),
            Self::Original => file.download_url.as_deref().is_some_and(|u| !u.is_empty()),
        }
    }

    /// Note attached to an item when this kind was used as the fallback.
    pub fn fallback_message(self) -> &'static str {
        match self {
            Self::Mbtiles => "Original file unavailable, MBTiles variant was used.",
            Self::Original => "MBTiles variant unavailable, original file was used.",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the variant to download: `(kind, used_fallback)`.
///
/// `Auto` prefers MBTiles. The second choice is only taken when the
/// preferred variant is missing. `None` when neither exists.
pub fn resolve_asset(preference: AssetPreference, file: &DatasetFile) -> Option<(AssetKind, bool)> {
    let order = match preference {
        AssetPreference::Auto | AssetPreference::Mbtiles => [AssetKind::Mbtiles, AssetKind::Original],
        AssetPreference::Original => [AssetKind::Original, AssetKind::Mbtiles],
    };
    order
        .iter()
        .position(|kind| kind.is_available(file))
        .map(|index| (order[index], index > 0))
}

/// Local file name for a downloaded asset: sanitized file id plus
/// `.mbtiles` or the original's extension (`.tif` when it has none).
pub fn download_file_name(file: &DatasetFile, kind: AssetKind) -> String {
    let extension = match kind {
        AssetKind::Mbtiles => MBTILES_EXTENSION.to_string(),
        AssetKind::Original => dotted_extension(&file.original_filename)
            .unwrap_or_else(|| DEFAULT_RASTER_EXTENSION.to_string()),
    };
    format!("{}{}", sanitize_filename(&file.id), extension)
}
