//! Path helpers for files named after external identifiers.

use std::path::Path;

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
///
/// Leading dots are replaced too so the result can never name a hidden file or
/// walk out of its directory. An empty input becomes `"file"`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let leading_dots = out.chars().take_while(|c| *c == '.').count();
    if leading_dots > 0 {
        out.replace_range(..leading_dots, &"_".repeat(leading_dots));
    }

    if out.is_empty() {
        "file".to_string()
    } else {
        out
    }
}

/// Lower-cased extension including the leading dot, e.g. `".tif"`.
pub fn dotted_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
}

/// File name without its extension, falling back to `"raster"`.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "raster".to_string())
}
