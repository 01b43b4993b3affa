//! Textual and structured pattern encodings.

use glam::DVec2;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatternParseError {
    #[error("Malformed {kind} text: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Cannot parse coordinate pair from '{segment}'")]
    BadPair { segment: String },

    #[error("Pattern needs at least 2 points, found {found}")]
    TooFewPoints { found: usize },
}

/// A pattern as supplied by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternInput {
    /// Explicit coordinate pairs.
    Pairs(Vec<DVec2>),
    /// `LINESTRING (...)`, `MULTILINESTRING ((...), ...)` or `"x y, x y"`.
    Text(String),
}

impl From<Vec<DVec2>> for PatternInput {
    fn from(points: Vec<DVec2>) -> Self {
        Self::Pairs(points)
    }
}

impl From<&str> for PatternInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Parse a pattern into an ordered coordinate list of at least two points.
///
/// Multi-geometry input keeps only its first component.
pub fn parse_pattern(input: &PatternInput) -> Result<Vec<DVec2>, PatternParseError> {
    let points = match input {
        PatternInput::Pairs(points) => points.clone(),
        PatternInput::Text(text) => parse_text(text)?,
    };

    if points.len() < 2 {
        return Err(PatternParseError::TooFewPoints {
            found: points.len(),
        });
    }
    Ok(points)
}

fn parse_text(text: &str) -> Result<Vec<DVec2>, PatternParseError> {
    let text = text.trim();
    let upper = text.to_ascii_uppercase();

    // MULTILINESTRING contains LINESTRING, so it is checked first.
    if upper.starts_with("MULTILINESTRING") {
        let malformed = |reason: &str| PatternParseError::Malformed {
            kind: "MULTILINESTRING",
            reason: reason.to_string(),
        };
        let start = text.find("((").ok_or_else(|| malformed("missing '(('"))?;
        let end = text.rfind(')').ok_or_else(|| malformed("missing ')'"))?;
        if end <= start + 1 {
            return Err(malformed("empty geometry"));
        }
        let inner = &text[start + 2..end];
        let first = inner.split(')').next().unwrap_or_default();
        return parse_pair_list(first);
    }

    if upper.starts_with("LINESTRING") {
        let malformed = |reason: &str| PatternParseError::Malformed {
            kind: "LINESTRING",
            reason: reason.to_string(),
        };
        let start = text.find('(').ok_or_else(|| malformed("missing '('"))?;
        let end = text.rfind(')').ok_or_else(|| malformed("missing ')'"))?;
        if end <= start {
            return Err(malformed("unbalanced parentheses"));
        }
        return parse_pair_list(&text[start + 1..end]);
    }

    parse_pair_list(text)
}

/// `"x y, x y, ..."`; blank segments are skipped.
fn parse_pair_list(content: &str) -> Result<Vec<DVec2>, PatternParseError> {
    content
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(parse_pair)
        .collect()
}

fn parse_pair(segment: &str) -> Result<DVec2, PatternParseError> {
    let bad = || PatternParseError::BadPair {
        segment: segment.to_string(),
    };
    let mut parts = segment.split_whitespace();
    let (Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(bad());
    };
    let x: f64 = x.parse().map_err(|_| bad())?;
    let y: f64 = y.parse().map_err(|_| bad())?;
    if !x.is_finite() || !y.is_finite() {
        return Err(bad());
    }
    Ok(DVec2::new(x, y))
}
