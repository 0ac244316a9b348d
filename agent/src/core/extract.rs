//! Locate the unified diff inside free-form model output.
//!
//! This is a substring search, not a diff parser. The model is trusted to emit
//! a single trailing diff block; anything after the marker is kept verbatim and
//! handed to git, which is the authority on applicability.

use super::error::ExtractionError;

/// Marker that starts a git-format unified diff.
pub const DIFF_START_MARKER: &str = "diff --git";

/// Return everything from the first diff marker to the end of `text`.
///
/// Trailing whitespace is trimmed and exactly one newline is appended, which
/// `git apply` requires on the final hunk line.
pub fn extract_diff(text: &str) -> Result<String, ExtractionError> {
    let start = text.find(DIFF_START_MARKER).ok_or(ExtractionError {
        marker: DIFF_START_MARKER,
    })?;
    let mut diff = text[start..].trim_end().to_string();
    diff.push('\n');
    Ok(diff)
}
