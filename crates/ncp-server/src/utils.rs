//! crates/ncp-server/src/utils.rs
//! Shared utility functions used across the codebase

use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Truncate a string to max length with ellipsis.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", truncated)
}

/// Write a file atomically: write to a sibling temp file, fsync, rename.
/// Readers never observe a partially-written document.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
