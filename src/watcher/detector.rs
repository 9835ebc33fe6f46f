//! Target file discovery in the watch directory

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::Serialize;

/// A candidate target file found in the watch directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetFile {
    #[serde(skip)]
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// Modification time, unix seconds
    pub modified: f64,
}

/// Direct children of `dir` carrying `extension` (no dot, any case), by file name
pub fn list_targets(dir: &Path, extension: &str) -> Result<Vec<TargetFile>> {
    let mut targets = Vec::new();

    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if !entry.file_type().is_file() || !has_extension(entry.path(), extension) {
            continue;
        }

        // vanished between listing and stat
        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        targets.push(TargetFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            modified: mtime_secs(&metadata),
            path: entry.into_path(),
        });
    }

    Ok(targets)
}

pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

pub fn mtime_secs(metadata: &std::fs::Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
