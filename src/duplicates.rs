//! Duplicate detection over a playlist directory.
//!
//! Files are grouped by [`normalize`](crate::names::normalize)d song identity;
//! inside a group the best format is kept and everything else is either
//! reported (preview) or deleted.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::covers::COVERS_DIR_NAME;
use crate::names::normalize;

/// Extensions considered by the detector, in enumeration order.
pub const SCANNED_EXTENSIONS: [&str; 6] = ["mp3", "m4a", "mp4", "wav", "flac", "aac"];

/// Identity -> files, only for identities with at least two files.
pub type DuplicateGroups = BTreeMap<String, Vec<PathBuf>>;

/// Format ranking used to pick the copy to keep. Higher wins.
pub fn format_priority(path: &Path) -> i32 {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());

    match ext.as_deref() {
        Some("flac") => 5,
        Some("wav") => 4,
        Some("m4a") => 3,
        Some("mp3") => 2,
        Some("mp4") => 1,
        Some("aac") => 0,
        _ => -1,
    }
}

/// Files the detector looks at, one extension at a time in
/// [`SCANNED_EXTENSIONS`] order and sorted by name within an extension.
pub fn list_candidates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut by_extension: Vec<Vec<PathBuf>> = vec![Vec::new(); SCANNED_EXTENSIONS.len()];

    let walker = WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        let path = entry.into_path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
            continue;
        };
        let ext = ext.to_ascii_lowercase();
        if let Some(slot) = SCANNED_EXTENSIONS.iter().position(|e| *e == ext) {
            by_extension[slot].push(path);
        }
    }

    Ok(by_extension.into_iter().flatten().collect())
}

/// Group files by song identity, keeping input order inside each group.
pub fn group_by_identity<I>(files: I) -> DuplicateGroups
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut groups: DuplicateGroups = BTreeMap::new();
    for file in files {
        let Some(name) = file.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        groups.entry(normalize(name)).or_default().push(file);
    }
    groups.retain(|_, files| files.len() > 1);
    groups
}

/// Find every duplicate group directly inside `dir`.
pub fn find_duplicates(dir: &Path) -> Result<DuplicateGroups> {
    if !dir.is_dir() {
        anyhow::bail!("Directory does not exist: {}", dir.display());
    }
    Ok(group_by_identity(list_candidates(dir)?))
}

/// Keep/remove decision for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub keep: PathBuf,
    pub remove: Vec<PathBuf>,
}

/// Pick the highest-priority file of a group.
///
/// The sort is stable, so among equal priorities the first file in `group`
/// is kept.
pub fn resolve(group: &[PathBuf]) -> Option<Resolution> {
    let mut sorted = group.to_vec();
    sorted.sort_by_key(|path| std::cmp::Reverse(format_priority(path)));

    let mut iter = sorted.into_iter();
    let keep = iter.next()?;
    Some(Resolution {
        keep,
        remove: iter.collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMode {
    /// Report the decision only.
    Preview,
    /// Delete every non-kept file.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStatus {
    Planned,
    Removed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovalOutcome {
    pub file: String,
    pub status: RemovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateDecision {
    pub identity: String,
    pub keep: String,
    pub remove: Vec<RemovalOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    /// Directory that was scanned. Not serialized, callers name it themselves.
    #[serde(skip)]
    pub directory: PathBuf,
    pub mode: RemovalMode,
    pub groups: Vec<DuplicateDecision>,
    pub planned: usize,
    pub removed: usize,
    pub failed: usize,
}

impl DuplicateReport {
    pub fn new(directory: PathBuf, mode: RemovalMode) -> Self {
        Self {
            directory,
            mode,
            groups: Vec::new(),
            planned: 0,
            removed: 0,
            failed: 0,
        }
    }

    /// Apply the report's mode to one resolved group and record the outcome.
    ///
    /// In [`RemovalMode::Delete`] each removal is attempted independently; a
    /// failure is recorded on its outcome and the rest of the group continues.
    pub fn apply(&mut self, identity: String, resolution: &Resolution) {
        tracing::info!("Duplicate '{}': keeping {}", identity, resolution.keep.display());

        let mut outcomes = Vec::with_capacity(resolution.remove.len());
        for path in &resolution.remove {
            let file = display_name(path);
            let outcome = match self.mode {
                RemovalMode::Preview => {
                    self.planned += 1;
                    RemovalOutcome {
                        file,
                        status: RemovalStatus::Planned,
                        error: None,
                    }
                }
                RemovalMode::Delete => match std::fs::remove_file(path) {
                    Ok(()) => {
                        tracing::info!("Removed duplicate: {}", path.display());
                        self.removed += 1;
                        RemovalOutcome {
                            file,
                            status: RemovalStatus::Removed,
                            error: None,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to remove {}: {}", path.display(), e);
                        self.failed += 1;
                        RemovalOutcome {
                            file,
                            status: RemovalStatus::Failed,
                            error: Some(e.to_string()),
                        }
                    }
                },
            };
            outcomes.push(outcome);
        }

        self.groups.push(DuplicateDecision {
            identity,
            keep: display_name(&resolution.keep),
            remove: outcomes,
        });
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Run the detector over `dir` and apply `mode` to every group.
pub fn remove_duplicates(dir: &Path, mode: RemovalMode) -> Result<DuplicateReport> {
    let groups = find_duplicates(dir)?;

    let mut report = DuplicateReport::new(dir.to_path_buf(), mode);
    for (identity, files) in groups {
        if let Some(resolution) = resolve(&files) {
            report.apply(identity, &resolution);
        }
    }

    Ok(report)
}

/// Run [`remove_duplicates`] over `root` and every playlist directory in it.
///
/// Groups never span directories.
pub fn scan_tree(root: &Path, mode: RemovalMode) -> Result<Vec<DuplicateReport>> {
    if !root.is_dir() {
        anyhow::bail!("Directory does not exist: {}", root.display());
    }

    let mut dirs = vec![root.to_path_buf()];

    let playlists = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| path.is_dir() && path.file_name().is_some_and(|n| n != COVERS_DIR_NAME));
    dirs.extend(playlists);

    dirs.iter()
        .map(|dir| remove_duplicates(dir, mode))
        .collect()
}
