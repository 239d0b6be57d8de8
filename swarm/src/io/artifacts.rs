//! Filesystem side of artifact validation: find what a session created.
//!
//! A [`StartMarker`] is taken before invocation. It records when the session
//! started and what the artifact roots looked like, so files that are new or
//! changed afterwards count even when the filesystem clock is coarser than
//! the process clock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::validator::{ArtifactFile, is_structured};

/// Structured files larger than this are not parsed.
const MAX_STRUCTURED_BYTES: u64 = 16 * 1024 * 1024;

/// Directory names never treated as session output. Queue entries moved
/// into these by any consumer are hand-off bookkeeping, not new work.
const IGNORED_DIRS: &[&str] = &[
    "claimed",
    "completed",
    "failed",
    "__pycache__",
    "node_modules",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    modified: Option<SystemTime>,
    size: u64,
}

/// Per-iteration start marker.
#[derive(Debug, Clone)]
pub struct StartMarker {
    pub taken_at: SystemTime,
    roots: Vec<PathBuf>,
    before: HashMap<PathBuf, FileState>,
}

impl StartMarker {
    pub fn take(roots: &[PathBuf]) -> Self {
        Self {
            taken_at: SystemTime::now(),
            roots: roots.to_vec(),
            before: snapshot(roots),
        }
    }

    /// Regular files created or modified since the marker, sorted.
    pub fn scan_new_files(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = snapshot(&self.roots)
            .into_iter()
            .filter(|(path, state)| {
                let touched_after = state
                    .modified
                    .is_some_and(|modified| modified >= self.taken_at);
                touched_after || self.before.get(path) != Some(state)
            })
            .map(|(path, _)| path)
            .collect();
        found.sort();
        debug!(count = found.len(), "scanned for new artifacts");
        found
    }
}

/// Regular files under `roots`. Missing roots are skipped; hidden entries
/// and bookkeeping dirs are ignored.
fn snapshot(roots: &[PathBuf]) -> HashMap<PathBuf, FileState> {
    let mut files = HashMap::new();
    for root in roots {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored(e))
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file()
                && let Ok(metadata) = entry.metadata()
            {
                files.insert(
                    entry.into_path(),
                    FileState {
                        modified: metadata.modified().ok(),
                        size: metadata.len(),
                    },
                );
            }
        }
    }
    files
}

fn is_ignored(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.')
        || (entry.file_type().is_dir() && IGNORED_DIRS.iter().any(|dir| *dir == name))
}

/// Load the validator's view of each file: contents for structured files,
/// path only for everything else. Unreadable structured files keep `None`
/// contents and are rejected by the validator.
pub fn load_artifacts(paths: &[PathBuf]) -> Vec<ArtifactFile> {
    paths
        .iter()
        .map(|path| {
            if !is_structured(path) {
                return ArtifactFile::opaque(path.clone());
            }
            match read_structured(path) {
                Ok(contents) => ArtifactFile::structured(path.clone(), contents),
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "cannot read artifact");
                    ArtifactFile::opaque(path.clone())
                }
            }
        })
        .collect()
}

fn read_structured(path: &Path) -> Result<String> {
    let size = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if size > MAX_STRUCTURED_BYTES {
        anyhow::bail!("{} is {size} bytes, over the parse limit", path.display());
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}
