//! File-based hand-off queues between pipeline stages.
//!
//! Each queue is a directory of JSON entries. An entry becomes visible only
//! through an atomic rename, so consumers never observe a partial write.
//! Claimed entries move under `claimed/<consumer>/`, finished ones under
//! `completed/` or `failed/`.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::core::types::QueueName;
use crate::io::fs_util::write_json_atomic;

const TMP_DIR: &str = ".tmp";
const CLAIMED_DIR: &str = "claimed";
const COMPLETED_DIR: &str = "completed";
const FAILED_DIR: &str = "failed";
/// Collision suffixes tried before giving up.
const MAX_SUFFIX: u32 = 1000;

static ENTRY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("entry id regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(anyhow!("unknown priority '{other}' (expected high|medium|low)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One unit of hand-off work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub queue: QueueName,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub payload: serde_json::Value,
}

impl QueueEntry {
    pub fn new(
        queue: QueueName,
        id: impl Into<String>,
        created_by: impl Into<String>,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            created_at: Utc::now(),
            created_by: created_by.into(),
            priority,
            status: EntryStatus::Pending,
            claimed_by: None,
            failure_reason: None,
            payload,
        }
    }
}

/// An entry owned by one consumer, with the file that now holds it.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimedEntry {
    pub entry: QueueEntry,
    pub path: PathBuf,
}

/// Root of all queue directories.
#[derive(Debug, Clone)]
pub struct QueueStore {
    root: PathBuf,
}

impl QueueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn queue_dir(&self, queue: QueueName) -> PathBuf {
        self.root.join(queue.as_str())
    }

    /// Publish `entry` under `<queue>/<id>.json`, suffixing `-1`, `-2`, ...
    /// on collision. Never overwrites. Returns the final path.
    #[instrument(skip_all, fields(queue = %queue, id = %entry.id))]
    pub fn enqueue_atomic(&self, queue: QueueName, entry: &QueueEntry) -> Result<PathBuf> {
        if !ENTRY_ID_RE.is_match(&entry.id) {
            return Err(anyhow!(
                "invalid queue entry id '{}' (letters, digits, '.', '_', '-')",
                entry.id
            ));
        }
        if entry.queue != queue {
            return Err(anyhow!(
                "entry {} targets queue {} but was pushed to {queue}",
                entry.id,
                entry.queue
            ));
        }
        let dir = self.queue_dir(queue);
        let tmp_dir = dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("create directory {}", tmp_dir.display()))?;

        let mut buf = serde_json::to_vec_pretty(entry).context("serialize queue entry")?;
        buf.push(b'\n');
        let mut tmp = NamedTempFile::new_in(&tmp_dir)
            .with_context(|| format!("create temp entry in {}", tmp_dir.display()))?;
        tmp.write_all(&buf).context("write temp entry")?;
        tmp.as_file().sync_all().context("sync temp entry")?;

        for attempt in 0..=MAX_SUFFIX {
            let target = dir.join(suffixed_name(&entry.id, attempt));
            match tmp.persist_noclobber(&target) {
                Ok(_) => {
                    debug!(path = %target.display(), "entry published");
                    return Ok(target);
                }
                Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    tmp = err.file;
                }
                Err(err) => {
                    return Err(err.error)
                        .with_context(|| format!("publish entry {}", target.display()));
                }
            }
        }
        Err(anyhow!(
            "queue {queue}: too many entries named {}",
            entry.id
        ))
    }

    /// Pending entries at the top level. Approximate under concurrent use.
    pub fn depth(&self, queue: QueueName) -> Result<usize> {
        Ok(pending_files(&self.queue_dir(queue))?.len())
    }

    /// All four depths in pipeline order.
    pub fn pipeline_depths(&self) -> Result<Vec<(QueueName, usize)>> {
        QueueName::ALL
            .into_iter()
            .map(|queue| Ok((queue, self.depth(queue)?)))
            .collect()
    }

    /// Pending entries, highest priority first, then oldest first.
    /// Malformed files are skipped.
    pub fn list(&self, queue: QueueName) -> Result<Vec<(PathBuf, QueueEntry)>> {
        let mut entries: Vec<(PathBuf, QueueEntry)> = pending_files(&self.queue_dir(queue))?
            .into_iter()
            .filter_map(|path| match read_entry(&path) {
                Ok(entry) => Some((path, entry)),
                Err(err) => {
                    debug!(path = %path.display(), err = %err, "skipping malformed entry");
                    None
                }
            })
            .collect();
        entries.sort_by(|(a_path, a), (b_path, b)| {
            (a.priority, a.created_at, a_path).cmp(&(b.priority, b.created_at, b_path))
        });
        Ok(entries)
    }

    /// Take the best pending entry for `consumer`, or `None` if the queue is
    /// empty. Losing a rename race to another consumer moves on to the next
    /// candidate.
    #[instrument(skip_all, fields(queue = %queue, consumer))]
    pub fn claim(&self, queue: QueueName, consumer: &str) -> Result<Option<ClaimedEntry>> {
        if !ENTRY_ID_RE.is_match(consumer) {
            return Err(anyhow!("invalid consumer name '{consumer}'"));
        }
        let claimed_dir = self.queue_dir(queue).join(CLAIMED_DIR).join(consumer);
        fs::create_dir_all(&claimed_dir)
            .with_context(|| format!("create directory {}", claimed_dir.display()))?;

        for (path, mut entry) in self.list(queue)? {
            let Some(target) = move_noclobber(&path, &claimed_dir)? else {
                debug!(path = %path.display(), "entry claimed by someone else");
                continue;
            };
            entry.status = EntryStatus::InProgress;
            entry.claimed_by = Some(consumer.to_string());
            write_json_atomic(&target, &entry)?;
            info!(id = %entry.id, path = %target.display(), "entry claimed");
            return Ok(Some(ClaimedEntry {
                entry,
                path: target,
            }));
        }
        Ok(None)
    }

    /// Reopen an entry `consumer` claimed earlier, e.g. from another process.
    /// `file` is the claimed file's name; any directory part is ignored.
    pub fn claimed(&self, queue: QueueName, consumer: &str, file: &str) -> Result<ClaimedEntry> {
        if !ENTRY_ID_RE.is_match(consumer) {
            return Err(anyhow!("invalid consumer name '{consumer}'"));
        }
        let name = Path::new(file)
            .file_name()
            .with_context(|| format!("'{file}' does not name a claimed entry"))?;
        let path = self
            .queue_dir(queue)
            .join(CLAIMED_DIR)
            .join(consumer)
            .join(name);
        if !path.is_file() {
            return Err(anyhow!(
                "no entry {} claimed by {consumer} in queue {queue}",
                name.to_string_lossy()
            ));
        }
        let entry = read_entry(&path)?;
        Ok(ClaimedEntry { entry, path })
    }

    /// Move a claimed entry into `completed/`.
    pub fn complete(&self, claimed: ClaimedEntry) -> Result<PathBuf> {
        let mut entry = claimed.entry;
        entry.status = EntryStatus::Completed;
        self.finish(entry, &claimed.path, COMPLETED_DIR)
    }

    /// Move a claimed entry into `failed/`, recording why.
    pub fn fail(&self, claimed: ClaimedEntry, reason: &str) -> Result<PathBuf> {
        let mut entry = claimed.entry;
        entry.status = EntryStatus::Failed;
        entry.failure_reason = Some(reason.to_string());
        warn!(id = %entry.id, reason, "entry failed");
        self.finish(entry, &claimed.path, FAILED_DIR)
    }

    fn finish(&self, entry: QueueEntry, claimed_path: &Path, subdir: &str) -> Result<PathBuf> {
        let dir = self.queue_dir(entry.queue).join(subdir);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        write_json_atomic(claimed_path, &entry)?;
        let target = move_noclobber(claimed_path, &dir)?.with_context(|| {
            format!("claimed entry {} disappeared", claimed_path.display())
        })?;
        debug!(path = %target.display(), "entry finished");
        Ok(target)
    }
}

/// `<stem>.json`, then `<stem>-1.json`, `<stem>-2.json`, ...
fn suffixed_name(stem: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("{stem}.json")
    } else {
        format!("{stem}-{attempt}.json")
    }
}

/// Move `from` into `dir`, suffixing the name on collision. Never replaces
/// an existing file.
///
/// The new link is made before the old one is removed, and only one mover
/// can remove `from`. Returns `None` when another mover took `from` first.
fn move_noclobber(from: &Path, dir: &Path) -> Result<Option<PathBuf>> {
    let stem = from
        .file_stem()
        .with_context(|| format!("entry path has no file name {}", from.display()))?
        .to_string_lossy()
        .into_owned();
    for attempt in 0..=MAX_SUFFIX {
        let target = dir.join(suffixed_name(&stem, attempt));
        match fs::hard_link(from, &target) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("link {} to {}", from.display(), target.display())
                });
            }
        }
        return match fs::remove_file(from) {
            Ok(()) => Ok(Some(target)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                fs::remove_file(&target)
                    .with_context(|| format!("drop lost claim {}", target.display()))?;
                Ok(None)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&target) {
                    warn!(path = %target.display(), err = %cleanup, "cannot drop partial move");
                }
                Err(err).with_context(|| format!("remove {}", from.display()))
            }
        };
    }
    Err(anyhow!(
        "{}: too many entries named {stem}",
        dir.display()
    ))
}

/// Visible `*.json` files directly inside `dir`. A missing dir is empty.
fn pending_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read queue dir {}", dir.display())),
    };
    let mut files = Vec::new();
    for item in read {
        let item = item.with_context(|| format!("read queue dir {}", dir.display()))?;
        let name = item.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        if item.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            files.push(item.path());
        }
    }
    files.sort();
    Ok(files)
}

fn read_entry(path: &Path) -> Result<QueueEntry> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read entry {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse entry {}", path.display()))
}
