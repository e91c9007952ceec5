//! On-disk snapshot layout.
//!
//! ```text
//! <data_dir>/
//!   20240101T020000/repositories/...   complete snapshot
//!   20240102T020000/incomplete         still being written, or failed
//!   current -> 20240101T020000
//! ```
//!
//! A new snapshot carries an `incomplete` marker from creation until
//! [`SnapshotManager::finalize`]; only finalized snapshots can become
//! `current`.

use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const CURRENT: &str = "current";
pub const INCOMPLETE_MARKER: &str = "incomplete";
const REPOSITORIES: &str = "repositories";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub dir: PathBuf,
}

impl Snapshot {
    pub fn repositories_dir(&self) -> PathBuf {
        self.dir.join(REPOSITORIES)
    }

    pub fn is_complete(&self) -> bool {
        !self.dir.join(INCOMPLETE_MARKER).exists()
    }
}

/// File and byte totals of a snapshot. Hard-linked files count once per
/// path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    root: PathBuf,
}

impl SnapshotManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// UTC timestamp id, sortable as text.
    pub fn new_snapshot_id() -> String {
        Utc::now().format("%Y%m%dT%H%M%S").to_string()
    }

    /// Create the snapshot directory and mark it incomplete. Safe to call
    /// again for an id that is still incomplete; a complete snapshot or the
    /// `current` target is never reopened.
    pub fn create(&self, id: &str) -> Result<Snapshot> {
        if id.is_empty() || id == CURRENT || id.starts_with('.') || id.contains('/') {
            return Err(BackupError::Config(format!("invalid snapshot id {id:?}")));
        }
        let snapshot = Snapshot {
            id: id.to_string(),
            dir: self.root.join(id),
        };
        if self.current_id().as_deref() == Some(id) {
            return Err(BackupError::Misuse(format!(
                "snapshot {id} is {CURRENT} and cannot be rewritten"
            )));
        }
        if snapshot.dir.is_dir() && snapshot.is_complete() {
            return Err(BackupError::Misuse(format!(
                "snapshot {id} is already complete"
            )));
        }
        fs::create_dir_all(snapshot.repositories_dir())?;
        fs::write(snapshot.dir.join(INCOMPLETE_MARKER), b"")?;
        tracing::info!(snapshot = %id, dir = %snapshot.dir.display(), "Created snapshot");
        Ok(snapshot)
    }

    /// Create a snapshot under a fresh timestamp id. An id already on disk
    /// gets a `-N` suffix, which still sorts after it and before the next
    /// second.
    pub fn create_unique(&self) -> Result<Snapshot> {
        let base = Self::new_snapshot_id();
        let mut id = base.clone();
        let mut suffix = 0u32;
        while fs::symlink_metadata(self.root.join(&id)).is_ok() {
            suffix += 1;
            id = format!("{base}-{suffix}");
        }
        self.create(&id)
    }

    /// Previous snapshot's copy of `subdir` to hard-link from, if there is
    /// one. Resolved through `current` so later promotions do not move it.
    pub fn link_dest(&self, subdir: Option<&str>) -> Option<PathBuf> {
        let mut path = self.root.join(CURRENT).join(REPOSITORIES);
        if let Some(subdir) = subdir {
            path.push(subdir);
        }
        if !path.is_dir() {
            return None;
        }
        fs::canonicalize(&path).ok()
    }

    /// Mark every phase of every node as landed.
    pub fn finalize(&self, snapshot: &Snapshot) -> Result<()> {
        match fs::remove_file(snapshot.dir.join(INCOMPLETE_MARKER)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(snapshot = %snapshot.id, "Snapshot complete");
        Ok(())
    }

    /// Atomically point `current` at `snapshot`.
    pub fn promote(&self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.is_complete() {
            return Err(BackupError::Misuse(format!(
                "snapshot {} is incomplete and cannot become {CURRENT}",
                snapshot.id
            )));
        }

        let staging = self.root.join(format!(".{CURRENT}.tmp"));
        match fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(&snapshot.id, &staging)?;
        fs::rename(&staging, self.root.join(CURRENT))?;

        tracing::info!(snapshot = %snapshot.id, "Promoted snapshot to {}", CURRENT);
        Ok(())
    }

    /// Id `current` points at.
    pub fn current_id(&self) -> Option<String> {
        let target = fs::read_link(self.root.join(CURRENT)).ok()?;
        target.file_name().map(|name| name.to_string_lossy().into_owned())
    }

    /// Snapshots under the root, oldest first.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            // `file_type` does not follow symlinks, which skips `current`.
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if id.starts_with('.') {
                continue;
            }
            snapshots.push(Snapshot { id, dir: entry.path() });
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    /// Remove complete snapshots beyond the newest `keep`, and incomplete
    /// ones other than the newest snapshot overall. The `current` target is
    /// never removed. Returns the removed ids.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let snapshots = self.list()?;
        let current = self.current_id();
        let newest = snapshots.last().map(|s| s.id.clone());

        let mut complete: Vec<&Snapshot> = snapshots.iter().filter(|s| s.is_complete()).collect();
        complete.reverse();

        let mut doomed: Vec<&Snapshot> = complete.iter().skip(keep).copied().collect();
        doomed.extend(
            snapshots
                .iter()
                .filter(|s| !s.is_complete() && Some(&s.id) != newest.as_ref()),
        );

        let mut removed = Vec::new();
        for snapshot in doomed {
            if Some(&snapshot.id) == current.as_ref() {
                continue;
            }
            fs::remove_dir_all(&snapshot.dir)?;
            tracing::info!(snapshot = %snapshot.id, "Removed old snapshot");
            removed.push(snapshot.id.clone());
        }
        removed.sort();
        Ok(removed)
    }

    pub fn summary(&self, snapshot: &Snapshot) -> Result<SnapshotSummary> {
        let mut summary = SnapshotSummary::default();
        for entry in WalkDir::new(snapshot.repositories_dir()).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                summary.files += 1;
                summary.bytes += entry.metadata().map_err(io::Error::from)?.len();
            }
        }
        Ok(summary)
    }
}
