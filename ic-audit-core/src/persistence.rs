//! Durable snapshots of the audit store
//!
//! A snapshot is a JSON Lines file with one envelope per line, written in
//! project order and arrival order within each project. Loading rebuilds the
//! per-project grouping from each envelope's `project_name`.
//!
//! Writes go to `<path>.tmp` first and are renamed over `<path>`, so the main
//! file is either the previous snapshot or the new one. If the main file is
//! unreadable at startup it is moved aside to `<path>.<unix-ts>.corrupt` and the
//! `.tmp` sibling (left by an interrupted write) is tried before starting empty.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{AuditTrails, Envelope};

/// A snapshot file on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot at `~/.cellar/loser_audit.jsonl`
    pub fn default_location() -> Self {
        Self::new(Config::snapshot_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling used for atomic replacement
    pub fn tmp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    fn error(&self, message: impl std::fmt::Display) -> Error {
        Error::Persistence {
            path: self.path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Write every trail atomically. Returns the number of events written.
    pub fn save(&self, trails: &AuditTrails) -> Result<usize> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| self.error(format!("failed to create directory: {}", e)))?;
        }

        let tmp = self.tmp_path();
        let written = write_lines(&tmp, trails).map_err(|e| self.error(e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| self.error(format!("failed to replace snapshot: {}", e)))?;

        tracing::debug!(
            path = %self.path.display(),
            events = written,
            projects = trails.len(),
            "Snapshot saved"
        );
        Ok(written)
    }

    /// Read the snapshot. A missing file is an empty store.
    pub fn load(&self) -> Result<AuditTrails> {
        if !self.path.exists() {
            return Ok(AuditTrails::new());
        }
        read_lines(&self.path).map_err(|e| self.error(e))
    }

    /// Read the snapshot, falling back to recovery and finally to an empty store.
    ///
    /// Never fails; problems are logged as warnings.
    pub fn load_or_recover(&self) -> AuditTrails {
        if !self.path.exists() {
            if let Some(trails) = self.recover_from_tmp() {
                return trails;
            }
            tracing::info!(
                path = %self.path.display(),
                "No snapshot found, starting fresh"
            );
            return AuditTrails::new();
        }

        match self.load() {
            Ok(trails) => trails,
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot unreadable, attempting recovery");
                self.quarantine();
                match self.recover_from_tmp() {
                    Some(trails) => trails,
                    None => {
                        tracing::warn!(
                            path = %self.path.display(),
                            "No usable backup, previously stored audit trails are lost; starting empty"
                        );
                        AuditTrails::new()
                    }
                }
            }
        }
    }

    /// Move a corrupt snapshot out of the way so the next save does not clobber it.
    fn quarantine(&self) {
        let stamp = chrono::Utc::now().timestamp();
        let target = with_suffix(&self.path, &format!(".{}.corrupt", stamp));
        match fs::rename(&self.path, &target) {
            Ok(()) => tracing::warn!(
                corrupt_file = %target.display(),
                "Renamed corrupt snapshot"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                path = %self.path.display(),
                "Failed to rename corrupt snapshot"
            ),
        }
    }

    fn recover_from_tmp(&self) -> Option<AuditTrails> {
        let tmp = self.tmp_path();
        if !tmp.exists() {
            return None;
        }

        let trails = match read_lines(&tmp) {
            Ok(trails) => trails,
            Err(e) => {
                tracing::warn!(path = %tmp.display(), error = %e, "Backup snapshot unreadable");
                return None;
            }
        };

        if let Err(e) = fs::rename(&tmp, &self.path) {
            tracing::warn!(error = %e, "Failed to promote backup snapshot");
        }
        tracing::info!(
            path = %self.path.display(),
            projects = trails.len(),
            "Recovered audit trails from backup"
        );
        Some(trails)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_lines(path: &Path, trails: &AuditTrails) -> std::result::Result<usize, String> {
    let file = File::create(path).map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;

    for envelope in trails.values().flatten() {
        serde_json::to_writer(&mut writer, envelope)
            .map_err(|e| format!("failed to serialize event: {}", e))?;
        writer
            .write_all(b"\n")
            .map_err(|e| format!("failed to write: {}", e))?;
        written += 1;
    }

    let file = writer
        .into_inner()
        .map_err(|e| format!("failed to flush: {}", e.error()))?;
    file.sync_all()
        .map_err(|e| format!("failed to sync: {}", e))?;
    Ok(written)
}

fn read_lines(path: &Path) -> std::result::Result<AuditTrails, String> {
    let file = File::open(path).map_err(|e| format!("failed to open: {}", e))?;
    let mut trails = AuditTrails::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read line {}: {}", index + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = serde_json::from_str(&line)
            .map_err(|e| format!("invalid event on line {}: {}", index + 1, e))?;
        trails
            .entry(envelope.project_name.clone())
            .or_default()
            .push(envelope);
    }

    Ok(trails)
}
