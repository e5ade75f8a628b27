//! Whole-document JSON persistence and the per-stage deployment lock.

use crate::config::Stage;
use crate::error::{DeployError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Serialize `value` and atomically replace `path` with it.
///
/// The document is written to a temp file in the same directory, synced, then
/// renamed over the target, so readers see either the old or the new document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| DeployError::Io(e.error))?;

    debug!("Persisted {}", path.display());
    Ok(())
}

/// Read a JSON document, `None` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Copy `from` over `to` if `from` exists. Returns whether anything was copied.
pub fn copy_if_exists(from: &Path, to: &Path) -> Result<bool> {
    if !from.exists() {
        return Ok(false);
    }
    fs::create_dir_all(parent_dir(to))?;
    fs::copy(from, to)?;
    Ok(true)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Advisory lock guarding a stage against concurrent deployments.
///
/// The settings and metadata documents are rewritten wholesale on every
/// mutation, so two writers would silently lose each other's progress.
/// The lock is an OS file lock on `<stage>.lock`, held for as long as the
/// guard keeps the file open. The kernel drops it when the process exits,
/// however it exits, so a killed run never blocks the next one. The file
/// itself stays behind and only records the last holder.
#[derive(Debug)]
pub struct DeploymentLock {
    path: PathBuf,
    file: File,
}

impl DeploymentLock {
    /// Acquire the lock for `stage` inside `dir`
    pub fn acquire(dir: &Path, stage: Stage) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", stage));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(DeployError::DeploymentLocked(path));
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        writeln!(
            file,
            "pid={} acquired_at={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )?;
        debug!("Acquired deployment lock {}", path.display());

        Ok(Self { path, file })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeploymentLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
