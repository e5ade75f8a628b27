//! Per-stage copies of the upgrade tool's network cache file.
//!
//! The upgrade tool keeps a single cache file per network. Stages that target
//! the same network would overwrite each other's proxy bookkeeping, so every
//! execution swaps the stage's own copy in before running and copies the
//! shared file back afterwards.

use crate::config::Stage;
use crate::error::Result;
use crate::persist::copy_if_exists;
use crate::upgrades::upgrade_cache_file_name;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Shared cache file location for `chain_id`
pub fn shared_cache_path(cache_dir: &Path, chain_id: u64) -> PathBuf {
    cache_dir.join(upgrade_cache_file_name(chain_id))
}

/// Stage-private copy of the cache file for `chain_id`
pub fn stage_cache_path(cache_dir: &Path, stage: Stage, chain_id: u64) -> PathBuf {
    cache_dir.join(format!("{}-{}", stage, upgrade_cache_file_name(chain_id)))
}

/// Guard holding the stage's cache copy in the shared location.
///
/// The copy back to the stage file happens exactly once: through
/// [`ScopedCacheSwap::release`], or on drop if the guarded work panicked or
/// was cancelled.
#[derive(Debug)]
pub struct ScopedCacheSwap {
    shared: PathBuf,
    stage_copy: PathBuf,
    released: bool,
}

impl ScopedCacheSwap {
    /// Copy the stage's cache file into the shared location.
    ///
    /// A missing stage copy means nothing to restore and is not an error.
    pub fn acquire(cache_dir: &Path, stage: Stage, chain_id: u64) -> Result<Self> {
        let shared = shared_cache_path(cache_dir, chain_id);
        let stage_copy = stage_cache_path(cache_dir, stage, chain_id);

        if copy_if_exists(&stage_copy, &shared)? {
            debug!("Restored {} into {}", stage_copy.display(), shared.display());
        } else {
            debug!("No cache copy for {} yet at {}", stage, stage_copy.display());
        }

        Ok(Self {
            shared,
            stage_copy,
            released: false,
        })
    }

    /// Shared file the upgrade tool reads and writes
    pub fn shared_path(&self) -> &Path {
        &self.shared
    }

    /// Stage-private copy
    pub fn stage_path(&self) -> &Path {
        &self.stage_copy
    }

    /// Copy the shared file back into the stage copy
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.copy_back()
    }

    fn copy_back(&self) -> Result<()> {
        if copy_if_exists(&self.shared, &self.stage_copy)? {
            info!("Saved upgrade cache to {}", self.stage_copy.display());
        }
        Ok(())
    }

    /// Run `work` between acquire and release.
    ///
    /// The copy-back runs whatever `work` returns. When `work` fails, a
    /// copy-back failure is logged and the task error is the one returned.
    pub async fn run<F, Fut, T>(cache_dir: &Path, stage: Stage, chain_id: u64, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let swap = Self::acquire(cache_dir, stage, chain_id)?;
        match work().await {
            Ok(value) => {
                swap.release()?;
                Ok(value)
            }
            Err(error) => {
                if let Err(release_error) = swap.release() {
                    warn!("Failed to save upgrade cache after error: {}", release_error);
                }
                Err(error)
            }
        }
    }
}

impl Drop for ScopedCacheSwap {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.copy_back() {
            warn!("Failed to save upgrade cache {}: {}", self.stage_copy.display(), e);
        }
    }
}
