//! Dry runs of a migration against a local fork.
//!
//! The test stage is seeded with the settings, metadata and upgrade-tool cache
//! of a real stage, the local node is reset onto a fork of that stage's
//! network, and the migration then runs on the test stage. Nothing of the
//! source stage is modified.

use crate::cache::stage_cache_path;
use crate::config::{DeployConfig, Layer, Stage};
use crate::error::{DeployError, Result};
use crate::executor::{ExecutionReport, Handoff, MigrationExecutor};
use crate::metadata::{MetadataDocument, SystemMetadataStore};
use crate::migration::Migration;
use crate::persist::{copy_if_exists, read_json, write_json_atomic, DeploymentLock};
use crate::rpc::NodeRpcClient;
use crate::settings::{SettingsStore, LOCAL_CHAIN_ID, LOCAL_NETWORK};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

/// A migration dry run on a fork of `fork_url`
#[derive(Debug, Clone)]
pub struct ForkSimulation {
    fork_url: String,
    source_stage: Stage,
    block_number: Option<u64>,
}

impl ForkSimulation {
    /// Fork `fork_url`, seeding the test stage from staging
    pub fn new(fork_url: impl Into<String>) -> Self {
        Self {
            fork_url: fork_url.into(),
            source_stage: Stage::Staging,
            block_number: None,
        }
    }

    /// Seed from `stage` instead of staging
    pub fn from_stage(mut self, stage: Stage) -> Self {
        self.source_stage = stage;
        self
    }

    /// Pin the fork to `block_number`
    pub fn at_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    /// Stage whose state is copied
    pub fn source_stage(&self) -> Stage {
        self.source_stage
    }

    /// Copy the source stage's documents into the test stage.
    ///
    /// Every layer is pointed at the local node, and admin transfers recorded
    /// for the source networks are dropped. The upgrade-tool cache is
    /// taken from the source chain of `layer`; when the source has none, any
    /// stale test copy is removed.
    pub fn prepare(&self, config: &DeployConfig, layer: Layer) -> Result<()> {
        if self.source_stage == Stage::Test {
            return Err(DeployError::ConfigError(
                "cannot simulate on top of the test stage itself".to_string(),
            ));
        }
        let _lock = DeploymentLock::acquire(&config.settings_dir, Stage::Test)?;

        let source = SettingsStore::load(self.source_stage, &config.settings_dir)?;
        let source_chain_id = source.chain_id(layer)?;

        let mut document = source.document().clone();
        for settings in document.layers.values_mut() {
            settings.network = LOCAL_NETWORK.to_string();
            settings.chain_id = LOCAL_CHAIN_ID;
        }
        SettingsStore::from_document(
            Stage::Test,
            SettingsStore::path_for(&config.settings_dir, Stage::Test),
            document,
        )
        .persist()?;

        let source_metadata = SystemMetadataStore::path_for(&config.metadata_dir, self.source_stage);
        let mut metadata = read_json::<MetadataDocument>(&source_metadata)?.unwrap_or_default();
        for layer_metadata in metadata.layers.values_mut() {
            layer_metadata.network = LOCAL_NETWORK.to_string();
            // one local network stands in for both source networks
            layer_metadata.admin_transferred_to = None;
        }
        write_json_atomic(
            &SystemMetadataStore::path_for(&config.metadata_dir, Stage::Test),
            &metadata,
        )?;

        let from = stage_cache_path(&config.cache_dir, self.source_stage, source_chain_id);
        let to = stage_cache_path(&config.cache_dir, Stage::Test, LOCAL_CHAIN_ID);
        if copy_if_exists(&from, &to)? {
            debug!("Seeded {} from {}", to.display(), from.display());
        } else {
            remove_if_exists(&to)?;
        }

        info!(
            "Seeded test stage from {} ({} on chain {})",
            self.source_stage, layer, source_chain_id
        );
        Ok(())
    }

    /// Seed the test stage, reset the local node onto the fork and run
    /// `migration` on the test stage
    pub async fn run(
        &self,
        executor: &MigrationExecutor,
        node: &NodeRpcClient,
        migration: &Migration,
        handoff: Handoff,
    ) -> Result<ExecutionReport> {
        self.prepare(executor.config(), migration.layer())?;
        node.reset_fork(&self.fork_url, self.block_number).await?;
        info!(
            "Simulating {} against a fork of {}",
            migration.id(),
            self.fork_url
        );
        executor.execute(Stage::Test, migration, handoff).await
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
