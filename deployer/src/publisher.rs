//! Legacy publisher: all batches of both layers in a single plan file.
//!
//! Batches are addressed as `(layer, index)` and run through the same
//! executor as migration files, so both paths share one progress counter
//! layout and one governance handoff rule.

use crate::config::{Layer, Stage};
use crate::error::{DeployError, Result};
use crate::executor::{ExecutionReport, Handoff, MigrationExecutor};
use crate::migration::{Migration, MigrationId};
use crate::plan::PublishPlan;
use crate::settings::SettingsStore;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Runs batches of a [`PublishPlan`]
pub struct ContractPublisher {
    executor: MigrationExecutor,
    plan: PublishPlan,
    plan_path: PathBuf,
}

impl ContractPublisher {
    /// Publisher running `plan`, read from `plan_path`
    pub fn new(executor: MigrationExecutor, plan: PublishPlan, plan_path: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            plan,
            plan_path: plan_path.into(),
        }
    }

    /// Read the plan at `path`
    pub fn load(executor: MigrationExecutor, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let plan = PublishPlan::from_file(path)?;
        Ok(Self::new(executor, plan, path))
    }

    /// The plan
    pub fn plan(&self) -> &PublishPlan {
        &self.plan
    }

    /// Number of batches planned for `layer`
    pub fn batch_count(&self, layer: Layer) -> usize {
        self.plan.batches(layer).len()
    }

    /// Run batch `batch` of `layer` on `stage`
    pub async fn deploy_layer(
        &self,
        stage: Stage,
        layer: Layer,
        batch: u64,
    ) -> Result<ExecutionReport> {
        let plan = self
            .plan
            .batches(layer)
            .get(batch as usize)
            .cloned()
            .ok_or_else(|| {
                DeployError::ConfigError(format!(
                    "{} has no batch {} for {} ({} planned)",
                    self.plan_path.display(),
                    batch,
                    layer,
                    self.batch_count(layer)
                ))
            })?;

        let handoff = self.handoff_for(stage, layer, batch)?;
        info!(
            "Publishing {} batch {} on {} ({:?})",
            layer, batch, stage, handoff
        );

        let migration = Migration::with_id(MigrationId::new(batch, layer), &self.plan_path, plan);
        self.executor.execute(stage, &migration, handoff).await
    }

    /// Handoff rule: the last batch of a layer hands off, but when both layers
    /// share a network only the plan's `final_layer` does.
    pub fn handoff_for(&self, stage: Stage, layer: Layer, batch: u64) -> Result<Handoff> {
        if batch + 1 != self.batch_count(layer) as u64 {
            return Ok(Handoff::Keep);
        }

        let settings = SettingsStore::load(stage, &self.executor.config().settings_dir)?;
        if !settings.layers_share_network() {
            return Ok(Handoff::TransferToGovernance);
        }

        match self.plan.final_layer {
            Some(final_layer) => Ok(Handoff::from_flag(final_layer == layer)),
            None => {
                warn!(
                    "Both layers of {} share a network and the plan names no final_layer; not transferring admin",
                    stage
                );
                Ok(Handoff::Keep)
            }
        }
    }
}
