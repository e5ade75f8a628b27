//! The migration executor: resumable, ordered execution of one batch.
//!
//! Progress lives in the settings store's version counter (see
//! [`crate::progress`]). The executor only enforces ordering within a layer;
//! interleaving batches of the two layers is up to whoever invokes it.

use crate::cache::ScopedCacheSwap;
use crate::config::{DeployConfig, Layer, Stage};
use crate::contract::{ContractWrapperFactory, DeployConstants, DeployServices};
use crate::error::{DeployError, Result};
use crate::market::MarketTable;
use crate::metadata::SystemMetadataStore;
use crate::migration::{Migration, MigrationContext, MigrationId};
use crate::persist::DeploymentLock;
use crate::progress::{Progress, TASKS_PER_BATCH};
use crate::settings::SettingsStore;
use crate::types::Address;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Whether the batch being run is the last one of its layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handoff {
    /// More batches follow; keep upgrade authority
    #[default]
    Keep,
    /// Final batch: transfer upgrade-admin ownership to governance afterwards
    TransferToGovernance,
}

impl Handoff {
    /// `TransferToGovernance` when `final_layer` is set
    pub fn from_flag(final_layer: bool) -> Self {
        if final_layer {
            Handoff::TransferToGovernance
        } else {
            Handoff::Keep
        }
    }
}

/// Outcome of the governance handoff step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum HandoffOutcome {
    /// Not requested for this batch
    NotRequested,
    /// Ownership transferred to the governance address
    Transferred { governance: Address },
    /// Another layer on the same network already transferred it
    AlreadyTransferred { by: Layer, governance: Address },
}

/// Summary of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// Stage the batch ran on
    pub stage: Stage,
    /// Batch that ran
    pub batch: u64,
    /// Layer it ran on
    pub layer: Layer,
    /// Progress found when the execution started
    pub resumed_from: u64,
    /// Descriptions of the tasks run in this execution, in order
    pub executed: Vec<String>,
    /// Tasks skipped because an earlier execution completed them
    pub skipped: usize,
    /// Governance handoff
    pub handoff: HandoffOutcome,
    /// Version counter after the execution
    pub version: u64,
}

/// Runs migrations against the stores of one configuration
#[derive(Clone)]
pub struct MigrationExecutor {
    config: DeployConfig,
    services: DeployServices,
    markets: Arc<MarketTable>,
}

impl MigrationExecutor {
    /// Executor over the stores configured in `config`
    pub fn new(config: DeployConfig, services: DeployServices, markets: Arc<MarketTable>) -> Self {
        Self {
            config,
            services,
            markets,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Run `migration` on `stage`, resuming after the last completed task.
    ///
    /// Fails before any task runs unless the migration's batch is exactly the
    /// next batch recorded for its layer.
    pub async fn execute(
        &self,
        stage: Stage,
        migration: &Migration,
        handoff: Handoff,
    ) -> Result<ExecutionReport> {
        let id = migration.id();
        let _lock = DeploymentLock::acquire(&self.config.settings_dir, stage)?;

        let settings = SettingsStore::load(stage, &self.config.settings_dir)?;
        let progress = settings.progress(id.layer)?;
        check_sequence(id, progress)?;

        let metadata = SystemMetadataStore::load(&self.config.metadata_dir, &settings)?;

        let chain_id = settings.chain_id(id.layer)?;
        let network = settings.network(id.layer)?.to_string();
        let external_contracts = settings.external_contracts(id.layer)?.clone();
        let settings = settings.into_shared();
        let metadata = metadata.into_shared();

        let services = match migration.artifacts_root() {
            Some(root) => {
                info!("Using artifacts from {}", root.display());
                self.services
                    .with_resolver(self.services.resolver.rooted_at(root))
            }
            None => self.services.clone(),
        };
        let constants = DeployConstants::from_config(&self.config, stage, self.markets.clone());
        let factory = ContractWrapperFactory::new(
            id.layer,
            network.clone(),
            metadata.clone(),
            services,
            constants.clone(),
        );
        let context = MigrationContext {
            stage,
            layer: id.layer,
            settings: settings.clone(),
            metadata: metadata.clone(),
            external_contracts,
            constants,
            factory,
        };

        let tasks = migration.tasks(&context)?;
        let total = tasks.len() as u64;
        if total >= TASKS_PER_BATCH {
            return Err(DeployError::ConfigError(format!(
                "migration {} has {} tasks, at most {} are supported",
                id,
                total,
                TASKS_PER_BATCH - 1
            )));
        }
        if progress.task > total {
            return Err(DeployError::CorruptProgress {
                layer: id.layer,
                message: format!(
                    "progress is at task {} but migration {} has only {} tasks",
                    progress.task, id, total
                ),
            });
        }

        // only once the batch is known to be runnable
        if progress.is_start() {
            info!("Fresh deployment of {} on {}", id.layer, stage);
            metadata.write().await.clear_metadata(id.layer)?;
        }

        info!(
            "Running {} on {} from task {} of {}",
            id, stage, progress.task, total
        );

        let task_timeout = self.config.task_timeout();
        let executed = ScopedCacheSwap::run(&self.config.cache_dir, stage, chain_id, || async {
            let mut executed = Vec::new();
            for (index, task) in tasks.into_iter().enumerate().skip(progress.task as usize) {
                let description = task.description().to_string();
                info!("[{} {}/{}] {}", id, index + 1, total, description);

                match task_timeout {
                    Some(limit) => tokio::time::timeout(limit, task.run())
                        .await
                        .map_err(|_| DeployError::TaskTimeout {
                            description: description.clone(),
                            secs: limit.as_secs(),
                        })??,
                    None => task.run().await?,
                }

                settings.write().await.increase_version(id.layer)?;
                executed.push(description);
            }

            let outcome = match handoff {
                Handoff::Keep => HandoffOutcome::NotRequested,
                Handoff::TransferToGovernance => self.transfer_admin(&context).await?,
            };
            Ok((executed, outcome))
        })
        .await;
        let (executed, outcome) = executed?;

        let next = progress.next_batch().to_version();
        settings.write().await.set_version(id.layer, next)?;
        info!("Completed {} on {}", id, stage);

        Ok(ExecutionReport {
            stage,
            batch: id.batch,
            layer: id.layer,
            resumed_from: progress.to_version(),
            executed,
            skipped: progress.task as usize,
            handoff: outcome,
            version: next,
        })
    }

    /// Hand upgrade-admin ownership to governance, once per network
    async fn transfer_admin(&self, context: &MigrationContext) -> Result<HandoffOutcome> {
        let network = context.network().to_string();
        let governance = context
            .external_contracts
            .foundation_governance()
            .filter(|address| !address.is_empty())
            .ok_or_else(|| DeployError::MissingExternalContract {
                layer: context.layer,
                key: crate::types::external::FOUNDATION_GOVERNANCE.to_string(),
            })?
            .to_string();

        if let Some((by, to)) = context
            .metadata
            .read()
            .await
            .admin_transferred_on(&network)
        {
            warn!(
                "Upgrade admin on {} already transferred to {} by {}, skipping",
                network, to, by
            );
            return Ok(HandoffOutcome::AlreadyTransferred {
                by,
                governance: to.to_string(),
            });
        }

        info!(
            "Transferring upgrade admin on {} to governance {}",
            network, governance
        );
        let services = context.factory.services();
        let tx_hash = services
            .backend
            .transfer_proxy_admin_ownership(&network, &governance)
            .await?;
        if let Some(hash) = tx_hash {
            services
                .waiter
                .wait(&network, &hash, context.constants.confirmations)
                .await?;
        }
        context
            .metadata
            .write()
            .await
            .record_admin_transfer(context.layer, &governance)?;

        Ok(HandoffOutcome::Transferred { governance })
    }
}

fn check_sequence(id: MigrationId, progress: Progress) -> Result<()> {
    if id.batch != progress.batch {
        return Err(DeployError::SequenceViolation {
            layer: id.layer,
            attempted: id.batch,
            expected: progress.batch,
        });
    }
    Ok(())
}
