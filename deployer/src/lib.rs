//! Deployment orchestration for a two-layer DEX
//!
//! This library runs ordered, resumable batches of deployment and upgrade
//! tasks against two networks (layer1 and layer2). Progress is checkpointed
//! after every task in a per-stage settings document, so an interrupted run
//! resumes at the first task that did not complete. Deployed addresses are
//! recorded in a per-stage metadata document that doubles as the address book
//! of later tasks.
//!
//! # Features
//!
//! - **Migrations**: `NNNN-<layer>-<description>` files, one batch each,
//!   executed strictly in order per layer
//! - **Resumption**: a single `batch * 1000 + task` counter per layer
//! - **Contract wrappers**: deploy, upgrade and look up contracts by alias
//!   with a name-consistency guard
//! - **Upgrade-tool cache isolation**: per-stage copies of the tool's network
//!   cache, swapped in for the duration of a batch
//! - **Governance handoff**: upgrade-admin ownership moves to governance once
//!   per network after the final batch
//! - **Fork simulation**: rehearse a migration against a local fork
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dex_deployer::{DeployConfig, Deployer, Handoff, Stage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     tracing_subscriber::fmt::init();
//!
//!     let deployer = Deployer::new(DeployConfig::new("."))?;
//!     let report = deployer
//!         .migrate(Stage::Staging, "migrations/0000-layer1-core.toml", Handoff::Keep)
//!         .await?;
//!
//!     println!("Ran {} task(s), version now {}", report.executed.len(), report.version);
//!     Ok(())
//! }
//! ```
//!
//! ## Rehearse on a fork
//!
//! ```rust,no_run
//! use dex_deployer::{DeployConfig, Deployer, ForkSimulation, Handoff};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let deployer = Deployer::new(DeployConfig::new("."))?;
//! let simulation = ForkSimulation::new("https://rinkeby.example/rpc");
//! deployer
//!     .simulate(&simulation, "migrations/0003-layer2-amm.toml", Handoff::Keep)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod bridge;
pub mod cache;
pub mod config;
pub mod contract;
pub mod error;
pub mod executor;
pub mod market;
pub mod metadata;
pub mod migration;
pub mod monitor;
pub mod persist;
pub mod plan;
pub mod progress;
pub mod publisher;
pub mod retry;
pub mod rpc;
pub mod settings;
pub mod simulate;
pub mod types;
pub mod upgrades;

// Re-export commonly used types
pub use bridge::CommandUpgradeBackend;
pub use cache::ScopedCacheSwap;
pub use config::{DeployConfig, Layer, Stage};
pub use contract::{
    AmmContractWrapper, ContractWrapper, ContractWrapperFactory, DeployConstants, DeployServices,
};
pub use error::{DeployError, Result};
pub use executor::{ExecutionReport, Handoff, HandoffOutcome, MigrationExecutor};
pub use market::{AmmConfig, MarketTable};
pub use metadata::{LocalNetwork, SystemMetadataStore};
pub use migration::{Migration, MigrationContext, MigrationId, MigrationTasks, Task};
pub use monitor::{ConfirmationMonitor, ConfirmationWaiter, NoConfirmations};
pub use plan::{MigrationPlan, PublishPlan, TaskAction};
pub use progress::Progress;
pub use publisher::ContractPublisher;
pub use retry::{Retry, RetryStrategy};
pub use rpc::NodeRpcClient;
pub use settings::SettingsStore;
pub use simulate::ForkSimulation;
pub use types::{Address, ContractMetadata, Deployment, ExternalContracts, TransactionHash};
pub use upgrades::{ArtifactResolver, ContractName, FsArtifactResolver, ProxyOptions, UpgradeBackend};

use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Entry point wiring configuration, upgrade tool, artifacts and node into
/// the executor.
#[derive(Clone)]
pub struct Deployer {
    executor: MigrationExecutor,
    services: DeployServices,
    node: NodeRpcClient,
}

impl Deployer {
    /// Create a deployer driving the configured upgrade tool and node
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use dex_deployer::{DeployConfig, Deployer};
    ///
    /// let deployer = Deployer::new(DeployConfig::new("/srv/dex")).unwrap();
    /// ```
    pub fn new(config: DeployConfig) -> Result<Self> {
        config.validate()?;

        let node = NodeRpcClient::new(&config)?;
        let services = DeployServices::new(
            Arc::new(CommandUpgradeBackend::from_config(&config)?),
            Arc::new(FsArtifactResolver::new(&config.artifacts_dir)),
            Arc::new(ConfirmationMonitor::from_config(&config)?),
        );
        Self::with_services(config, services, node)
    }

    /// Create a deployer around explicit collaborators
    pub fn with_services(
        config: DeployConfig,
        services: DeployServices,
        node: NodeRpcClient,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing deployer (settings: {}, node: {})",
            config.settings_dir.display(),
            node.url()
        );

        let executor =
            MigrationExecutor::new(config, services.clone(), Arc::new(MarketTable::builtin()));
        Ok(Self {
            executor,
            services,
            node,
        })
    }

    /// Use `markets` for AMM parameters instead of the built-in table
    pub fn with_markets(self, markets: MarketTable) -> Self {
        let executor = MigrationExecutor::new(
            self.executor.config().clone(),
            self.services.clone(),
            Arc::new(markets),
        );
        Self { executor, ..self }
    }

    /// Get the executor
    pub fn executor(&self) -> &MigrationExecutor {
        &self.executor
    }

    /// Get the node client
    pub fn node(&self) -> &NodeRpcClient {
        &self.node
    }

    /// Get configuration
    pub fn config(&self) -> &DeployConfig {
        self.executor.config()
    }

    /// Load the migration file at `path` and run it on `stage`
    pub async fn migrate(
        &self,
        stage: Stage,
        path: impl AsRef<Path>,
        handoff: Handoff,
    ) -> Result<ExecutionReport> {
        let migration = Migration::load(path)?;
        self.executor.execute(stage, &migration, handoff).await
    }

    /// Run batch `batch` of `layer` from the publish plan at `plan_path`
    pub async fn publish_layer(
        &self,
        stage: Stage,
        plan_path: impl AsRef<Path>,
        layer: Layer,
        batch: u64,
    ) -> Result<ExecutionReport> {
        ContractPublisher::load(self.executor.clone(), plan_path)?
            .deploy_layer(stage, layer, batch)
            .await
    }

    /// Rehearse the migration at `path` on a fork, in the test stage
    pub async fn simulate(
        &self,
        simulation: &ForkSimulation,
        path: impl AsRef<Path>,
        handoff: Handoff,
    ) -> Result<ExecutionReport> {
        let migration = Migration::load(path)?;
        simulation
            .run(&self.executor, &self.node, &migration, handoff)
            .await
    }

    /// Health check - verify the node answers
    pub async fn health_check(&self) -> Result<bool> {
        self.node.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployer_creation() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = Deployer::new(DeployConfig::new(dir.path()));
        assert!(deployer.is_ok());
    }

    #[test]
    fn test_deployer_config_access() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeployConfig::new(dir.path()).with_rpc_url("http://127.0.0.1:9545");
        let deployer = Deployer::new(config).unwrap();
        assert_eq!(deployer.config().rpc_url, "http://127.0.0.1:9545");
        assert_eq!(deployer.node().url(), "http://127.0.0.1:9545");
    }

    #[test]
    fn test_invalid_config() {
        let mut config = DeployConfig::default();
        config.max_retries = 0;
        assert!(Deployer::new(config).is_err());
    }
}
