//! Contract wrappers: deploy, upgrade and look up one logical contract
//! instance of a layer, with the metadata store as address book.
//!
//! A wrapper is bound to a fully-qualified contract name and an alias. Every
//! operation first checks that whatever is recorded under the alias carries
//! the same contract name, so a stale alias can never route a call to the
//! wrong contract.

use crate::config::{DeployConfig, Layer, Stage};
use crate::error::{DeployError, Result};
use crate::market::{AmmConfig, MarketTable};
use crate::metadata::SharedMetadata;
use crate::monitor::ConfirmationWaiter;
use crate::types::{Address, ContractMetadata, TransactionHash};
use crate::upgrades::{ArtifactResolver, ContractFactory, ContractName, ProxyOptions, UpgradeBackend};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Contract every AMM market instance is deployed from
pub const AMM_CONTRACT: &str = "contracts/Amm.sol:Amm";

/// Constants of one deployment run
#[derive(Debug, Clone)]
pub struct DeployConstants {
    /// Confirmations awaited per transaction
    pub confirmations: u64,
    /// Pause after proxy operations
    pub post_deploy_delay: Duration,
    /// AMM parameters
    pub markets: Arc<MarketTable>,
}

impl DeployConstants {
    /// Constants for `stage` under `config`
    pub fn from_config(config: &DeployConfig, stage: Stage, markets: Arc<MarketTable>) -> Self {
        Self {
            confirmations: config.confirmations_for(stage),
            post_deploy_delay: config.post_deploy_delay(),
            markets,
        }
    }
}

/// External collaborators every wrapper talks to
#[derive(Clone)]
pub struct DeployServices {
    /// Upgrade-proxy tool
    pub backend: Arc<dyn UpgradeBackend>,
    /// Artifact lookup
    pub resolver: Arc<dyn ArtifactResolver>,
    /// Confirmation tracking
    pub waiter: Arc<dyn ConfirmationWaiter>,
}

impl DeployServices {
    /// Bundle the collaborators
    pub fn new(
        backend: Arc<dyn UpgradeBackend>,
        resolver: Arc<dyn ArtifactResolver>,
        waiter: Arc<dyn ConfirmationWaiter>,
    ) -> Self {
        Self {
            backend,
            resolver,
            waiter,
        }
    }

    /// Same services reading artifacts through `resolver`
    pub fn with_resolver(&self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        Self {
            resolver,
            ..self.clone()
        }
    }
}

/// A contract at a known address
#[derive(Debug, Clone)]
pub struct ContractHandle {
    alias: String,
    address: Address,
    factory: ContractFactory,
}

impl ContractHandle {
    /// Alias it is recorded under
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Deployed (proxy) address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Artifact the handle was built from
    pub fn factory(&self) -> &ContractFactory {
        &self.factory
    }
}

/// Builds wrappers bound to one layer, its metadata and the run constants
#[derive(Clone)]
pub struct ContractWrapperFactory {
    layer: Layer,
    network: String,
    metadata: SharedMetadata,
    services: DeployServices,
    constants: DeployConstants,
}

impl ContractWrapperFactory {
    pub fn new(
        layer: Layer,
        network: impl Into<String>,
        metadata: SharedMetadata,
        services: DeployServices,
        constants: DeployConstants,
    ) -> Self {
        Self {
            layer,
            network: network.into(),
            metadata,
            services,
            constants,
        }
    }

    /// Layer wrappers operate on
    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// Network transactions are sent to
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Metadata handle
    pub fn metadata(&self) -> &SharedMetadata {
        &self.metadata
    }

    /// Run constants
    pub fn constants(&self) -> &DeployConstants {
        &self.constants
    }

    /// Collaborators
    pub fn services(&self) -> &DeployServices {
        &self.services
    }

    /// Factory reading artifacts through another resolver
    pub fn with_resolver(&self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        Self {
            services: self.services.with_resolver(resolver),
            ..self.clone()
        }
    }

    /// Wrapper for `name` recorded under `alias`
    pub fn create(&self, name: ContractName, alias: impl Into<String>) -> ContractWrapper {
        ContractWrapper {
            factory: self.clone(),
            alias: alias.into(),
            name,
        }
    }

    /// Wrapper for `name` recorded under its own contract name
    pub fn contract(&self, name: ContractName) -> ContractWrapper {
        let alias = name.name().to_string();
        self.create(name, alias)
    }

    /// Wrapper for the AMM instance of `market`
    pub fn amm(&self, market: &str) -> Result<AmmContractWrapper> {
        Ok(AmmContractWrapper {
            inner: self.create(AMM_CONTRACT.parse()?, market),
            market: market.to_string(),
        })
    }
}

/// One logical contract instance of a layer
#[derive(Clone)]
pub struct ContractWrapper {
    factory: ContractWrapperFactory,
    name: ContractName,
    alias: String,
}

impl ContractWrapper {
    /// Contract name
    pub fn name(&self) -> &ContractName {
        &self.name
    }

    /// Alias the instance is recorded under
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Deploy without a proxy and record the address
    pub async fn deploy_immutable(&self, args: &[Value]) -> Result<ContractHandle> {
        self.recorded().await?;
        let artifact = self.resolve()?;
        info!(
            "Deploying {} as {} on {}",
            self.name,
            self.alias,
            self.factory.layer
        );

        let deployment = self
            .services()
            .backend
            .deploy(&self.factory.network, &artifact, args)
            .await?;
        self.confirm(deployment.tx_hash.as_deref()).await?;
        self.record(&deployment.address).await?;

        Ok(self.handle(deployment.address, artifact))
    }

    /// Deploy behind a proxy, run the initializer and record the proxy address
    pub async fn deploy_upgradable(
        &self,
        init_args: &[Value],
        options: &ProxyOptions,
    ) -> Result<ContractHandle> {
        self.recorded().await?;
        let artifact = self.resolve()?;
        info!(
            "Deploying upgradable {} as {} on {}",
            self.name,
            self.alias,
            self.factory.layer
        );

        let deployment = self
            .services()
            .backend
            .deploy_proxy(&self.factory.network, &artifact, init_args, options)
            .await?;
        self.confirm(deployment.tx_hash.as_deref()).await?;
        self.settle().await;
        self.record(&deployment.address).await?;

        Ok(self.handle(deployment.address, artifact))
    }

    /// Deploy a new implementation without switching the proxy.
    ///
    /// Returns the implementation address for governance to switch to.
    pub async fn prepare_upgrade(&self) -> Result<Address> {
        let proxy = self.address().await?;
        let artifact = self.resolve()?;
        info!("Preparing upgrade of {} ({}) at {}", self.alias, self.name, proxy);

        let implementation = self
            .services()
            .backend
            .prepare_upgrade(&self.factory.network, &proxy, &artifact)
            .await?;
        self.settle().await;
        info!("New implementation of {} at {}", self.alias, implementation);

        Ok(implementation)
    }

    /// Deploy a new implementation and switch the proxy to it
    pub async fn upgrade(&self, options: &ProxyOptions) -> Result<ContractHandle> {
        let proxy = self.address().await?;
        let artifact = self.resolve()?;
        info!("Upgrading {} ({}) at {}", self.alias, self.name, proxy);

        let deployment = self
            .services()
            .backend
            .upgrade_proxy(&self.factory.network, &proxy, &artifact, options)
            .await?;
        self.confirm(deployment.tx_hash.as_deref()).await?;
        self.settle().await;

        Ok(self.handle(proxy, artifact))
    }

    /// Handle bound to the recorded address
    pub async fn instance(&self) -> Result<ContractHandle> {
        let address = self.address().await?;
        let artifact = self.resolve()?;
        Ok(self.handle(address, artifact))
    }

    /// Recorded address
    pub async fn address(&self) -> Result<Address> {
        self.recorded()
            .await?
            .map(|recorded| recorded.address)
            .ok_or_else(|| DeployError::ContractNotDeployed {
                layer: self.factory.layer,
                alias: self.alias.clone(),
            })
    }

    /// Call `method` on the recorded instance and wait for confirmations
    pub async fn send(&self, method: &str, args: &[Value]) -> Result<Option<TransactionHash>> {
        let instance = self.instance().await?;
        info!("Calling {}.{} at {}", self.alias, method, instance.address);

        let tx_hash = self
            .services()
            .backend
            .send(
                &self.factory.network,
                &instance.address,
                &instance.factory,
                method,
                args,
            )
            .await?;
        self.confirm(tx_hash.as_deref()).await?;

        Ok(tx_hash)
    }

    fn services(&self) -> &DeployServices {
        &self.factory.services
    }

    fn resolve(&self) -> Result<ContractFactory> {
        self.services().resolver.resolve(&self.name)
    }

    fn handle(&self, address: Address, factory: ContractFactory) -> ContractHandle {
        ContractHandle {
            alias: self.alias.clone(),
            address,
            factory,
        }
    }

    /// Recorded entry for the alias, rejecting a different contract name
    async fn recorded(&self) -> Result<Option<ContractMetadata>> {
        let metadata = self.factory.metadata.read().await;
        match metadata.contract_metadata(self.factory.layer, &self.alias) {
            Some(recorded) if recorded.name != self.name.name() => {
                Err(DeployError::MetadataNameMismatch {
                    layer: self.factory.layer,
                    alias: self.alias.clone(),
                    recorded: recorded.name.clone(),
                    expected: self.name.name().to_string(),
                })
            }
            recorded => Ok(recorded.cloned()),
        }
    }

    async fn record(&self, address: &str) -> Result<()> {
        self.factory.metadata.write().await.set_contract(
            self.factory.layer,
            &self.alias,
            ContractMetadata::new(self.name.name(), address),
        )
    }

    async fn confirm(&self, tx_hash: Option<&str>) -> Result<()> {
        match tx_hash {
            Some(hash) => {
                self.services()
                    .waiter
                    .wait(&self.factory.network, hash, self.factory.constants.confirmations)
                    .await
            }
            None => {
                debug!("No transaction hash reported for {}", self.alias);
                Ok(())
            }
        }
    }

    // the upgrade tool updates its cache file asynchronously
    async fn settle(&self) {
        let delay = self.factory.constants.post_deploy_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// AMM instance of one market
#[derive(Clone)]
pub struct AmmContractWrapper {
    inner: ContractWrapper,
    market: String,
}

impl AmmContractWrapper {
    /// Market name, also the alias
    pub fn market(&self) -> &str {
        &self.market
    }

    /// Underlying wrapper for upgrades and lookups
    pub fn contract(&self) -> &ContractWrapper {
        &self.inner
    }

    /// Parameters of this market on the wrapper's network
    pub fn config(&self) -> Result<AmmConfig> {
        let factory = &self.inner.factory;
        factory
            .constants
            .markets
            .lookup(&factory.network, &self.market)
            .cloned()
    }

    /// Deploy the market behind a proxy and apply its caps
    pub async fn deploy(&self, price_feed: &str, quote_asset: &str) -> Result<ContractHandle> {
        let config = self.config()?;
        let handle = self
            .inner
            .deploy_upgradable(
                &config.init_args(price_feed, quote_asset),
                &ProxyOptions::default(),
            )
            .await?;

        info!("Applying caps to {}", self.market);
        self.inner.send("setCap", &config.cap_args()).await?;

        Ok(handle)
    }
}
