//! System metadata store: the durable record of what has been deployed where.
//!
//! Loading never fails on a missing file (the first deployment has none) and
//! always overlays the current settings' network and external contracts onto
//! the stored layers while keeping every recorded contract address.

use crate::config::{Layer, Stage};
use crate::error::{DeployError, Result};
use crate::persist::{read_json, write_json_atomic};
use crate::settings::SettingsStore;
use crate::types::{Address, ContractMetadata, ExternalContracts, LocalAccount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Metadata store shared between the executor and running tasks
pub type SharedMetadata = Arc<RwLock<SystemMetadataStore>>;

/// Network names that denote a throwaway local development node
const LOCAL_NETWORK_NAMES: [&str; 2] = ["localhost", "hardhat"];

/// What is known about one layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerMetadata {
    /// Network the layer is deployed on
    pub network: String,
    /// Funded local accounts; only ever populated for local networks
    #[serde(default)]
    pub accounts: Vec<LocalAccount>,
    /// Deployed contracts keyed by alias
    #[serde(default)]
    pub contracts: BTreeMap<String, ContractMetadata>,
    /// Snapshot of the settings' external contracts
    #[serde(default)]
    pub external_contracts: ExternalContracts,
    /// Governance address that received upgrade-admin ownership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_transferred_to: Option<Address>,
}

impl LayerMetadata {
    fn for_network(network: &str) -> Self {
        Self {
            network: network.to_string(),
            ..Self::default()
        }
    }
}

/// The persisted metadata document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    /// Known layers
    #[serde(default)]
    pub layers: BTreeMap<Layer, LayerMetadata>,
}

/// Proof that a network is a local development node.
///
/// [`SystemMetadataStore::set_accounts`] only accepts accounts alongside this
/// value, and it can only be obtained for local network names, so private
/// keys cannot reach the metadata of a real network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetwork {
    name: String,
}

impl LocalNetwork {
    /// `Some` only when `network` names a local development node
    pub fn detect(network: &str) -> Option<Self> {
        LOCAL_NETWORK_NAMES
            .contains(&network)
            .then(|| Self {
                name: network.to_string(),
            })
    }

    /// Network name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owns the metadata document of one stage
#[derive(Debug, Clone)]
pub struct SystemMetadataStore {
    stage: Stage,
    path: PathBuf,
    document: MetadataDocument,
}

impl SystemMetadataStore {
    /// Location of a stage's metadata file inside `dir`
    pub fn path_for(dir: &Path, stage: Stage) -> PathBuf {
        dir.join(format!("{}.json", stage))
    }

    /// Load the stored document (empty when absent) and reconcile it with `settings`
    pub fn load(dir: &Path, settings: &SettingsStore) -> Result<Self> {
        let stage = settings.stage();
        let path = Self::path_for(dir, stage);
        let document = read_json::<MetadataDocument>(&path)?.unwrap_or_default();

        let mut store = Self {
            stage,
            path,
            document,
        };
        store.merge_settings(settings);
        Ok(store)
    }

    /// Overlay network and external contracts from `settings`; idempotent
    pub fn merge_settings(&mut self, settings: &SettingsStore) {
        for (layer, layer_settings) in settings.layers() {
            let entry = self
                .document
                .layers
                .entry(layer)
                .or_insert_with(|| LayerMetadata::for_network(&layer_settings.network));
            entry.network = layer_settings.network.clone();
            entry.external_contracts = layer_settings.external_contracts.clone();
        }
    }

    /// Convert into a handle shared with tasks
    pub fn into_shared(self) -> SharedMetadata {
        Arc::new(RwLock::new(self))
    }

    /// Active stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Metadata file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full document
    pub fn document(&self) -> &MetadataDocument {
        &self.document
    }

    /// Metadata of one layer
    pub fn layer(&self, layer: Layer) -> Result<&LayerMetadata> {
        self.document
            .layers
            .get(&layer)
            .ok_or(DeployError::LayerNotConfigured {
                stage: self.stage,
                layer,
            })
    }

    fn layer_mut(&mut self, layer: Layer) -> Result<&mut LayerMetadata> {
        let stage = self.stage;
        self.document
            .layers
            .get_mut(&layer)
            .ok_or(DeployError::LayerNotConfigured { stage, layer })
    }

    /// Recorded contract for `alias`; `None` means not deployed yet
    pub fn contract_metadata(&self, layer: Layer, alias: &str) -> Option<&ContractMetadata> {
        self.document
            .layers
            .get(&layer)
            .and_then(|l| l.contracts.get(alias))
    }

    /// Record `alias` and persist.
    ///
    /// An alias may be re-pointed to a new address but never to a contract with
    /// a different name.
    pub fn set_contract(
        &mut self,
        layer: Layer,
        alias: &str,
        metadata: ContractMetadata,
    ) -> Result<()> {
        let entry = self.layer_mut(layer)?;
        if let Some(existing) = entry.contracts.get(alias) {
            if existing.name != metadata.name {
                return Err(DeployError::MetadataNameMismatch {
                    layer,
                    alias: alias.to_string(),
                    recorded: existing.name.clone(),
                    expected: metadata.name,
                });
            }
        }

        info!(
            "Recording {} ({}) at {} on {}",
            alias, metadata.name, metadata.address, layer
        );
        entry.contracts.insert(alias.to_string(), metadata);
        self.persist()
    }

    /// Wipe a layer's contracts, accounts and handoff record; keeps its network
    pub fn clear_metadata(&mut self, layer: Layer) -> Result<()> {
        let entry = self.layer_mut(layer)?;
        entry.contracts.clear();
        entry.accounts.clear();
        entry.admin_transferred_to = None;
        info!("Cleared {} metadata of {}", self.stage, layer);
        self.persist()
    }

    /// Record funded accounts of a local development node
    pub fn set_accounts(
        &mut self,
        layer: Layer,
        network: &LocalNetwork,
        accounts: Vec<LocalAccount>,
    ) -> Result<()> {
        let entry = self.layer_mut(layer)?;
        if entry.network != network.name() {
            return Err(DeployError::NonLocalAccounts(entry.network.clone()));
        }
        entry.accounts = accounts;
        debug!("Recorded {} local accounts on {}", entry.accounts.len(), layer);
        self.persist()
    }

    /// Record that upgrade-admin ownership of `layer` went to `governance`
    pub fn record_admin_transfer(&mut self, layer: Layer, governance: &str) -> Result<()> {
        self.layer_mut(layer)?.admin_transferred_to = Some(governance.to_string());
        self.persist()
    }

    /// Layer on `network` whose admin has already been handed off, if any
    pub fn admin_transferred_on(&self, network: &str) -> Option<(Layer, &str)> {
        self.document.layers.iter().find_map(|(layer, meta)| {
            match (&meta.admin_transferred_to, meta.network == network) {
                (Some(to), true) => Some((*layer, to.as_str())),
                _ => None,
            }
        })
    }

    /// Rewrite the whole document to disk
    pub fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.document)
    }
}
