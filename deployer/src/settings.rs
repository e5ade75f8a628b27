//! Settings store: per-stage, per-layer deployment configuration and the
//! progress counter that anchors resumption.
//!
//! Every mutation rewrites the whole settings document before returning, so
//! a crash between two task completions leaves the counter at the last fully
//! completed task.

use crate::config::{Layer, Stage};
use crate::error::{DeployError, Result};
use crate::persist::{read_json, write_json_atomic};
use crate::progress::Progress;
use crate::types::{external, ExternalContracts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Settings store shared between the executor and running tasks
pub type SharedSettings = Arc<RwLock<SettingsStore>>;

/// Chain id of a local development node
pub const LOCAL_CHAIN_ID: u64 = 31337;

/// Network name of a local development node
pub const LOCAL_NETWORK: &str = "localhost";

/// Configuration of one layer within a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSettings {
    /// Chain id of the layer's network
    pub chain_id: u64,
    /// RPC network name understood by the upgrade tool
    pub network: String,
    /// Addresses of externally deployed contracts
    #[serde(default)]
    pub external_contracts: ExternalContracts,
    /// Progress counter, persisted as a decimal string
    #[serde(with = "version_string")]
    pub version: u64,
}

/// The persisted settings document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsDocument {
    /// Configured layers
    #[serde(default)]
    pub layers: BTreeMap<Layer, LayerSettings>,
}

impl SettingsDocument {
    /// Dataset used for the test stage when no settings file exists yet
    pub fn test_defaults() -> Self {
        let layer = |_: Layer| LayerSettings {
            chain_id: LOCAL_CHAIN_ID,
            network: LOCAL_NETWORK.to_string(),
            external_contracts: ExternalContracts::new().with(
                external::FOUNDATION_GOVERNANCE,
                "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
            ),
            version: 0,
        };
        Self {
            layers: Layer::ALL.iter().map(|l| (*l, layer(*l))).collect(),
        }
    }
}

mod version_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| D::Error::custom(format!("invalid version {:?}: {}", raw, e)))
    }
}

/// Owns the settings document of one stage and its on-disk location
#[derive(Debug, Clone)]
pub struct SettingsStore {
    stage: Stage,
    path: PathBuf,
    document: SettingsDocument,
}

impl SettingsStore {
    /// Location of a stage's settings file inside `dir`
    pub fn path_for(dir: &Path, stage: Stage) -> PathBuf {
        dir.join(format!("{}.json", stage))
    }

    /// Load the settings of `stage` from `dir`.
    ///
    /// The test stage falls back to [`SettingsDocument::test_defaults`] when no
    /// file exists; other stages require a checked-in file.
    pub fn load(stage: Stage, dir: &Path) -> Result<Self> {
        let path = Self::path_for(dir, stage);
        let document = match read_json::<SettingsDocument>(&path)? {
            Some(document) => document,
            None if stage == Stage::Test => {
                info!("No test settings at {}, using defaults", path.display());
                SettingsDocument::test_defaults()
            }
            None => return Err(DeployError::SettingsNotFound(path)),
        };

        Ok(Self {
            stage,
            path,
            document,
        })
    }

    /// Load by stage name, failing on unrecognized names before touching disk
    pub fn load_named(stage: &str, dir: &Path) -> Result<Self> {
        Self::load(stage.parse()?, dir)
    }

    /// Wrap an in-memory document; nothing is written until the first mutation
    pub fn from_document(stage: Stage, path: PathBuf, document: SettingsDocument) -> Self {
        Self {
            stage,
            path,
            document,
        }
    }

    /// Convert into a handle shared with tasks
    pub fn into_shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    /// Active stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Settings file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full document
    pub fn document(&self) -> &SettingsDocument {
        &self.document
    }

    /// Configured layers
    pub fn layers(&self) -> impl Iterator<Item = (Layer, &LayerSettings)> {
        self.document.layers.iter().map(|(l, s)| (*l, s))
    }

    /// Settings of one layer
    pub fn layer(&self, layer: Layer) -> Result<&LayerSettings> {
        self.document
            .layers
            .get(&layer)
            .ok_or(DeployError::LayerNotConfigured {
                stage: self.stage,
                layer,
            })
    }

    /// Persist the document with `layer` at `version`, then adopt it. A
    /// failed write leaves the in-memory counter at what is on disk.
    fn write_version(&mut self, layer: Layer, version: u64) -> Result<()> {
        let mut document = self.document.clone();
        document
            .layers
            .get_mut(&layer)
            .ok_or(DeployError::LayerNotConfigured {
                stage: self.stage,
                layer,
            })?
            .version = version;
        write_json_atomic(&self.path, &document)?;
        self.document = document;
        Ok(())
    }

    /// Raw progress counter of a layer
    pub fn version(&self, layer: Layer) -> Result<u64> {
        Ok(self.layer(layer)?.version)
    }

    /// Progress counter decoded into (batch, task)
    pub fn progress(&self, layer: Layer) -> Result<Progress> {
        Ok(Progress::from_version(self.version(layer)?))
    }

    /// Overwrite the progress counter and persist
    pub fn set_version(&mut self, layer: Layer, version: u64) -> Result<()> {
        self.write_version(layer, version)?;
        info!("{} {} version set to {}", self.stage, layer, version);
        Ok(())
    }

    /// Add one to the progress counter and persist before returning
    pub fn increase_version(&mut self, layer: Layer) -> Result<u64> {
        let version = self.version(layer)? + 1;
        self.write_version(layer, version)?;
        Ok(version)
    }

    /// External contract addresses of a layer
    pub fn external_contracts(&self, layer: Layer) -> Result<&ExternalContracts> {
        Ok(&self.layer(layer)?.external_contracts)
    }

    /// Chain id of a layer
    pub fn chain_id(&self, layer: Layer) -> Result<u64> {
        Ok(self.layer(layer)?.chain_id)
    }

    /// Network name of a layer
    pub fn network(&self, layer: Layer) -> Result<&str> {
        Ok(&self.layer(layer)?.network)
    }

    /// Whether both layers resolve to the same underlying network
    pub fn layers_share_network(&self) -> bool {
        match (
            self.document.layers.get(&Layer::Layer1),
            self.document.layers.get(&Layer::Layer2),
        ) {
            (Some(l1), Some(l2)) => l1.network == l2.network && l1.chain_id == l2.chain_id,
            _ => false,
        }
    }

    /// Rewrite the whole document to disk
    pub fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_test_stage_bootstraps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(Stage::Test, dir.path()).unwrap();

        assert_eq!(store.chain_id(Layer::Layer1).unwrap(), LOCAL_CHAIN_ID);
        assert_eq!(store.network(Layer::Layer2).unwrap(), LOCAL_NETWORK);
        assert_eq!(store.version(Layer::Layer1).unwrap(), 0);
        assert!(store.layers_share_network());
        // defaults are not written until the first mutation
        assert!(!store.path().exists());
    }

    #[test]
    fn test_missing_production_settings_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            SettingsStore::load(Stage::Production, dir.path()),
            Err(DeployError::SettingsNotFound(_))
        );
    }

    #[test]
    fn test_unknown_stage_name() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            SettingsStore::load_named("mainnet", dir.path()),
            Err(DeployError::UnknownStage(_))
        );
    }

    #[test]
    fn test_version_round_trip_persists_string() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::load(Stage::Test, dir.path()).unwrap();

        store.set_version(Layer::Layer1, 5).unwrap();
        assert_eq!(store.version(Layer::Layer1).unwrap(), 5);

        assert_eq!(store.increase_version(Layer::Layer1).unwrap(), 6);
        assert_eq!(store.version(Layer::Layer1).unwrap(), 6);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["layers"]["layer1"]["version"], "6");
        assert_eq!(raw["layers"]["layer2"]["version"], "0");

        let reloaded = SettingsStore::load(Stage::Test, dir.path()).unwrap();
        assert_eq!(reloaded.version(Layer::Layer1).unwrap(), 6);
    }

    #[test]
    fn test_failed_write_keeps_counter_in_step_with_disk() {
        let dir = tempfile::tempdir().unwrap();
        let settings_dir = dir.path().join("settings");
        let mut store = SettingsStore::load(Stage::Test, &settings_dir).unwrap();
        store.set_version(Layer::Layer1, 5).unwrap();

        // the settings directory turns into a file, so every write fails
        std::fs::remove_dir_all(&settings_dir).unwrap();
        std::fs::write(&settings_dir, "not a directory").unwrap();

        assert!(store.increase_version(Layer::Layer1).is_err());
        assert_eq!(store.version(Layer::Layer1).unwrap(), 5);
        assert!(store.set_version(Layer::Layer1, 1000).is_err());
        assert_eq!(store.version(Layer::Layer1).unwrap(), 5);
    }

    #[test]
    fn test_missing_layer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut document = SettingsDocument::test_defaults();
        document.layers.remove(&Layer::Layer2);
        let mut store = SettingsStore::from_document(
            Stage::Staging,
            SettingsStore::path_for(dir.path(), Stage::Staging),
            document,
        );

        assert_matches!(
            store.increase_version(Layer::Layer2),
            Err(DeployError::LayerNotConfigured { layer: Layer::Layer2, stage: Stage::Staging })
        );
        assert!(!store.layers_share_network());
    }

    #[test]
    fn test_parse_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            SettingsStore::path_for(dir.path(), Stage::Staging),
            r#"{
                "layers": {
                    "layer1": {
                        "chainId": 4,
                        "network": "rinkeby",
                        "externalContracts": {"foundationGovernance": "0xGOV"},
                        "version": "2003"
                    }
                }
            }"#,
        )
        .unwrap();

        let store = SettingsStore::load(Stage::Staging, dir.path()).unwrap();
        assert_eq!(store.chain_id(Layer::Layer1).unwrap(), 4);
        assert_eq!(
            store.progress(Layer::Layer1).unwrap(),
            Progress { batch: 2, task: 3 }
        );
        assert_eq!(
            store
                .external_contracts(Layer::Layer1)
                .unwrap()
                .foundation_governance(),
            Some("0xGOV")
        );
    }

    #[test]
    fn test_non_numeric_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            SettingsStore::path_for(dir.path(), Stage::Staging),
            r#"{"layers":{"layer1":{"chainId":4,"network":"rinkeby","version":"two"}}}"#,
        )
        .unwrap();

        assert_matches!(
            SettingsStore::load(Stage::Staging, dir.path()),
            Err(DeployError::SerializationError(_))
        );
    }
}
