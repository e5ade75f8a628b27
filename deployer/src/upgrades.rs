//! Seams to the external collaborators: the artifact resolver and the
//! upgrade-proxy tool.
//!
//! This crate never compiles or links bytecode and never builds proxies
//! itself. It hands resolved artifacts to an [`UpgradeBackend`] and predicts
//! where that tool keeps its per-network cache file.

use crate::error::{DeployError, Result};
use crate::types::{Address, Deployment, TransactionHash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Contract identified as `<source path>:<contract name>`, or by bare name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContractName {
    source: Option<String>,
    name: String,
}

impl ContractName {
    /// Fully-qualified name
    pub fn qualified(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            name: name.into(),
        }
    }

    /// Contract name without source path; this is what metadata records
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source file, when qualified
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Source file, defaulting to `contracts/<Name>.sol`
    pub fn source_or_default(&self) -> String {
        self.source
            .clone()
            .unwrap_or_else(|| format!("contracts/{}.sol", self.name))
    }
}

impl fmt::Display for ContractName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}:{}", source, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ContractName {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DeployError::ConfigError(format!("Invalid contract name: {:?}", s));
        match s.rsplit_once(':') {
            Some((source, name)) if !source.is_empty() && !name.is_empty() => {
                Ok(Self::qualified(source, name))
            }
            Some(_) => Err(invalid()),
            None if !s.is_empty() => Ok(Self {
                source: None,
                name: s.to_string(),
            }),
            None => Err(invalid()),
        }
    }
}

impl TryFrom<String> for ContractName {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContractName> for String {
    fn from(value: ContractName) -> Self {
        value.to_string()
    }
}

/// A deployable contract as produced by the build pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractFactory {
    /// Contract identity
    pub name: ContractName,
    /// ABI as emitted by the compiler
    pub abi: Value,
    /// Creation bytecode
    pub bytecode: String,
    /// Artifact the factory was read from
    pub artifact_path: PathBuf,
}

/// Resolves a contract name into a deployable factory
pub trait ArtifactResolver: Send + Sync {
    /// Resolve a contract
    fn resolve(&self, name: &ContractName) -> Result<ContractFactory>;

    /// Resolver reading from an alternate artifact root
    fn rooted_at(&self, root: &Path) -> Arc<dyn ArtifactResolver> {
        Arc::new(FsArtifactResolver::new(root))
    }
}

/// Reads hardhat-layout artifacts: `<root>/<source>/<Name>.json`
#[derive(Debug, Clone)]
pub struct FsArtifactResolver {
    root: PathBuf,
}

#[derive(Deserialize)]
struct HardhatArtifact {
    abi: Value,
    bytecode: String,
}

impl FsArtifactResolver {
    /// Create a resolver over `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Artifact location for `name`
    pub fn artifact_path(&self, name: &ContractName) -> PathBuf {
        self.root
            .join(name.source_or_default())
            .join(format!("{}.json", name.name()))
    }
}

impl ArtifactResolver for FsArtifactResolver {
    fn resolve(&self, name: &ContractName) -> Result<ContractFactory> {
        let path = self.artifact_path(name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::ArtifactNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };
        let artifact: HardhatArtifact = serde_json::from_slice(&bytes)?;
        debug!("Resolved {} from {}", name, path.display());

        Ok(ContractFactory {
            name: name.clone(),
            abi: artifact.abi,
            bytecode: artifact.bytecode,
            artifact_path: path,
        })
    }
}

/// Options for proxy deployment and upgrades
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyOptions {
    /// Initializer invoked through the proxy on deployment
    pub initializer: String,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            initializer: "initialize".to_string(),
        }
    }
}

/// The external upgrade-proxy tool.
///
/// Implementations create proxies, register storage layouts, run initializers
/// and manage the proxy admin. `network` selects the target chain per call.
#[async_trait]
pub trait UpgradeBackend: Send + Sync {
    /// Deploy a contract without a proxy
    async fn deploy(
        &self,
        network: &str,
        factory: &ContractFactory,
        args: &[Value],
    ) -> Result<Deployment>;

    /// Deploy implementation plus proxy and call the initializer; returns the proxy
    async fn deploy_proxy(
        &self,
        network: &str,
        factory: &ContractFactory,
        init_args: &[Value],
        options: &ProxyOptions,
    ) -> Result<Deployment>;

    /// Deploy a new implementation for `proxy` without switching it
    async fn prepare_upgrade(
        &self,
        network: &str,
        proxy: &str,
        factory: &ContractFactory,
    ) -> Result<Address>;

    /// Deploy a new implementation and point `proxy` at it
    async fn upgrade_proxy(
        &self,
        network: &str,
        proxy: &str,
        factory: &ContractFactory,
        options: &ProxyOptions,
    ) -> Result<Deployment>;

    /// Send a transaction calling `method` on the contract at `target`
    async fn send(
        &self,
        network: &str,
        target: &str,
        factory: &ContractFactory,
        method: &str,
        args: &[Value],
    ) -> Result<Option<TransactionHash>>;

    /// Hand ownership of the proxy admin to `new_admin`
    async fn transfer_proxy_admin_ownership(
        &self,
        network: &str,
        new_admin: &str,
    ) -> Result<Option<TransactionHash>>;
}

/// Directory, relative to its working directory, where the upgrade tool
/// keeps its network cache files
pub const UPGRADE_CACHE_DIR: &str = ".openzeppelin";

/// File name the upgrade tool uses for its cache of `chain_id`
pub fn upgrade_cache_file_name(chain_id: u64) -> String {
    let network = match chain_id {
        1 => "mainnet".to_string(),
        3 => "ropsten".to_string(),
        4 => "rinkeby".to_string(),
        5 => "goerli".to_string(),
        42 => "kovan".to_string(),
        other => format!("unknown-{}", other),
    };
    format!("{}.json", network)
}
