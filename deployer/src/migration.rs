//! Migrations: one batch of tasks for one layer.
//!
//! A migration's identity (batch index and layer) comes from its file name,
//! `NNNN-<layer>-<description>`, and nowhere else. It is parsed once into a
//! [`MigrationId`] and passed around by value.

use crate::config::{Layer, Stage};
use crate::contract::{ContractWrapperFactory, DeployConstants};
use crate::error::{DeployError, Result};
use crate::metadata::SharedMetadata;
use crate::plan::MigrationPlan;
use crate::settings::SharedSettings;
use crate::types::{Address, ExternalContracts};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

/// Batch index and layer of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MigrationId {
    /// Batch index within the layer
    pub batch: u64,
    /// Target layer
    pub layer: Layer,
}

impl MigrationId {
    pub fn new(batch: u64, layer: Layer) -> Self {
        Self { batch, layer }
    }

    /// Parse a migration file name (an extension is ignored)
    pub fn parse(file_name: &str) -> Result<Self> {
        let invalid = |reason: &str| DeployError::InvalidMigrationName {
            name: file_name.to_string(),
            reason: reason.to_string(),
        };

        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| invalid("empty file name"))?;

        let mut parts = stem.splitn(3, '-');
        let batch = parts.next().unwrap_or_default();
        let layer = parts.next().ok_or_else(|| invalid("missing layer segment"))?;
        if parts.next().is_none() {
            return Err(invalid("missing description segment"));
        }

        if batch.len() != 4 || !batch.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("batch index must be four decimal digits"));
        }
        let batch = batch
            .parse::<u64>()
            .map_err(|e| invalid(&format!("invalid batch index: {}", e)))?;
        let layer = layer
            .parse::<Layer>()
            .map_err(|_| invalid(&format!("unknown layer {:?}", layer)))?;

        Ok(Self { batch, layer })
    }

    /// Parse the file name of `path`
    pub fn from_path(path: &Path) -> Result<Self> {
        let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
            DeployError::InvalidMigrationName {
                name: path.display().to_string(),
                reason: "path has no file name".to_string(),
            }
        })?;
        Self::parse(file_name)
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{}", self.batch, self.layer)
    }
}

/// Future returned by a task
pub type TaskFuture = BoxFuture<'static, Result<()>>;

/// One idempotent step of a migration
pub struct Task {
    description: String,
    action: Box<dyn FnOnce() -> TaskFuture + Send>,
}

impl Task {
    /// Create a task; `description` is logged before it runs
    pub fn new<F, Fut>(description: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            description: description.into(),
            action: Box::new(move || action().boxed()),
        }
    }

    /// What the task does
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run the task to completion
    pub fn run(self) -> TaskFuture {
        (self.action)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Everything a migration's tasks may use
#[derive(Clone)]
pub struct MigrationContext {
    /// Active stage
    pub stage: Stage,
    /// Target layer
    pub layer: Layer,
    /// Settings store
    pub settings: SharedSettings,
    /// Metadata store
    pub metadata: SharedMetadata,
    /// External contracts of the target layer
    pub external_contracts: ExternalContracts,
    /// Run constants
    pub constants: DeployConstants,
    /// Wrapper factory bound to the target layer
    pub factory: ContractWrapperFactory,
}

impl MigrationContext {
    /// Network of the target layer
    pub fn network(&self) -> &str {
        self.factory.network()
    }

    /// External contract of the target layer
    pub fn external(&self, key: &str) -> Result<Address> {
        self.external_contracts
            .require(self.layer, key)
            .map(str::to_string)
    }

    /// External contract of any layer, as currently configured
    pub async fn external_on(&self, layer: Layer, key: &str) -> Result<Address> {
        if layer == self.layer {
            return self.external(key);
        }
        let settings = self.settings.read().await;
        settings
            .external_contracts(layer)?
            .require(layer, key)
            .map(str::to_string)
    }

    /// Address recorded under `alias` on `layer`
    pub async fn address_on(&self, layer: Layer, alias: &str) -> Result<Address> {
        let metadata = self.metadata.read().await;
        metadata
            .contract_metadata(layer, alias)
            .map(|recorded| recorded.address.clone())
            .ok_or_else(|| DeployError::ContractNotDeployed {
                layer,
                alias: alias.to_string(),
            })
    }
}

/// Content of a migration: its ordered task list
pub trait MigrationTasks: Send + Sync {
    /// Build the tasks; called once per execution and may branch on the stage
    fn tasks(&self, context: &MigrationContext) -> Result<Vec<Task>>;

    /// Artifact root overriding the configured one, e.g. flattened sources
    fn artifacts_root(&self) -> Option<&Path> {
        None
    }
}

/// A migration file: identity plus content
pub struct Migration {
    id: MigrationId,
    path: PathBuf,
    source: Box<dyn MigrationTasks>,
}

impl Migration {
    /// Bind `source` to the identity encoded in `path`
    pub fn new(path: impl Into<PathBuf>, source: impl MigrationTasks + 'static) -> Result<Self> {
        let path = path.into();
        let id = MigrationId::from_path(&path)?;
        Ok(Self {
            id,
            path,
            source: Box::new(source),
        })
    }

    /// Migration with an identity that does not come from a file name
    pub fn with_id(
        id: MigrationId,
        path: impl Into<PathBuf>,
        source: impl MigrationTasks + 'static,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Load a declarative migration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // name first: a malformed name fails without reading the file
        MigrationId::from_path(path)?;
        let plan = MigrationPlan::from_file(path)?;
        Self::new(path, plan)
    }

    /// Identity
    pub fn id(&self) -> MigrationId {
        self.id
    }

    /// Batch index
    pub fn batch(&self) -> u64 {
        self.id.batch
    }

    /// Target layer
    pub fn layer(&self) -> Layer {
        self.id.layer
    }

    /// File the migration was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Artifact root override
    pub fn artifacts_root(&self) -> Option<&Path> {
        self.source.artifacts_root()
    }

    /// Build the task list
    pub fn tasks(&self, context: &MigrationContext) -> Result<Vec<Task>> {
        self.source.tasks(context)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
