//! Declarative migration files.
//!
//! A migration file is a TOML list of `[[task]]` tables:
//!
//! ```toml
//! artifacts_root = "flattened"
//!
//! [[task]]
//! kind = "deploy_upgradable"
//! contract = "contracts/ClearingHouse.sol:ClearingHouse"
//! args = ["@InsuranceFund", "$usdc", "@layer1:RootBridge"]
//!
//! [[task]]
//! kind = "deploy_amm"
//! market = "ETHUSDC"
//! price_feed = "@L2PriceFeed"
//! quote_asset = "$usdc"
//! stages = ["production"]
//! ```
//!
//! String arguments starting with `@` name a recorded contract (optionally
//! `@<layer>:<alias>`), those starting with `$` an external contract
//! (`$<layer>:<key>`). `@@` and `$$` escape a literal leading character.
//! Placeholders are resolved when the task runs, so a task can reference a
//! contract deployed by an earlier task of the same batch.

use crate::config::{Layer, Stage};
use crate::error::{DeployError, Result};
use crate::metadata::SystemMetadataStore;
use crate::migration::{MigrationContext, MigrationTasks, Task};
use crate::settings::SettingsStore;
use crate::upgrades::{ContractName, ProxyOptions};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

/// What a task does
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    /// Deploy without a proxy
    Deploy {
        contract: ContractName,
        #[serde(default)]
        alias: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Deploy behind a proxy and initialize
    DeployUpgradable {
        contract: ContractName,
        #[serde(default)]
        alias: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        initializer: Option<String>,
    },
    /// Stage a new implementation, leaving the proxy alone
    PrepareUpgrade {
        contract: ContractName,
        #[serde(default)]
        alias: Option<String>,
    },
    /// Stage a new implementation and switch the proxy
    Upgrade {
        contract: ContractName,
        #[serde(default)]
        alias: Option<String>,
    },
    /// Deploy the AMM of a market
    DeployAmm {
        market: String,
        price_feed: String,
        quote_asset: String,
    },
    /// Send a transaction to a recorded contract
    Call {
        contract: ContractName,
        #[serde(default)]
        alias: Option<String>,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl TaskAction {
    /// Default log line for the task
    pub fn describe(&self) -> String {
        match self {
            TaskAction::Deploy { contract, alias, .. } => {
                format!("deploy {}", label(contract, alias))
            }
            TaskAction::DeployUpgradable { contract, alias, .. } => {
                format!("deploy upgradable {}", label(contract, alias))
            }
            TaskAction::PrepareUpgrade { contract, alias } => {
                format!("prepare upgrade of {}", label(contract, alias))
            }
            TaskAction::Upgrade { contract, alias } => {
                format!("upgrade {}", label(contract, alias))
            }
            TaskAction::DeployAmm { market, .. } => format!("deploy amm {}", market),
            TaskAction::Call {
                contract,
                alias,
                method,
                ..
            } => format!("call {}.{}", label(contract, alias), method),
        }
    }

    /// Carry out the action
    pub async fn apply(&self, context: &MigrationContext) -> Result<()> {
        let factory = &context.factory;
        match self {
            TaskAction::Deploy {
                contract,
                alias,
                args,
            } => {
                let args = resolve_args(context, args).await?;
                factory
                    .create(contract.clone(), alias_of(contract, alias))
                    .deploy_immutable(&args)
                    .await?;
            }
            TaskAction::DeployUpgradable {
                contract,
                alias,
                args,
                initializer,
            } => {
                let args = resolve_args(context, args).await?;
                let mut options = ProxyOptions::default();
                if let Some(initializer) = initializer {
                    options.initializer = initializer.clone();
                }
                factory
                    .create(contract.clone(), alias_of(contract, alias))
                    .deploy_upgradable(&args, &options)
                    .await?;
            }
            TaskAction::PrepareUpgrade { contract, alias } => {
                let implementation = factory
                    .create(contract.clone(), alias_of(contract, alias))
                    .prepare_upgrade()
                    .await?;
                info!(
                    "Upgrade of {} staged at {}; switch it through governance",
                    alias_of(contract, alias),
                    implementation
                );
            }
            TaskAction::Upgrade { contract, alias } => {
                factory
                    .create(contract.clone(), alias_of(contract, alias))
                    .upgrade(&ProxyOptions::default())
                    .await?;
            }
            TaskAction::DeployAmm {
                market,
                price_feed,
                quote_asset,
            } => {
                let resolved = resolve_args(
                    context,
                    &[
                        Value::String(price_feed.clone()),
                        Value::String(quote_asset.clone()),
                    ],
                )
                .await?;
                let price_feed = expect_address(&resolved[0], "price_feed")?;
                let quote_asset = expect_address(&resolved[1], "quote_asset")?;
                factory.amm(market)?.deploy(price_feed, quote_asset).await?;
            }
            TaskAction::Call {
                contract,
                alias,
                method,
                args,
            } => {
                let args = resolve_args(context, args).await?;
                factory
                    .create(contract.clone(), alias_of(contract, alias))
                    .send(method, &args)
                    .await?;
            }
        }
        Ok(())
    }
}

fn alias_of(contract: &ContractName, alias: &Option<String>) -> String {
    alias.clone().unwrap_or_else(|| contract.name().to_string())
}

fn label(contract: &ContractName, alias: &Option<String>) -> String {
    match alias {
        Some(alias) if alias != contract.name() => format!("{} as {}", contract.name(), alias),
        _ => contract.name().to_string(),
    }
}

fn expect_address<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| DeployError::ConfigError(format!("{} must be a string", field)))
}

/// One entry of a task list
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskEntry {
    /// Log line; derived from the action when absent
    #[serde(default)]
    pub description: Option<String>,
    /// Stages the task runs on; all stages when absent
    #[serde(default)]
    pub stages: Option<Vec<Stage>>,
    /// The action itself
    #[serde(flatten)]
    pub action: TaskAction,
}

impl TaskEntry {
    /// Whether the task runs on `stage`
    pub fn applies_to(&self, stage: Stage) -> bool {
        self.stages
            .as_ref()
            .map_or(true, |stages| stages.contains(&stage))
    }

    fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| self.action.describe())
    }
}

/// Build runnable tasks for the entries that apply to the context's stage
pub fn build_tasks(entries: &[TaskEntry], context: &MigrationContext) -> Vec<Task> {
    entries
        .iter()
        .filter(|entry| entry.applies_to(context.stage))
        .map(|entry| {
            let action = entry.action.clone();
            let context = context.clone();
            Task::new(entry.description(), move || async move {
                action.apply(&context).await
            })
        })
        .collect()
}

/// A declarative migration: one batch of tasks
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MigrationPlan {
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Artifact root for this batch, relative to the plan file
    #[serde(default)]
    pub artifacts_root: Option<PathBuf>,
    /// Ordered task list
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,
}

impl MigrationPlan {
    /// Parse a plan file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut plan: MigrationPlan = toml::from_str(&content)?;
        plan.anchor(base_dir(path));
        Ok(plan)
    }

    fn anchor(&mut self, base: &Path) {
        if let Some(root) = self.artifacts_root.take() {
            self.artifacts_root = Some(base.join(root));
        }
    }
}

impl MigrationTasks for MigrationPlan {
    fn tasks(&self, context: &MigrationContext) -> Result<Vec<Task>> {
        Ok(build_tasks(&self.tasks, context))
    }

    fn artifacts_root(&self) -> Option<&Path> {
        self.artifacts_root.as_deref()
    }
}

/// The legacy publish plan: every batch of both layers in one file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PublishPlan {
    /// Layer performing the governance handoff when both share a network
    #[serde(default)]
    pub final_layer: Option<Layer>,
    /// Batches of layer1, in order
    #[serde(default)]
    pub layer1: Vec<MigrationPlan>,
    /// Batches of layer2, in order
    #[serde(default)]
    pub layer2: Vec<MigrationPlan>,
}

impl PublishPlan {
    /// Parse a publish plan file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut plan: PublishPlan = toml::from_str(&content)?;
        let base = base_dir(path);
        for batch in plan.layer1.iter_mut().chain(plan.layer2.iter_mut()) {
            batch.anchor(base);
        }
        Ok(plan)
    }

    /// Batches of `layer`
    pub fn batches(&self, layer: Layer) -> &[MigrationPlan] {
        match layer {
            Layer::Layer1 => &self.layer1,
            Layer::Layer2 => &self.layer2,
        }
    }
}

fn base_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// Resolve placeholders in task arguments against current metadata and settings
pub async fn resolve_args(context: &MigrationContext, args: &[Value]) -> Result<Vec<Value>> {
    let metadata = context.metadata.read().await;
    let settings = context.settings.read().await;
    let placeholders = Placeholders {
        layer: context.layer,
        metadata: &metadata,
        settings: &settings,
    };
    args.iter().map(|arg| placeholders.resolve(arg)).collect()
}

struct Placeholders<'a> {
    layer: Layer,
    metadata: &'a SystemMetadataStore,
    settings: &'a SettingsStore,
}

impl Placeholders<'_> {
    fn resolve(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.resolve_str(s).map(Value::String),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, s: &str) -> Result<String> {
        if s.starts_with("@@") || s.starts_with("$$") {
            return Ok(s[1..].to_string());
        }
        if let Some(body) = s.strip_prefix('@') {
            let (layer, alias) = self.scoped(body)?;
            return self
                .metadata
                .contract_metadata(layer, alias)
                .map(|recorded| recorded.address.clone())
                .ok_or_else(|| DeployError::ContractNotDeployed {
                    layer,
                    alias: alias.to_string(),
                });
        }
        if let Some(body) = s.strip_prefix('$') {
            let (layer, key) = self.scoped(body)?;
            return self
                .settings
                .external_contracts(layer)?
                .require(layer, key)
                .map(str::to_string);
        }
        Ok(s.to_string())
    }

    fn scoped<'s>(&self, body: &'s str) -> Result<(Layer, &'s str)> {
        match body.split_once(':') {
            Some((layer, name)) => Ok((layer.parse()?, name)),
            None => Ok((self.layer, body)),
        }
    }
}
