//! Shared fixtures for the integration tests: an in-memory upgrade tool, an
//! artifact resolver that needs no build output, and a workspace in a temp
//! directory.

#![allow(dead_code)]

use async_trait::async_trait;
use dex_deployer::settings::SettingsDocument;
use dex_deployer::{
    Address, ArtifactResolver, ContractName, DeployConfig, DeployError, DeployServices,
    Deployment, Layer, MarketTable, MigrationContext, MigrationExecutor, MigrationTasks,
    NoConfirmations, ProxyOptions, Result, SettingsStore, Stage, SystemMetadataStore, Task,
    TransactionHash, UpgradeBackend,
};
use dex_deployer::upgrades::ContractFactory;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// One call received by [`RecordingBackend`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub op: &'static str,
    pub network: String,
    pub contract: Option<String>,
    pub target: Option<String>,
    pub method: Option<String>,
    pub args: Vec<Value>,
}

impl RecordedCall {
    fn new(op: &'static str, network: &str) -> Self {
        Self {
            op,
            network: network.to_string(),
            contract: None,
            target: None,
            method: None,
            args: Vec::new(),
        }
    }

    /// Short form used in assertions, e.g. `deployProxy ClearingHouse`
    pub fn label(&self) -> String {
        let contract = self.contract.as_deref().unwrap_or_default();
        match self.op {
            "send" => format!(
                "send {}.{}",
                contract,
                self.method.as_deref().unwrap_or_default()
            ),
            "transferProxyAdminOwnership" => {
                format!("{} {}", self.op, self.target.as_deref().unwrap_or_default())
            }
            op => format!("{} {}", op, contract),
        }
    }
}

/// Upgrade tool stand-in: hands out sequential addresses and records calls
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next call whose label is `label`
    pub fn fail_once_on(&self, label: &str) {
        self.failures.lock().unwrap().push(label.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::label).collect()
    }

    pub fn calls_to(&self, op: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    fn record(&self, call: RecordedCall) -> Result<u64> {
        let label = call.label();
        self.calls.lock().unwrap().push(call);

        let mut failures = self.failures.lock().unwrap();
        if let Some(index) = failures.iter().position(|f| *f == label) {
            failures.remove(index);
            return Err(DeployError::UpgradeTool {
                operation: label,
                message: "injected failure".to_string(),
            });
        }
        Ok(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

pub fn address(n: u64) -> Address {
    format!("0x{:040x}", n)
}

fn tx_hash(n: u64) -> TransactionHash {
    format!("0x{:064x}", n)
}

#[async_trait]
impl UpgradeBackend for RecordingBackend {
    async fn deploy(
        &self,
        network: &str,
        factory: &ContractFactory,
        args: &[Value],
    ) -> Result<Deployment> {
        let n = self.record(RecordedCall {
            contract: Some(factory.name.name().to_string()),
            args: args.to_vec(),
            ..RecordedCall::new("deploy", network)
        })?;
        Ok(Deployment::at(address(n)).with_tx_hash(tx_hash(n)))
    }

    async fn deploy_proxy(
        &self,
        network: &str,
        factory: &ContractFactory,
        init_args: &[Value],
        options: &ProxyOptions,
    ) -> Result<Deployment> {
        let n = self.record(RecordedCall {
            contract: Some(factory.name.name().to_string()),
            method: Some(options.initializer.clone()),
            args: init_args.to_vec(),
            ..RecordedCall::new("deployProxy", network)
        })?;
        Ok(Deployment::at(address(n)).with_tx_hash(tx_hash(n)))
    }

    async fn prepare_upgrade(
        &self,
        network: &str,
        proxy: &str,
        factory: &ContractFactory,
    ) -> Result<Address> {
        let n = self.record(RecordedCall {
            contract: Some(factory.name.name().to_string()),
            target: Some(proxy.to_string()),
            ..RecordedCall::new("prepareUpgrade", network)
        })?;
        Ok(address(n))
    }

    async fn upgrade_proxy(
        &self,
        network: &str,
        proxy: &str,
        factory: &ContractFactory,
        _options: &ProxyOptions,
    ) -> Result<Deployment> {
        let n = self.record(RecordedCall {
            contract: Some(factory.name.name().to_string()),
            target: Some(proxy.to_string()),
            ..RecordedCall::new("upgradeProxy", network)
        })?;
        Ok(Deployment::at(proxy).with_tx_hash(tx_hash(n)))
    }

    async fn send(
        &self,
        network: &str,
        target: &str,
        factory: &ContractFactory,
        method: &str,
        args: &[Value],
    ) -> Result<Option<TransactionHash>> {
        let n = self.record(RecordedCall {
            contract: Some(factory.name.name().to_string()),
            target: Some(target.to_string()),
            method: Some(method.to_string()),
            args: args.to_vec(),
            ..RecordedCall::new("send", network)
        })?;
        Ok(Some(tx_hash(n)))
    }

    async fn transfer_proxy_admin_ownership(
        &self,
        network: &str,
        new_admin: &str,
    ) -> Result<Option<TransactionHash>> {
        let n = self.record(RecordedCall {
            target: Some(new_admin.to_string()),
            ..RecordedCall::new("transferProxyAdminOwnership", network)
        })?;
        Ok(Some(tx_hash(n)))
    }
}

/// Resolves every contract to an empty artifact
#[derive(Debug, Clone, Default)]
pub struct StubResolver;

impl ArtifactResolver for StubResolver {
    fn resolve(&self, name: &ContractName) -> Result<ContractFactory> {
        Ok(ContractFactory {
            name: name.clone(),
            abi: json!([]),
            bytecode: "0x".to_string(),
            artifact_path: PathBuf::from(format!("artifacts/{}.json", name.name())),
        })
    }

    fn rooted_at(&self, _root: &Path) -> Arc<dyn ArtifactResolver> {
        Arc::new(self.clone())
    }
}

/// Migration content built from a closure
pub struct FnTasks<F>(pub F);

impl<F> MigrationTasks for FnTasks<F>
where
    F: Fn(&MigrationContext) -> Result<Vec<Task>> + Send + Sync,
{
    fn tasks(&self, context: &MigrationContext) -> Result<Vec<Task>> {
        (self.0)(context)
    }
}

/// `count` tasks that append their index to `log`; the task at `fail_at`
/// fails instead
pub fn counting_tasks(
    count: usize,
    log: Arc<Mutex<Vec<usize>>>,
    fail_at: Option<usize>,
) -> impl MigrationTasks {
    FnTasks(move |_: &MigrationContext| {
        Ok((0..count)
            .map(|index| {
                let log = log.clone();
                Task::new(format!("task {}", index), move || async move {
                    if fail_at == Some(index) {
                        return Err(DeployError::UpgradeTool {
                            operation: format!("task {}", index),
                            message: "boom".to_string(),
                        });
                    }
                    log.lock().unwrap().push(index);
                    Ok(())
                })
            })
            .collect())
    })
}

/// Temp directory holding settings, metadata and cache of every stage
pub struct Workspace {
    pub dir: TempDir,
    pub config: DeployConfig,
    pub backend: Arc<RecordingBackend>,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = DeployConfig::new(dir.path()).with_post_deploy_delay(Duration::ZERO);
        Self {
            dir,
            config,
            backend: RecordingBackend::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn services(&self) -> DeployServices {
        DeployServices::new(
            self.backend.clone(),
            Arc::new(StubResolver),
            Arc::new(NoConfirmations),
        )
    }

    pub fn executor(&self) -> MigrationExecutor {
        MigrationExecutor::new(
            self.config.clone(),
            self.services(),
            Arc::new(MarketTable::builtin()),
        )
    }

    pub fn write_settings(&self, stage: Stage, document: SettingsDocument) {
        SettingsStore::from_document(
            stage,
            SettingsStore::path_for(&self.config.settings_dir, stage),
            document,
        )
        .persist()
        .unwrap();
    }

    /// Test-stage defaults plus a usdc address on both layers
    pub fn write_test_settings(&self) -> SettingsDocument {
        let mut document = SettingsDocument::test_defaults();
        for settings in document.layers.values_mut() {
            settings.external_contracts = settings.external_contracts.clone().with("usdc", "0xUSDC");
        }
        self.write_settings(Stage::Test, document.clone());
        document
    }

    pub fn settings(&self, stage: Stage) -> SettingsStore {
        SettingsStore::load(stage, &self.config.settings_dir).unwrap()
    }

    pub fn version(&self, stage: Stage, layer: Layer) -> u64 {
        self.settings(stage).version(layer).unwrap()
    }

    pub fn set_version(&self, stage: Stage, layer: Layer, version: u64) {
        self.settings(stage).set_version(layer, version).unwrap();
    }

    pub fn metadata(&self, stage: Stage) -> SystemMetadataStore {
        SystemMetadataStore::load(&self.config.metadata_dir, &self.settings(stage)).unwrap()
    }

    pub fn address_of(&self, stage: Stage, layer: Layer, alias: &str) -> Option<Address> {
        self.metadata(stage)
            .contract_metadata(layer, alias)
            .map(|recorded| recorded.address.clone())
    }

    /// Write `content` to `name` inside the workspace
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }
}
