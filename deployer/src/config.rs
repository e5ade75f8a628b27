//! Deployment configuration: stages, layers and the runtime knobs of the
//! orchestrator (directories, confirmations, retry and polling parameters).

use crate::error::{DeployError, Result};
use crate::upgrades::UPGRADE_CACHE_DIR;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Deployment stage, selecting which settings and metadata documents are active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Production deployment
    Production,
    /// Staging deployment
    Staging,
    /// Local / test deployment
    Test,
}

impl Stage {
    /// All stages
    pub const ALL: [Stage; 3] = [Stage::Production, Stage::Staging, Stage::Test];

    /// Lower-case name used in file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Production => "production",
            Stage::Staging => "staging",
            Stage::Test => "test",
        }
    }

    /// Confirmations awaited per transaction when the config does not override it
    pub fn default_confirmations(&self) -> u64 {
        match self {
            Stage::Production => 5,
            Stage::Staging => 2,
            Stage::Test => 1,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "production" => Ok(Stage::Production),
            "staging" => Ok(Stage::Staging),
            "test" => Ok(Stage::Test),
            other => Err(DeployError::UnknownStage(other.to_string())),
        }
    }
}

/// One of the two networks the system spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Base chain
    Layer1,
    /// Side chain / L2
    Layer2,
}

impl Layer {
    /// Both layers, in canonical order
    pub const ALL: [Layer; 2] = [Layer::Layer1, Layer::Layer2];

    /// Name used in file names and documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Layer1 => "layer1",
            Layer::Layer2 => "layer2",
        }
    }

    /// The opposite layer
    pub fn other(&self) -> Layer {
        match self {
            Layer::Layer1 => Layer::Layer2,
            Layer::Layer2 => Layer::Layer1,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "layer1" => Ok(Layer::Layer1),
            "layer2" => Ok(Layer::Layer2),
            other => Err(DeployError::UnknownLayer(other.to_string())),
        }
    }
}

/// Runtime configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Directory holding `<stage>.json` settings documents
    pub settings_dir: PathBuf,

    /// Directory holding `<stage>.json` system metadata documents
    pub metadata_dir: PathBuf,

    /// The upgrade tool's per-network cache directory. Must be named
    /// `.openzeppelin`; the tool runs from its parent.
    pub cache_dir: PathBuf,

    /// Root of compiled contract artifacts
    pub artifacts_dir: PathBuf,

    /// Node JSON-RPC endpoint used for confirmations and fork resets
    pub rpc_url: String,

    /// Endpoints of specific networks, by network name; others use `rpc_url`
    pub network_rpc_urls: BTreeMap<String, String>,

    /// Confirmations awaited per transaction (stage default when unset)
    pub confirmations: Option<u64>,

    /// Pause after proxy deployments while the upgrade tool settles its cache
    pub post_deploy_delay_ms: u64,

    /// Upper bound for a single task (unbounded when unset)
    pub task_timeout_secs: Option<u64>,

    /// HTTP request timeout (in seconds)
    pub request_timeout_secs: u64,

    /// Maximum number of retries for failed requests
    pub max_retries: usize,

    /// Initial retry delay (in milliseconds)
    pub retry_initial_delay_ms: u64,

    /// Maximum retry delay (in milliseconds)
    pub retry_max_delay_ms: u64,

    /// Retry backoff multiplier
    pub retry_multiplier: f64,

    /// Transaction polling interval (in milliseconds)
    pub tx_poll_interval_ms: u64,

    /// Transaction timeout (in seconds)
    pub tx_timeout_secs: u64,

    /// Upgrade tool command line: program followed by its fixed arguments
    pub upgrade_tool: Vec<String>,
}

impl DeployConfig {
    /// Create a configuration with every directory rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            settings_dir: root.join("publish").join("settings"),
            metadata_dir: root.join("publish").join("metadata"),
            cache_dir: root.join(UPGRADE_CACHE_DIR),
            artifacts_dir: root.join("artifacts"),
            rpc_url: "http://127.0.0.1:8545".to_string(),
            network_rpc_urls: BTreeMap::new(),
            confirmations: None,
            post_deploy_delay_ms: 3000,
            task_timeout_secs: None,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 5000,
            retry_multiplier: 2.0,
            tx_poll_interval_ms: 1000,
            tx_timeout_secs: 600,
            upgrade_tool: vec!["npx".to_string(), "upgrade-bridge".to_string()],
        }
    }

    /// Load configuration from a TOML file; unspecified fields keep defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: DeployConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set node RPC endpoint
    pub fn with_rpc_url(mut self, rpc_url: impl Into<String>) -> Self {
        self.rpc_url = rpc_url.into();
        self
    }

    /// Set the node endpoint of one network
    pub fn with_network_rpc_url(
        mut self,
        network: impl Into<String>,
        rpc_url: impl Into<String>,
    ) -> Self {
        self.network_rpc_urls.insert(network.into(), rpc_url.into());
        self
    }

    /// Override confirmations for every stage
    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = Some(confirmations);
        self
    }

    /// Set post-deploy delay
    pub fn with_post_deploy_delay(mut self, delay: Duration) -> Self {
        self.post_deploy_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Bound every task by a timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Set maximum retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set retry delays
    pub fn with_retry_config(
        mut self,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    ) -> Self {
        self.retry_initial_delay_ms = initial_delay_ms;
        self.retry_max_delay_ms = max_delay_ms;
        self.retry_multiplier = multiplier;
        self
    }

    /// Set transaction polling configuration
    pub fn with_tx_config(mut self, poll_interval_ms: u64, timeout_secs: u64) -> Self {
        self.tx_poll_interval_ms = poll_interval_ms;
        self.tx_timeout_secs = timeout_secs;
        self
    }

    /// Set the upgrade tool command line
    pub fn with_upgrade_tool<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upgrade_tool = command.into_iter().map(Into::into).collect();
        self
    }

    /// Confirmations to await for transactions of `stage`
    pub fn confirmations_for(&self, stage: Stage) -> u64 {
        self.confirmations
            .unwrap_or_else(|| stage.default_confirmations())
    }

    /// Node endpoint serving `network`
    pub fn rpc_url_for(&self, network: &str) -> &str {
        self.network_rpc_urls
            .get(network)
            .map(String::as_str)
            .unwrap_or(&self.rpc_url)
    }

    /// Directory the upgrade tool is run from, so that its cache lands in
    /// `cache_dir`
    pub fn tool_working_dir(&self) -> &Path {
        match self.cache_dir.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Post-deploy delay as a duration
    pub fn post_deploy_delay(&self) -> Duration {
        Duration::from_millis(self.post_deploy_delay_ms)
    }

    /// Task timeout as a duration
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// HTTP request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.rpc_url)?;
        for url in self.network_rpc_urls.values() {
            url::Url::parse(url)?;
        }
        if self.cache_dir.file_name() != Some(OsStr::new(UPGRADE_CACHE_DIR)) {
            return Err(DeployError::ConfigError(format!(
                "Cache directory {} must be named {}",
                self.cache_dir.display(),
                UPGRADE_CACHE_DIR
            )));
        }
        if self.max_retries == 0 {
            return Err(DeployError::ConfigError(
                "Max retries must be greater than 0".to_string(),
            ));
        }
        if self.retry_initial_delay_ms == 0 {
            return Err(DeployError::ConfigError(
                "Retry initial delay must be greater than 0".to_string(),
            ));
        }
        if self.retry_multiplier <= 1.0 {
            return Err(DeployError::ConfigError(
                "Retry multiplier must be greater than 1.0".to_string(),
            ));
        }
        if self.tx_poll_interval_ms == 0 {
            return Err(DeployError::ConfigError(
                "Transaction poll interval must be greater than 0".to_string(),
            ));
        }
        if self.tx_timeout_secs == 0 {
            return Err(DeployError::ConfigError(
                "Transaction timeout must be greater than 0".to_string(),
            ));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(DeployError::ConfigError(
                "Task timeout must be greater than 0".to_string(),
            ));
        }
        if self.upgrade_tool.is_empty() {
            return Err(DeployError::ConfigError(
                "Upgrade tool command cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_stage_parsing() {
        assert_eq!("production".parse::<Stage>().unwrap(), Stage::Production);
        assert_eq!("staging".parse::<Stage>().unwrap(), Stage::Staging);
        assert_eq!("test".parse::<Stage>().unwrap(), Stage::Test);
        assert_matches!("prod".parse::<Stage>(), Err(DeployError::UnknownStage(s)) if s == "prod");
    }

    #[test]
    fn test_layer_parsing_and_display() {
        assert_eq!("layer1".parse::<Layer>().unwrap(), Layer::Layer1);
        assert_eq!(Layer::Layer2.to_string(), "layer2");
        assert_eq!(Layer::Layer1.other(), Layer::Layer2);
        assert_matches!("layer3".parse::<Layer>(), Err(DeployError::UnknownLayer(_)));
    }

    #[test]
    fn test_layer_serde_names() {
        let json = serde_json::to_string(&Layer::Layer1).unwrap();
        assert_eq!(json, "\"layer1\"");
    }

    #[test]
    fn test_confirmations_default_per_stage() {
        let config = DeployConfig::default();
        assert_eq!(config.confirmations_for(Stage::Production), 5);
        assert_eq!(config.confirmations_for(Stage::Test), 1);

        let config = config.with_confirmations(3);
        assert_eq!(config.confirmations_for(Stage::Production), 3);
    }

    #[test]
    fn test_config_builder() {
        let config = DeployConfig::new("/tmp/deploy")
            .with_rpc_url("http://localhost:9545")
            .with_max_retries(5)
            .with_retry_config(200, 10000, 2.5)
            .with_tx_config(2000, 120)
            .with_task_timeout(Duration::from_secs(90))
            .with_upgrade_tool(["node", "bridge.js"]);

        assert_eq!(config.settings_dir, PathBuf::from("/tmp/deploy/publish/settings"));
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/deploy/.openzeppelin"));
        assert_eq!(config.rpc_url, "http://localhost:9545");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_multiplier, 2.5);
        assert_eq!(config.tx_timeout_secs, 120);
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.upgrade_tool, vec!["node", "bridge.js"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DeployConfig::default();
        assert!(config.validate().is_ok());

        config.max_retries = 0;
        assert!(config.validate().is_err());

        config.max_retries = 3;
        config.retry_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.retry_multiplier = 2.0;
        config.rpc_url = "not a url".to_string();
        assert_matches!(config.validate(), Err(DeployError::UrlParseError(_)));

        config.rpc_url = "http://127.0.0.1:8545".to_string();
        config.cache_dir = PathBuf::from("/var/cache/upgrades");
        assert_matches!(config.validate(), Err(DeployError::ConfigError(msg)) if msg.contains(".openzeppelin"));
    }

    #[test]
    fn test_rpc_url_per_network() {
        let config = DeployConfig::default()
            .with_rpc_url("http://127.0.0.1:8545")
            .with_network_rpc_url("xdai", "https://xdai.example/rpc");

        assert_eq!(config.rpc_url_for("xdai"), "https://xdai.example/rpc");
        assert_eq!(config.rpc_url_for("rinkeby"), "http://127.0.0.1:8545");
        assert!(config.validate().is_ok());

        let config = config.with_network_rpc_url("rinkeby", "rinkeby node");
        assert_matches!(config.validate(), Err(DeployError::UrlParseError(_)));
    }

    #[test]
    fn test_tool_runs_next_to_cache_dir() {
        assert_eq!(
            DeployConfig::new("/srv/dex").tool_working_dir(),
            Path::new("/srv/dex")
        );
        assert_eq!(DeployConfig::default().tool_working_dir(), Path::new("."));

        let mut config = DeployConfig::default();
        config.cache_dir = PathBuf::from(".openzeppelin");
        assert_eq!(config.tool_working_dir(), Path::new("."));
    }

    #[test]
    fn test_config_from_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(
            &path,
            r#"
rpc_url = "http://10.0.0.2:8545"
confirmations = 7
upgrade_tool = ["node", "tool.js"]

[network_rpc_urls]
xdai = "https://xdai.example/rpc"
"#,
        )
        .unwrap();

        let config = DeployConfig::from_file(&path).unwrap();
        assert_eq!(config.rpc_url, "http://10.0.0.2:8545");
        assert_eq!(config.confirmations_for(Stage::Test), 7);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.upgrade_tool, vec!["node", "tool.js"]);
        assert_eq!(config.rpc_url_for("xdai"), "https://xdai.example/rpc");
    }
}
