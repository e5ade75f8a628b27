//! Upgrade backend that drives the external upgrade-proxy tool as a
//! subprocess.
//!
//! Each operation spawns the configured command, writes one JSON request to
//! its stdin and reads one JSON response from the last non-empty line of its
//! stdout. Anything the tool prints before that line is treated as log
//! output. A non-zero exit status fails the operation with the tool's stderr.

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::types::{Address, Deployment, TransactionHash};
use crate::upgrades::{ContractFactory, ProxyOptions, UpgradeBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Runs the upgrade tool once per operation
#[derive(Debug, Clone)]
pub struct CommandUpgradeBackend {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolRequest<'a> {
    op: &'static str,
    network: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    contract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "<[Value]>::is_empty")]
    args: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    initializer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_admin: Option<&'a str>,
}

impl<'a> ToolRequest<'a> {
    fn new(op: &'static str, network: &'a str) -> Self {
        Self {
            op,
            network,
            contract: None,
            artifact: None,
            proxy: None,
            target: None,
            method: None,
            args: &[],
            initializer: None,
            new_admin: None,
        }
    }

    fn factory(mut self, factory: &'a ContractFactory) -> Self {
        self.contract = Some(factory.name.to_string());
        self.artifact = Some(absolute(&factory.artifact_path));
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse {
    #[serde(default)]
    address: Option<Address>,
    #[serde(default)]
    tx_hash: Option<TransactionHash>,
    #[serde(default)]
    error: Option<String>,
}

impl CommandUpgradeBackend {
    /// Backend running `program` with fixed `args`
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    /// Backend for the command line configured in `config`.
    ///
    /// The tool runs from the parent of `config.cache_dir`, which is where it
    /// looks for its cache directory. Relative paths in the command line are
    /// resolved from there too.
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        let (program, args) = config.upgrade_tool.split_first().ok_or_else(|| {
            DeployError::ConfigError("Upgrade tool command cannot be empty".to_string())
        })?;
        Ok(Self::new(program.clone(), args.iter().cloned())
            .with_working_dir(absolute(config.tool_working_dir())))
    }

    /// Run the tool from `dir`
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn invoke(&self, request: &ToolRequest<'_>) -> Result<ToolResponse> {
        let operation = request.op;
        let tool_error = |message: String| DeployError::UpgradeTool {
            operation: operation.to_string(),
            message,
        };

        let payload = serde_json::to_vec(request)?;
        debug!("Upgrade tool request: {}", String::from_utf8_lossy(&payload));

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| tool_error(format!("failed to spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            return Err(tool_error(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| DeployError::InvalidResponse(format!("{}: empty output", operation)))?;
        let response: ToolResponse = serde_json::from_str(line)
            .map_err(|e| DeployError::InvalidResponse(format!("{}: {}: {}", operation, e, line)))?;

        match response.error {
            Some(error) => Err(tool_error(error)),
            None => Ok(response),
        }
    }

    fn deployment(operation: &str, response: ToolResponse) -> Result<Deployment> {
        let address = response.address.ok_or_else(|| {
            DeployError::InvalidResponse(format!("{}: response has no address", operation))
        })?;
        Ok(Deployment {
            address,
            tx_hash: response.tx_hash,
        })
    }
}

#[async_trait]
impl UpgradeBackend for CommandUpgradeBackend {
    async fn deploy(
        &self,
        network: &str,
        factory: &ContractFactory,
        args: &[Value],
    ) -> Result<Deployment> {
        let request = ToolRequest {
            args,
            ..ToolRequest::new("deploy", network).factory(factory)
        };
        Self::deployment("deploy", self.invoke(&request).await?)
    }

    async fn deploy_proxy(
        &self,
        network: &str,
        factory: &ContractFactory,
        init_args: &[Value],
        options: &ProxyOptions,
    ) -> Result<Deployment> {
        let request = ToolRequest {
            args: init_args,
            initializer: Some(&options.initializer),
            ..ToolRequest::new("deployProxy", network).factory(factory)
        };
        Self::deployment("deployProxy", self.invoke(&request).await?)
    }

    async fn prepare_upgrade(
        &self,
        network: &str,
        proxy: &str,
        factory: &ContractFactory,
    ) -> Result<Address> {
        let request = ToolRequest {
            proxy: Some(proxy),
            ..ToolRequest::new("prepareUpgrade", network).factory(factory)
        };
        Ok(Self::deployment("prepareUpgrade", self.invoke(&request).await?)?.address)
    }

    async fn upgrade_proxy(
        &self,
        network: &str,
        proxy: &str,
        factory: &ContractFactory,
        options: &ProxyOptions,
    ) -> Result<Deployment> {
        let request = ToolRequest {
            proxy: Some(proxy),
            initializer: Some(&options.initializer),
            ..ToolRequest::new("upgradeProxy", network).factory(factory)
        };
        let response = self.invoke(&request).await?;
        Ok(Deployment {
            address: response.address.unwrap_or_else(|| proxy.to_string()),
            tx_hash: response.tx_hash,
        })
    }

    async fn send(
        &self,
        network: &str,
        target: &str,
        factory: &ContractFactory,
        method: &str,
        args: &[Value],
    ) -> Result<Option<TransactionHash>> {
        let request = ToolRequest {
            target: Some(target),
            method: Some(method),
            args,
            ..ToolRequest::new("send", network).factory(factory)
        };
        Ok(self.invoke(&request).await?.tx_hash)
    }

    async fn transfer_proxy_admin_ownership(
        &self,
        network: &str,
        new_admin: &str,
    ) -> Result<Option<TransactionHash>> {
        info!("Transferring proxy admin ownership on {} to {}", network, new_admin);
        let request = ToolRequest {
            new_admin: Some(new_admin),
            ..ToolRequest::new("transferProxyAdminOwnership", network)
        };
        Ok(self.invoke(&request).await?.tx_hash)
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
