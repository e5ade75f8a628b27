//! Waiting for on-chain confirmations.
//!
//! A task is only complete once each of its transactions has the requested
//! number of confirmations; the next task never starts earlier. Receipts are
//! polled on the node of the network the transaction was sent to.

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::rpc::NodeRpcClient;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Blocks until a transaction is sufficiently confirmed
#[async_trait]
pub trait ConfirmationWaiter: Send + Sync {
    /// Wait until `tx_hash`, sent on `network`, has at least `confirmations`
    /// confirmations
    async fn wait(&self, network: &str, tx_hash: &str, confirmations: u64) -> Result<()>;
}

/// Waiter for backends that only return after confirming themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConfirmations;

#[async_trait]
impl ConfirmationWaiter for NoConfirmations {
    async fn wait(&self, _network: &str, _tx_hash: &str, _confirmations: u64) -> Result<()> {
        Ok(())
    }
}

/// Polls each network's node for receipts and block height
#[derive(Clone)]
pub struct ConfirmationMonitor {
    default_node: NodeRpcClient,
    nodes: BTreeMap<String, NodeRpcClient>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ConfirmationMonitor {
    /// Monitor polling `rpc` for every network, with the polling settings of
    /// `config`
    pub fn new(rpc: NodeRpcClient, config: &DeployConfig) -> Self {
        Self {
            default_node: rpc,
            nodes: BTreeMap::new(),
            poll_interval: Duration::from_millis(config.tx_poll_interval_ms),
            timeout: Duration::from_secs(config.tx_timeout_secs),
        }
    }

    /// Monitor with one client per endpoint configured in `config`
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        let mut monitor = Self::new(NodeRpcClient::new(config)?, config);
        for (network, url) in &config.network_rpc_urls {
            monitor = monitor.with_node(network.clone(), NodeRpcClient::with_url(config, url)?);
        }
        Ok(monitor)
    }

    /// Poll `rpc` for transactions sent on `network`
    pub fn with_node(mut self, network: impl Into<String>, rpc: NodeRpcClient) -> Self {
        self.nodes.insert(network.into(), rpc);
        self
    }

    /// Client polled for `network`
    pub fn node_for(&self, network: &str) -> &NodeRpcClient {
        self.nodes.get(network).unwrap_or(&self.default_node)
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ConfirmationWaiter for ConfirmationMonitor {
    async fn wait(&self, network: &str, tx_hash: &str, confirmations: u64) -> Result<()> {
        let rpc = self.node_for(network);
        info!(
            "Waiting for {} confirmation(s) of {} on {} (timeout: {:?})",
            confirmations, tx_hash, network, self.timeout
        );

        let start = Instant::now();
        let mut mined_in = None;

        loop {
            if start.elapsed() >= self.timeout {
                warn!("Confirmation wait timed out: {}", tx_hash);
                return Err(DeployError::TransactionTimeout(self.timeout.as_secs()));
            }

            let block = match mined_in {
                Some(block) => block,
                None => match rpc.transaction_receipt(tx_hash).await? {
                    Some(receipt) if !receipt.success => {
                        warn!("Transaction reverted: {}", tx_hash);
                        return Err(DeployError::TransactionReverted(tx_hash.to_string()));
                    }
                    Some(receipt) => {
                        mined_in = Some(receipt.block_number);
                        receipt.block_number
                    }
                    None => {
                        debug!("Transaction not yet mined: {}", tx_hash);
                        sleep(self.poll_interval).await;
                        continue;
                    }
                },
            };

            let head = rpc.block_number().await?;
            let confirmed = head.saturating_sub(block) + 1;
            if confirmed >= confirmations {
                info!("{} confirmed ({} blocks)", tx_hash, confirmed);
                return Ok(());
            }
            debug!("{} has {}/{} confirmations", tx_hash, confirmed, confirmations);

            sleep(self.poll_interval).await;
        }
    }
}
