//! JSON-RPC client for the deployment node.
//!
//! Used for confirmation tracking and for resetting a local node onto a fork
//! before a simulated migration. Contract deployment itself goes through the
//! upgrade tool, never through this client.

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::retry::RetryStrategy;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// JSON-RPC request ID type
type RequestId = u64;

/// Node JSON-RPC client
#[derive(Debug, Clone)]
pub struct NodeRpcClient {
    /// HTTP client
    client: Client,
    /// Node endpoint
    base_url: String,
    /// Retry strategy
    retry_strategy: RetryStrategy,
    /// Request ID counter
    request_id: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: RequestId,
    method: String,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Subset of a transaction receipt needed for confirmation tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionReceipt {
    /// Block the transaction was mined in
    pub block_number: u64,
    /// Whether execution succeeded
    pub success: bool,
}

impl NodeRpcClient {
    /// Create a client for the node configured in `config`
    pub fn new(config: &DeployConfig) -> Result<Self> {
        Self::with_url(config, &config.rpc_url)
    }

    /// Create a client for an explicit endpoint
    pub fn with_url(config: &DeployConfig, url: &str) -> Result<Self> {
        url::Url::parse(url)?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(DeployError::NetworkError)?;

        Ok(Self {
            client,
            base_url: url.to_string(),
            retry_strategy: RetryStrategy::from_config(config),
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Endpoint this client talks to
    pub fn url(&self) -> &str {
        &self.base_url
    }

    fn next_request_id(&self) -> RequestId {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make a JSON-RPC call; a missing or null result is returned as `Value::Null`
    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_request_id(),
            method: method.to_string(),
            params,
        };

        debug!("Node RPC request: {} (id: {})", method, request.id);

        self.retry_strategy
            .retry(|| async {
                let response = self
                    .client
                    .post(&self.base_url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(DeployError::NetworkError)?;

                let status = response.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(DeployError::RateLimitExceeded(retry_after_secs(&response)));
                }
                if !status.is_success() {
                    let message = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(DeployError::HttpStatus {
                        status: status.as_u16(),
                        message,
                    });
                }

                let rpc_response: JsonRpcResponse = response
                    .json()
                    .await
                    .map_err(|e| DeployError::InvalidResponse(e.to_string()))?;

                if let Some(error) = rpc_response.error {
                    error!("Node RPC error: {} (code: {})", error.message, error.code);
                    return Err(DeployError::RpcError(format!(
                        "{} (code: {})",
                        error.message, error.code
                    )));
                }

                Ok(rpc_response.result.unwrap_or(Value::Null))
            })
            .await
    }

    /// Chain id reported by the node
    pub async fn chain_id(&self) -> Result<u64> {
        let result = self.call_rpc("eth_chainId", json!([])).await?;
        parse_quantity(&result, "eth_chainId")
    }

    /// Latest block number
    pub async fn block_number(&self) -> Result<u64> {
        let result = self.call_rpc("eth_blockNumber", json!([])).await?;
        parse_quantity(&result, "eth_blockNumber")
    }

    /// Receipt of a mined transaction, `None` while pending
    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>> {
        let result = self
            .call_rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }

        let block_number = parse_quantity(&result["blockNumber"], "receipt blockNumber")?;
        // pre-byzantium receipts carry no status
        let success = match result.get("status") {
            Some(Value::Null) | None => true,
            Some(status) => parse_quantity(status, "receipt status")? == 1,
        };

        Ok(Some(TransactionReceipt {
            block_number,
            success,
        }))
    }

    /// Reset a local node onto a fork of `fork_url`, optionally pinned to a block
    pub async fn reset_fork(&self, fork_url: &str, block_number: Option<u64>) -> Result<()> {
        url::Url::parse(fork_url)?;
        info!("Resetting {} onto a fork of {}", self.base_url, fork_url);

        let mut forking = json!({ "jsonRpcUrl": fork_url });
        if let Some(block) = block_number {
            forking["blockNumber"] = json!(block);
        }

        let result = self
            .call_rpc("hardhat_reset", json!([{ "forking": forking }]))
            .await?;
        match result {
            Value::Bool(true) => Ok(()),
            other => Err(DeployError::InvalidResponse(format!(
                "hardhat_reset returned {}",
                other
            ))),
        }
    }

    /// Health check - verify the node answers
    pub async fn health_check(&self) -> Result<bool> {
        let chain_id = self.chain_id().await?;
        debug!("Node {} is up (chain {})", self.base_url, chain_id);
        Ok(true)
    }
}

/// Seconds requested by a `Retry-After` header, 0 when absent or a date
fn retry_after_secs(response: &Response) -> u64 {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Parse a `0x`-prefixed hex quantity
fn parse_quantity(value: &Value, what: &str) -> Result<u64> {
    let raw = value
        .as_str()
        .ok_or_else(|| DeployError::InvalidResponse(format!("Missing {}", what)))?;
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| DeployError::InvalidResponse(format!("{} is not hex: {}", what, raw)))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| DeployError::InvalidResponse(format!("{} {}: {}", what, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x7a69"), "chain").unwrap(), 31337);
        assert_eq!(parse_quantity(&json!("0x0"), "n").unwrap(), 0);
        assert_matches!(
            parse_quantity(&json!("12"), "n"),
            Err(DeployError::InvalidResponse(_))
        );
        assert_matches!(
            parse_quantity(&Value::Null, "n"),
            Err(DeployError::InvalidResponse(_))
        );
    }

    #[test]
    fn test_client_rejects_bad_url() {
        let config = DeployConfig::default();
        assert_matches!(
            NodeRpcClient::with_url(&config, "localhost without scheme"),
            Err(DeployError::UrlParseError(_))
        );
        assert!(NodeRpcClient::new(&config).is_ok());
    }
}
