//! Error types for the deployment orchestration core.
//!
//! Configuration, sequencing and metadata-consistency errors are raised before
//! any state is mutated. On-chain and tool failures propagate unchanged so the
//! next invocation retries the interrupted task from scratch.

use crate::config::{Layer, Stage};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for deployment operations
#[derive(Error, Debug)]
pub enum DeployError {
    /// Stage name is not one of production, staging, test
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Layer name is not one of layer1, layer2
    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    /// Migration file name does not follow `NNNN-<layer>-<description>`
    #[error("Invalid migration file name {name}: {reason}")]
    InvalidMigrationName {
        /// File name that failed to parse
        name: String,
        /// What was wrong with it
        reason: String,
    },

    /// Attempted batch is not the next expected batch for the layer
    #[error("Cannot run batch {attempted} on {layer}: next expected batch is {expected}")]
    SequenceViolation {
        /// Target layer
        layer: Layer,
        /// Batch the caller tried to run
        attempted: u64,
        /// Batch recorded as next in the settings store
        expected: u64,
    },

    /// Stored progress does not fit the migration being resumed
    #[error("Corrupt progress for {layer}: {message}")]
    CorruptProgress {
        /// Target layer
        layer: Layer,
        /// Description of the inconsistency
        message: String,
    },

    /// Recorded contract name for an alias differs from the expected one
    #[error("Contract name mismatch for {alias} on {layer}: recorded {recorded}, expected {expected}")]
    MetadataNameMismatch {
        /// Layer holding the record
        layer: Layer,
        /// Alias / instance name
        alias: String,
        /// Name found in the metadata file
        recorded: String,
        /// Name implied by the caller
        expected: String,
    },

    /// No address recorded yet for an alias a task depends on
    #[error("Contract {alias} has not been deployed on {layer}")]
    ContractNotDeployed {
        /// Layer looked up
        layer: Layer,
        /// Alias / instance name
        alias: String,
    },

    /// Stage settings have no entry for the requested layer
    #[error("Layer {layer} is not configured for stage {stage}")]
    LayerNotConfigured {
        /// Active stage
        stage: Stage,
        /// Requested layer
        layer: Layer,
    },

    /// Settings file missing for a stage that has no built-in defaults
    #[error("Settings file not found: {}", .0.display())]
    SettingsNotFound(PathBuf),

    /// External contract address required but not configured
    #[error("External contract {key} is not configured on {layer}")]
    MissingExternalContract {
        /// Layer looked up
        layer: Layer,
        /// External contract key
        key: String,
    },

    /// Attempt to persist local accounts for a non-local network
    #[error("Refusing to record local accounts for non-local network {0}")]
    NonLocalAccounts(String),

    /// Unknown AMM market for the target network
    #[error("No AMM parameters for market {market} on network {network}")]
    UnknownMarket {
        /// Network the table was searched for
        network: String,
        /// Market name
        market: String,
    },

    /// Compiled artifact missing from the artifact root
    #[error("Artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    /// External upgrade tool reported a failure
    #[error("Upgrade tool failed during {operation}: {message}")]
    UpgradeTool {
        /// Operation requested from the tool
        operation: String,
        /// Tool diagnostics
        message: String,
    },

    /// Another process holds the deployment lock for this stage
    #[error("Deployment already in progress (lock file {})", .0.display())]
    DeploymentLocked(PathBuf),

    /// Task did not finish within the configured timeout
    #[error("Task '{description}' timed out after {secs} seconds")]
    TaskTimeout {
        /// Task description
        description: String,
        /// Timeout that elapsed
        secs: u64,
    },

    /// Node JSON-RPC error
    #[error("Node RPC error: {0}")]
    RpcError(String),

    /// Node's HTTP front answered with a non-success status
    #[error("Node returned HTTP {status}: {message}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// Network communication error
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Transaction reverted on chain
    #[error("Transaction reverted: {0}")]
    TransactionReverted(String),

    /// Transaction confirmation timeout
    #[error("Transaction timeout after {0} seconds")]
    TransactionTimeout(u64),

    /// Transaction receipt not yet available
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {0} seconds")]
    RateLimitExceeded(u64),

    /// Max retries exceeded
    #[error("Max retries ({0}) exceeded")]
    MaxRetriesExceeded(usize),

    /// Invalid response from node or tool
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
}

/// Result type alias for deployment operations
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_violation_mentions_both_batches() {
        let err = DeployError::SequenceViolation {
            layer: Layer::Layer2,
            attempted: 3,
            expected: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 3"));
        assert!(msg.contains("next expected batch is 1"));
        assert!(msg.contains("layer2"));
    }

    #[test]
    fn test_name_mismatch_display() {
        let err = DeployError::MetadataNameMismatch {
            layer: Layer::Layer1,
            alias: "bar".to_string(),
            recorded: "Foo".to_string(),
            expected: "Baz".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Contract name mismatch for bar on layer1: recorded Foo, expected Baz"
        );
    }
}
