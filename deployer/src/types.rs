//! Common types shared by the stores, wrappers and executor.

use crate::config::Layer;
use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hex-encoded on-chain address
pub type Address = String;

/// Hex-encoded transaction hash
pub type TransactionHash = String;

/// Well-known keys inside [`ExternalContracts`]
pub mod external {
    /// Governance multisig receiving upgrade-admin ownership
    pub const FOUNDATION_GOVERNANCE: &str = "foundationGovernance";
    /// Arbitrageur account
    pub const ARBITRAGEUR: &str = "arbitrageur";
    /// Faucet on test networks
    pub const TESTNET_FAUCET: &str = "testnetFaucet";
    /// USDC token
    pub const USDC: &str = "usdc";
    /// Tether token
    pub const TETHER: &str = "tether";
    /// Arbitrary message bridge on layer1
    pub const AMB_BRIDGE_ON_ETH: &str = "ambBridgeOnEth";
    /// Arbitrary message bridge on layer2
    pub const AMB_BRIDGE_ON_XDAI: &str = "ambBridgeOnXDai";
    /// Token mediator on layer1
    pub const MULTI_TOKEN_MEDIATOR_ON_ETH: &str = "multiTokenMediatorOnEth";
    /// Token mediator on layer2
    pub const MULTI_TOKEN_MEDIATOR_ON_XDAI: &str = "multiTokenMediatorOnXDai";
}

/// Addresses of contracts deployed outside this system, keyed by well-known name.
/// Entries are optional until known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalContracts(BTreeMap<String, Address>);

impl ExternalContracts {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, address: impl Into<Address>) -> Self {
        self.0.insert(key.into(), address.into());
        self
    }

    /// Address for `key`, if configured
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Address for `key` on `layer`, failing when not configured
    pub fn require(&self, layer: Layer, key: &str) -> Result<&str> {
        self.get(key)
            .filter(|address| !address.is_empty())
            .ok_or_else(|| DeployError::MissingExternalContract {
                layer,
                key: key.to_string(),
            })
    }

    /// Governance address, if configured
    pub fn foundation_governance(&self) -> Option<&str> {
        self.get(external::FOUNDATION_GOVERNANCE)
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// What is recorded for one deployed alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMetadata {
    /// Contract name (the artifact's contract name, not the alias)
    pub name: String,
    /// Deployed address; the proxy address for upgradable contracts
    pub address: Address,
}

impl ContractMetadata {
    /// Create a new record
    pub fn new(name: impl Into<String>, address: impl Into<Address>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Funded account on a local development node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAccount {
    /// Hex-encoded private key
    pub private_key: String,
    /// Initial balance in wei, as a decimal string
    pub balance: String,
}

/// Result of a deployment reported by the upgrade tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Deployed (or proxy) address
    pub address: Address,
    /// Transaction that created it, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TransactionHash>,
}

impl Deployment {
    /// Deployment without a known transaction hash
    pub fn at(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            tx_hash: None,
        }
    }

    /// Attach the creating transaction
    pub fn with_tx_hash(mut self, tx_hash: impl Into<TransactionHash>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }
}
