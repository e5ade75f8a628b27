//! Per-market AMM deployment parameters, keyed by network and market name.
//!
//! Amounts and ratios are 18-decimal fixed-point integers kept as decimal
//! strings; the upgrade tool encodes them as uint256.

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Network key whose markets apply to every network without its own entry
pub const DEFAULT_NETWORK: &str = "default";

/// Constructor/initializer arguments of an AMM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmmDeployArgs {
    /// Initial quote reserve
    pub quote_asset_reserve: String,
    /// Initial base reserve
    pub base_asset_reserve: String,
    /// Max fraction of reserves one trade may move
    pub trade_limit_ratio: String,
    /// Funding period in seconds
    pub funding_period: u64,
    /// Max per-block price fluctuation
    pub fluctuation_limit_ratio: String,
    /// Toll fee ratio
    pub toll_ratio: String,
    /// Spread fee ratio
    pub spread_ratio: String,
    /// Key of the market in the price feed
    pub price_feed_key: String,
}

/// Risk caps applied after deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmmProperties {
    /// Max position size in base asset
    pub max_holding_base_asset: String,
    /// Cap on total open interest notional
    pub open_interest_notional_cap: String,
}

/// Everything needed to bring up one market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmmConfig {
    /// Initializer arguments
    pub deploy_args: AmmDeployArgs,
    /// Post-deploy caps
    pub properties: AmmProperties,
}

impl AmmConfig {
    /// Initializer arguments in contract order
    pub fn init_args(&self, price_feed: &str, quote_asset: &str) -> Vec<Value> {
        let args = &self.deploy_args;
        vec![
            json!(args.quote_asset_reserve),
            json!(args.base_asset_reserve),
            json!(args.trade_limit_ratio),
            json!(args.funding_period.to_string()),
            json!(price_feed),
            json!(args.price_feed_key),
            json!(quote_asset),
            json!(args.fluctuation_limit_ratio),
            json!(args.toll_ratio),
            json!(args.spread_ratio),
        ]
    }

    /// Arguments of the cap setter
    pub fn cap_args(&self) -> Vec<Value> {
        vec![
            json!(self.properties.max_holding_base_asset),
            json!(self.properties.open_interest_notional_cap),
        ]
    }

    fn validate(&self, market: &str) -> Result<()> {
        let args = &self.deploy_args;
        let fields = [
            ("quoteAssetReserve", &args.quote_asset_reserve),
            ("baseAssetReserve", &args.base_asset_reserve),
            ("tradeLimitRatio", &args.trade_limit_ratio),
            ("fluctuationLimitRatio", &args.fluctuation_limit_ratio),
            ("tollRatio", &args.toll_ratio),
            ("spreadRatio", &args.spread_ratio),
            ("maxHoldingBaseAsset", &self.properties.max_holding_base_asset),
            ("openInterestNotionalCap", &self.properties.open_interest_notional_cap),
        ];
        for (field, value) in fields {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(DeployError::ConfigError(format!(
                    "{}.{} must be a decimal integer, got {:?}",
                    market, field, value
                )));
            }
        }
        Ok(())
    }
}

/// AMM parameters keyed by network, then market
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketTable(BTreeMap<String, BTreeMap<String, AmmConfig>>);

fn units(value: u128) -> String {
    (value * 10u128.pow(18)).to_string()
}

fn per_mille(value: u128) -> String {
    (value * 10u128.pow(15)).to_string()
}

fn market(quote: u128, base: u128, key: &str, max_holding: u128) -> AmmConfig {
    AmmConfig {
        deploy_args: AmmDeployArgs {
            quote_asset_reserve: units(quote),
            base_asset_reserve: units(base),
            trade_limit_ratio: per_mille(900),
            funding_period: 3600,
            fluctuation_limit_ratio: per_mille(12),
            toll_ratio: "0".to_string(),
            spread_ratio: per_mille(1),
            price_feed_key: key.to_string(),
        },
        properties: AmmProperties {
            max_holding_base_asset: units(max_holding),
            open_interest_notional_cap: units(2_000_000),
        },
    }
}

impl MarketTable {
    /// Markets shipped with the deployer
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.insert(DEFAULT_NETWORK, "ETHUSDC", market(10_000_000, 20_000, "ETH", 100));
        table.insert(DEFAULT_NETWORK, "BTCUSDC", market(10_000_000, 500, "BTC", 5));
        table.insert(DEFAULT_NETWORK, "YFIUSDC", market(2_000_000, 100, "YFI", 2));
        table
    }

    /// Load a table from TOML (`[<network>.<market>]` tables)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let table: MarketTable = toml::from_str(&content)?;
        table.validate()?;
        Ok(table)
    }

    /// Add or replace a market
    pub fn insert(&mut self, network: &str, market: &str, config: AmmConfig) {
        self.0
            .entry(network.to_string())
            .or_default()
            .insert(market.to_string(), config);
    }

    /// Parameters of `market` on `network`, falling back to the default network
    pub fn lookup(&self, network: &str, market: &str) -> Result<&AmmConfig> {
        self.0
            .get(network)
            .and_then(|markets| markets.get(market))
            .or_else(|| self.0.get(DEFAULT_NETWORK).and_then(|m| m.get(market)))
            .ok_or_else(|| DeployError::UnknownMarket {
                network: network.to_string(),
                market: market.to_string(),
            })
    }

    /// Check every entry holds decimal integers
    pub fn validate(&self) -> Result<()> {
        for markets in self.0.values() {
            for (market, config) in markets {
                config.validate(market)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_builtin_table_is_valid() {
        let table = MarketTable::builtin();
        table.validate().unwrap();

        let eth = table.lookup("rinkeby", "ETHUSDC").unwrap();
        assert_eq!(eth.deploy_args.quote_asset_reserve, "10000000000000000000000000");
        assert_eq!(eth.deploy_args.trade_limit_ratio, "900000000000000000");
        assert_eq!(eth.deploy_args.price_feed_key, "ETH");
    }

    #[test]
    fn test_network_specific_entry_wins() {
        let mut table = MarketTable::builtin();
        let mut custom = table.lookup(DEFAULT_NETWORK, "BTCUSDC").unwrap().clone();
        custom.deploy_args.base_asset_reserve = units(250);
        table.insert("homestead", "BTCUSDC", custom);

        assert_eq!(
            table.lookup("homestead", "BTCUSDC").unwrap().deploy_args.base_asset_reserve,
            units(250)
        );
        assert_eq!(
            table.lookup("xdai", "BTCUSDC").unwrap().deploy_args.base_asset_reserve,
            units(500)
        );
    }

    #[test]
    fn test_unknown_market() {
        assert_matches!(
            MarketTable::builtin().lookup("xdai", "DOGEUSDC"),
            Err(DeployError::UnknownMarket { market, .. }) if market == "DOGEUSDC"
        );
    }

    #[test]
    fn test_init_args_order() {
        let table = MarketTable::builtin();
        let args = table
            .lookup(DEFAULT_NETWORK, "ETHUSDC")
            .unwrap()
            .init_args("0xFEED", "0xUSDC");
        assert_eq!(args.len(), 10);
        assert_eq!(args[3], json!("3600"));
        assert_eq!(args[4], json!("0xFEED"));
        assert_eq!(args[5], json!("ETH"));
        assert_eq!(args[6], json!("0xUSDC"));
    }

    #[test]
    fn test_from_file_rejects_non_decimal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markets.toml");
        std::fs::write(
            &path,
            r#"
[xdai.SNXUSDC.deployArgs]
quoteAssetReserve = "1e24"
baseAssetReserve = "100"
tradeLimitRatio = "1"
fundingPeriod = 3600
fluctuationLimitRatio = "1"
tollRatio = "0"
spreadRatio = "1"
priceFeedKey = "SNX"

[xdai.SNXUSDC.properties]
maxHoldingBaseAsset = "1"
openInterestNotionalCap = "1"
"#,
        )
        .unwrap();

        assert_matches!(MarketTable::from_file(&path), Err(DeployError::ConfigError(_)));
    }
}
