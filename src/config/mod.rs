//! Configuration for the spread maker.
//!
//! Loads settings from a `config` file and `SPREAD_MAKER__`-prefixed
//! environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Kalshi API credentials
    pub kalshi: KalshiConfig,
    /// Quoting and sizing parameters
    #[serde(default)]
    pub trading: TradingConfig,
    /// Capital and halt limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Market discovery parameters
    #[serde(default)]
    pub scanning: ScanConfig,
    /// Ledger database location
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KalshiConfig {
    /// API key id
    pub api_key: String,
    /// Path to the RSA private key PEM file
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// Inline PEM, used when no path is given
    #[serde(default)]
    pub private_key_pem: Option<String>,
    /// Use the demo environment instead of production
    #[serde(default)]
    pub demo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Record placements in the ledger only, never on the exchange
    #[serde(default = "default_paper_trade")]
    pub paper_trade: bool,
    /// Master switch for new placements
    #[serde(default = "default_trading_enabled")]
    pub trading_enabled: bool,
    /// Minimum net profit per contract, in cents, to accept a signal
    #[serde(default = "default_min_spread_threshold")]
    pub min_spread_threshold: i64,
    /// Maximum contracts per leg
    #[serde(default = "default_order_size")]
    pub order_size_default: i64,
    /// Cap on per-pair dollar cost
    #[serde(default = "default_max_exposure_per_market")]
    pub max_exposure_per_market: Decimal,
    /// Seconds to wait on a one-sided fill before cancelling
    #[serde(default = "default_pair_timeout")]
    pub pair_timeout_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Capital book starting balance in dollars
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: Decimal,
    /// Consecutive one-sided fills that trigger a halt
    #[serde(default = "default_max_one_sided_fills")]
    pub max_one_sided_fills_before_halt: u32,
    /// Time-to-close at which any open pair is force-cancelled
    #[serde(default = "default_cancel_deadline")]
    pub cancel_deadline_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Minimum time-to-close for a contract to be scanned
    #[serde(default = "default_resolution_buffer")]
    pub resolution_buffer_seconds: i64,
    /// Cycle period
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    /// Assets to quote
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,
    /// Markets requested per series per scan
    #[serde(default = "default_market_limit")]
    pub market_limit: u32,
}

// Default value functions

fn default_database_path() -> String {
    "spread_maker.db".to_string()
}

fn default_paper_trade() -> bool {
    true
}

fn default_trading_enabled() -> bool {
    true
}

fn default_min_spread_threshold() -> i64 {
    2
}

fn default_order_size() -> i64 {
    10
}

fn default_max_exposure_per_market() -> Decimal {
    Decimal::new(100, 0) // $100
}

fn default_pair_timeout() -> i64 {
    60
}

fn default_max_total_exposure() -> Decimal {
    Decimal::new(1000, 0) // $1000
}

fn default_max_one_sided_fills() -> u32 {
    3
}

fn default_cancel_deadline() -> i64 {
    90
}

fn default_resolution_buffer() -> i64 {
    120
}

fn default_scan_interval() -> u64 {
    10
}

fn default_assets() -> Vec<String> {
    ["BTC", "ETH", "SOL", "XRP"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_market_limit() -> u32 {
    100
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            paper_trade: default_paper_trade(),
            trading_enabled: default_trading_enabled(),
            min_spread_threshold: default_min_spread_threshold(),
            order_size_default: default_order_size(),
            max_exposure_per_market: default_max_exposure_per_market(),
            pair_timeout_seconds: default_pair_timeout(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_total_exposure: default_max_total_exposure(),
            max_one_sided_fills_before_halt: default_max_one_sided_fills(),
            cancel_deadline_seconds: default_cancel_deadline(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            resolution_buffer_seconds: default_resolution_buffer(),
            scan_interval_seconds: default_scan_interval(),
            assets: default_assets(),
            market_limit: default_market_limit(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("SPREAD_MAKER"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.kalshi.api_key.is_empty(), "kalshi.api_key must be set");

        anyhow::ensure!(
            self.trading.min_spread_threshold >= 1,
            "min_spread_threshold must be at least 1 cent"
        );

        anyhow::ensure!(
            self.trading.order_size_default >= 1,
            "order_size_default must be at least 1 contract"
        );

        anyhow::ensure!(
            self.trading.max_exposure_per_market > Decimal::ZERO
                && self.risk.max_total_exposure >= self.trading.max_exposure_per_market,
            "max_total_exposure must cover at least one max-exposure pair"
        );

        anyhow::ensure!(
            self.scanning.resolution_buffer_seconds > self.risk.cancel_deadline_seconds,
            "resolution_buffer_seconds must exceed cancel_deadline_seconds"
        );

        anyhow::ensure!(
            !self.scanning.assets.is_empty(),
            "at least one asset must be configured"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kalshi: KalshiConfig {
                api_key: String::new(),
                private_key_path: None,
                private_key_pem: None,
                demo: true,
            },
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            scanning: ScanConfig::default(),
            database_path: default_database_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.kalshi.api_key = "test-key".to_string();
        config
    }

    #[test]
    fn test_default_config_with_key_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_must_exceed_deadline() {
        let mut config = valid_config();
        config.scanning.resolution_buffer_seconds = 60;
        config.risk.cancel_deadline_seconds = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_total_exposure_must_cover_one_pair() {
        let mut config = valid_config();
        config.risk.max_total_exposure = Decimal::new(50, 0);
        config.trading.max_exposure_per_market = Decimal::new(100, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_assets() {
        let config = Config::default();
        assert_eq!(config.scanning.assets, vec!["BTC", "ETH", "SOL", "XRP"]);
    }
}
