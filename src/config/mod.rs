//! Configuration management for TradeDesk
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::RiskLimits;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub gateway: GatewayConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// Version tag for logging
    pub tag: String,
    /// Symbols to keep live quotes for
    pub watchlist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Backend API base URL
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Price poll interval in milliseconds
    pub price_interval_ms: u64,
    /// Challenge silent-refresh interval in seconds
    pub challenge_refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Linear backoff base in milliseconds
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Daily loss limit as percent of starting balance
    pub daily_loss_limit_percent: f64,
    /// Max total loss limit as percent of starting balance
    pub max_loss_limit_percent: f64,
    /// Profit target as percent of starting balance
    pub profit_target_percent: f64,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("app.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("app.watchlist", vec!["AAPL", "MSFT"])?
            // Gateway defaults
            .set_default("gateway.base_url", "http://localhost:5000/api")?
            .set_default("gateway.request_timeout_ms", 30000)?
            // Sync defaults
            .set_default("sync.price_interval_ms", 5000)?
            .set_default("sync.challenge_refresh_secs", 30)?
            // Retry defaults
            .set_default("retry.max_retries", 2)?
            .set_default("retry.base_delay_ms", 1000)?
            // Risk defaults
            .set_default("risk.daily_loss_limit_percent", 5.0)?
            .set_default("risk.max_loss_limit_percent", 10.0)?
            .set_default("risk.profit_target_percent", 10.0)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (TRADEDESK_*)
            .add_source(Environment::with_prefix("TRADEDESK").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "tag={} base_url={} watchlist={:?} price_interval_ms={} refresh_secs={}",
            self.app.tag,
            self.gateway.base_url,
            self.app.watchlist,
            self.sync.price_interval_ms,
            self.sync.challenge_refresh_secs
        )
    }

    /// Validate required environment variables
    pub fn validate_env(&self) -> Result<()> {
        if std::env::var("TRADEDESK_API_TOKEN").is_err() {
            bail!("Required environment variable TRADEDESK_API_TOKEN is not set");
        }
        Ok(())
    }

    pub fn price_interval(&self) -> Duration {
        Duration::from_millis(self.sync.price_interval_ms)
    }

    pub fn challenge_refresh(&self) -> Duration {
        Duration::from_secs(self.sync.challenge_refresh_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            daily_loss_limit_percent: decimal_or(self.risk.daily_loss_limit_percent, dec!(5)),
            max_loss_limit_percent: decimal_or(self.risk.max_loss_limit_percent, dec!(10)),
            profit_target_percent: decimal_or(self.risk.profit_target_percent, dec!(10)),
        }
    }
}

fn decimal_or(value: f64, fallback: Decimal) -> Decimal {
    Decimal::try_from(value).unwrap_or(fallback)
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_files() {
        let config = AppConfig::load().expect("defaults should load");
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.sync.price_interval_ms, 5000);
        assert_eq!(config.risk_limits(), RiskLimits::default());
    }

    #[test]
    fn test_duration_helpers() {
        let config = AppConfig::load().expect("defaults should load");
        assert_eq!(config.price_interval(), Duration::from_millis(5000));
        assert_eq!(config.challenge_refresh(), Duration::from_secs(30));
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
    }
}
