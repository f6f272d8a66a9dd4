// =============================================================================
// Config — validated, immutable snapshot of pairs, accounts, and intervals
// =============================================================================
//
// Unlike the hot-reloadable runtime config this project grew out of, trading
// config here is loaded once at startup and never written back: a malformed
// config must fail the process immediately rather than quietly fall back to
// defaults. `ORDER_URL` from the environment always wins over the file, and
// per-account credentials fall back to `<ACCOUNT_NAME>_API_KEY` /
// `<ACCOUNT_NAME>_API_SECRET` environment variables when absent from the file.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_websocket_interval() -> String {
    "1m".to_string()
}

fn default_num_previous_candles() -> usize {
    3
}

fn default_candle_capacity() -> usize {
    20
}

fn default_trigger_count() -> usize {
    20
}

fn default_health_port() -> u16 {
    3000
}

fn default_api_interval_secs() -> u64 {
    10
}

/// Per-symbol tuning: anomaly threshold multiplier, ladder sizing, and
/// notional per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub symbol: String,
    /// Multiplier applied to the rolling average diff to get the dynamic
    /// threshold (§4.2).
    pub threshold: f64,
    #[serde(default)]
    pub fees_exemption_percentage: f64,
    #[serde(default = "default_num_previous_candles")]
    pub num_previous_candles: usize,
    pub usdt_amount: f64,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_trigger_count")]
    pub trigger_count: usize,
}

/// Per-account exchange credentials, loaded from the config file with an
/// environment-variable fallback.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Top-level engine configuration, validated and frozen at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub order_url: String,
    #[serde(default = "default_websocket_interval")]
    pub websocket_interval: String,
    /// Period, in seconds, on which the engine ages out its locally cached
    /// rate-limit usage (the 10-second order-count window specifically;
    /// see `gateway::rate_limit`).
    #[serde(rename = "api_interval", default = "default_api_interval_secs")]
    pub api_interval_secs: u64,
    #[serde(default = "default_candle_capacity")]
    pub candle_capacity: usize,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    pub pairs: Vec<PairConfig>,
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load configuration from `path`, apply environment overrides, and
    /// validate. Fails fast on any structural or credential problem so a
    /// broken config can never reach the engine loop.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        if let Ok(order_url) = std::env::var("ORDER_URL") {
            info!(order_url = %order_url, "ORDER_URL environment override applied");
            config.order_url = order_url;
        }

        for account in &mut config.accounts {
            fill_credentials_from_env(account);
        }

        config.validate()?;

        info!(
            path = %path.display(),
            pairs = config.pairs.len(),
            accounts = config.accounts.len(),
            "config loaded"
        );

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            bail!("config error: no pairs configured");
        }
        if self.accounts.is_empty() {
            bail!("config error: no accounts configured");
        }
        if self.api_interval_secs == 0 {
            bail!("config error: api_interval must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.api_key.is_empty() || account.api_secret.is_empty() {
                bail!("config error: account '{}' missing credentials (set in file or {}_API_KEY/{}_API_SECRET)", account.name, account.name.to_uppercase(), account.name.to_uppercase());
            }
            if !seen.insert(account.name.clone()) {
                bail!("config error: duplicate account name '{}'", account.name);
            }
        }

        for pair in &self.pairs {
            if pair.usdt_amount <= 0.0 {
                bail!("config error: pair '{}' has non-positive usdt_amount", pair.symbol);
            }
            if pair.threshold <= 0.0 {
                bail!("config error: pair '{}' has non-positive threshold", pair.symbol);
            }
            if pair.num_previous_candles == 0 || pair.num_previous_candles > self.candle_capacity {
                bail!(
                    "config error: pair '{}' num_previous_candles {} out of range (1..={})",
                    pair.symbol,
                    pair.num_previous_candles,
                    self.candle_capacity
                );
            }
            if pair.fees_exemption_percentage < 0.0 {
                bail!("config error: pair '{}' has negative fees_exemption_percentage", pair.symbol);
            }
        }

        Ok(())
    }
}

fn fill_credentials_from_env(account: &mut AccountConfig) {
    if account.api_key.is_empty() {
        let var = format!("{}_API_KEY", account.name.to_uppercase());
        if let Ok(v) = std::env::var(&var) {
            account.api_key = v;
        } else {
            warn!(account = %account.name, var = %var, "no API key in config or environment");
        }
    }
    if account.api_secret.is_empty() {
        let var = format!("{}_API_SECRET", account.name.to_uppercase());
        if let Ok(v) = std::env::var(&var) {
            account.api_secret = v;
        } else {
            warn!(account = %account.name, var = %var, "no API secret in config or environment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "order_url": "https://fapi.binance.com",
            "pairs": [
                {"symbol": "BTCUSDT", "threshold": 1.5, "fees_exemption_percentage": 0.1, "usdt_amount": 100.0}
            ],
            "accounts": [
                {"name": "acct-a", "api_key": "k", "api_secret": "s"}
            ]
        }"#
    }

    #[test]
    fn parses_and_validates_minimal_config() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.candle_capacity, 20);
        assert_eq!(config.health_port, 3000);
        assert_eq!(config.api_interval_secs, 10);
        assert_eq!(config.pairs[0].num_previous_candles, 3);
    }

    #[test]
    fn rejects_zero_api_interval() {
        let mut config: Config = serde_json::from_str(sample_json()).unwrap();
        config.api_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_pairs() {
        let mut config: Config = serde_json::from_str(sample_json()).unwrap();
        config.pairs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_credentials() {
        let mut config: Config = serde_json::from_str(sample_json()).unwrap();
        config.accounts[0].api_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_account_names() {
        let mut config: Config = serde_json::from_str(sample_json()).unwrap();
        let dup = config.accounts[0].clone();
        config.accounts.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_num_previous_candles_over_capacity() {
        let mut config: Config = serde_json::from_str(sample_json()).unwrap();
        config.pairs[0].num_previous_candles = 999;
        assert!(config.validate().is_err());
    }
}
