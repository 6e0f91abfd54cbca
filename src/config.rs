//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the arbiter auth token) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub leadership: LeadershipConfig,
    pub market_data: MarketDataConfig,
    pub exchange: ExchangeConfig,
    pub scanner: ScannerConfig,
    pub monitor: MonitorConfig,
    pub sizing: SizingConfig,
    pub risk_score: RiskScoreConfig,
    #[serde(default)]
    pub watchlist: Vec<WatchedInstrument>,
    pub storage: StorageConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Stable identity for leadership claims. A random UUID is generated
    /// when absent (fresh identity per process).
    #[serde(default)]
    pub instance_id: Option<String>,
    pub scan_interval_ms: u64,
    #[serde(default)]
    pub trading_mode: crate::types::TradingMode,
    /// Quote asset used for balance and notional accounting.
    pub quote_asset: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeadershipConfig {
    pub arbiter_url: String,
    /// Env var holding the arbiter bearer token, if the arbiter requires one.
    #[serde(default)]
    pub auth_token_env: Option<String>,
    pub lease_ttl_secs: u64,
    pub renew_interval_secs: u64,
    pub verify_interval_secs: u64,
    pub claim_max_attempts: u32,
    pub claim_base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl LeadershipConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Timeframe passed to the regime detector (e.g. "4h").
    pub regime_timeframe: String,
    /// Symbol whose regime gates the whole book (usually the index leader).
    pub regime_symbol: String,
    #[serde(default = "default_true")]
    pub sentiment_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Heavier aggregate snapshot calls get a longer budget.
    pub snapshot_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    /// Intents with combined signal strength below this are discarded.
    pub min_combined_signal_strength: f64,
    /// Regime observations below this confidence do not gate entries.
    pub min_regime_confidence: f64,
    /// Smallest order the engine will consider, in quote currency.
    pub min_trade_value: Decimal,
    pub max_positions_per_strategy: usize,
    /// Percentage of balance put at risk per trade, before the risk
    /// multiplier scales it down.
    pub max_balance_risk_pct: f64,
    /// Hard cap on total allocated notional, in quote currency.
    pub invest_cap: Decimal,
    pub block_trading_on_downtrend: bool,
    pub regime_confirmation_periods: u32,
    pub regime_history_len: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Close a position once it has lost this fraction of entry notional.
    pub stop_loss_pct: f64,
    /// Close a position once it has gained this fraction of entry notional.
    pub take_profit_pct: f64,
    /// Close positions older than this regardless of P&L. Zero disables.
    pub max_holding_hours: u64,
}

/// Which sizing formula the gate applies to intents.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SizingStrategy {
    VolatilityAdjusted,
    FixedConviction,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SizingConfig {
    pub strategy: SizingStrategy,
    /// Base order notional for fixed-conviction sizing, in quote currency.
    pub base_position_size: Decimal,
    /// Stop distance as a multiple of ATR for volatility-adjusted sizing.
    pub atr_stop_multiplier: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskScoreConfig {
    pub recompute_interval_secs: u64,
    /// The multiplier at full health, in percent of max risk.
    pub max_multiplier_pct: f64,
    /// Absolute floor: trading capability is never fully zeroed out.
    pub floor_pct: f64,
    /// Score at or above which the full multiplier applies.
    pub full_threshold: f64,
    /// Lower edge of the healthy interpolation band.
    pub mid_threshold: f64,
    /// Lower edge of the degraded interpolation band.
    pub low_threshold: f64,
    pub weights: RiskWeights,
}

/// Fixed weight table for the composite risk score. Not editable per cycle.
#[derive(Debug, Deserialize, Clone)]
pub struct RiskWeights {
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub regime: f64,
    pub volatility: f64,
    pub opportunity: f64,
    pub sentiment: f64,
    pub signal_quality: f64,
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.unrealized_pnl
            + self.realized_pnl
            + self.regime
            + self.volatility
            + self.opportunity
            + self.sentiment
            + self.signal_quality
    }
}

/// A scanned instrument with its exchange filters.
#[derive(Debug, Deserialize, Clone)]
pub struct WatchedInstrument {
    pub symbol: String,
    /// Exchange minimum-notional filter for this instrument.
    pub min_notional: Decimal,
    /// Order size quantization step, in quote currency.
    pub step_size: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub state_file: String,
    pub archive_db: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.agent.scan_interval_ms == 0 {
            bail!("agent.scan_interval_ms must be positive");
        }
        if self.leadership.renew_interval_secs >= self.leadership.lease_ttl_secs {
            bail!(
                "leadership.renew_interval_secs ({}) must be below lease_ttl_secs ({})",
                self.leadership.renew_interval_secs,
                self.leadership.lease_ttl_secs,
            );
        }
        if self.leadership.claim_max_attempts == 0 {
            bail!("leadership.claim_max_attempts must be at least 1");
        }

        let weight_sum = self.risk_score.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            bail!("risk_score.weights must sum to 1.0 (got {weight_sum})");
        }
        let rs = &self.risk_score;
        if !(rs.low_threshold < rs.mid_threshold && rs.mid_threshold < rs.full_threshold) {
            bail!(
                "risk_score thresholds must be ordered: low ({}) < mid ({}) < full ({})",
                rs.low_threshold,
                rs.mid_threshold,
                rs.full_threshold,
            );
        }
        if rs.floor_pct <= 0.0 || rs.floor_pct > rs.max_multiplier_pct {
            bail!(
                "risk_score.floor_pct ({}) must be in (0, max_multiplier_pct ({})]",
                rs.floor_pct,
                rs.max_multiplier_pct,
            );
        }

        if self.scanner.min_trade_value <= Decimal::ZERO {
            bail!("scanner.min_trade_value must be positive");
        }
        if self.scanner.max_balance_risk_pct <= 0.0 {
            bail!("scanner.max_balance_risk_pct must be positive");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Scan interval as a `Duration`.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.agent.scan_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_config() -> AppConfig {
        toml::from_str(SAMPLE_TOML).unwrap()
    }

    const SAMPLE_TOML: &str = r#"
[agent]
name = "WARDEN-001"
scan_interval_ms = 60000
trading_mode = "paper"
quote_asset = "USDT"

[leadership]
arbiter_url = "http://localhost:9200"
lease_ttl_secs = 75
renew_interval_secs = 25
verify_interval_secs = 60
claim_max_attempts = 3
claim_base_delay_ms = 500
request_timeout_secs = 30

[market_data]
base_url = "http://localhost:9300"
request_timeout_secs = 30
regime_timeframe = "4h"
regime_symbol = "BTCUSDT"

[exchange]
base_url = "http://localhost:9400"
request_timeout_secs = 30
snapshot_timeout_secs = 90

[scanner]
min_combined_signal_strength = 0.55
min_regime_confidence = 0.6
min_trade_value = 10.0
max_positions_per_strategy = 3
max_balance_risk_pct = 2.0
invest_cap = 5000.0
block_trading_on_downtrend = true
regime_confirmation_periods = 3
regime_history_len = 12

[monitor]
stop_loss_pct = 0.05
take_profit_pct = 0.12
max_holding_hours = 72

[sizing]
strategy = "fixed_conviction"
base_position_size = 100.0
atr_stop_multiplier = 1.5

[risk_score]
recompute_interval_secs = 30
max_multiplier_pct = 100.0
floor_pct = 5.0
full_threshold = 80.0
mid_threshold = 50.0
low_threshold = 30.0

[risk_score.weights]
unrealized_pnl = 0.20
realized_pnl = 0.20
regime = 0.15
volatility = 0.15
opportunity = 0.10
sentiment = 0.10
signal_quality = 0.10

[[watchlist]]
symbol = "BTCUSDT"
min_notional = 10.0
step_size = 0.1

[storage]
state_file = "warden_state.json"
archive_db = "warden_archive.db"

[dashboard]
enabled = true
port = 8900
"#;

    #[test]
    fn test_parse_sample_config() {
        let cfg = sample_config();
        assert_eq!(cfg.agent.name, "WARDEN-001");
        assert_eq!(cfg.agent.scan_interval_ms, 60_000);
        assert_eq!(cfg.scanner.min_trade_value, dec!(10.0));
        assert_eq!(cfg.watchlist.len(), 1);
        assert_eq!(cfg.sizing.strategy, SizingStrategy::FixedConviction);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut cfg = sample_config();
        cfg.risk_score.weights.sentiment = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_renew_must_beat_ttl() {
        let mut cfg = sample_config();
        cfg.leadership.renew_interval_secs = 80;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut cfg = sample_config();
        cfg.risk_score.mid_threshold = 90.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_floor_within_bounds() {
        let mut cfg = sample_config();
        cfg.risk_score.floor_pct = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.risk_score.floor_pct = 150.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_scan_interval_rejected() {
        let mut cfg = sample_config();
        cfg.agent.scan_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_instance_id_is_none() {
        let cfg = sample_config();
        assert!(cfg.agent.instance_id.is_none());
    }
}
