use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::{Instrument, OrderType};

const ENV_PREFIX: &str = "BREAKOUT";

/// Breakout detector parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub lookback: usize,             // Ticks in the rolling window
    pub breakout_threshold_pct: f64, // 0.005 = price must clear the range by 0.5%
    pub volume_multiple: f64,        // Multiple of rolling average volume
    pub arm_distance_pct: f64,       // Within this distance of the level = armed
    pub cooldown_secs: u64,
    pub epsilon: f64, // Relative tolerance for price/volume comparisons
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            lookback: 20,
            breakout_threshold_pct: 0.005,
            volume_multiple: 2.0,
            arm_distance_pct: 0.002,
            cooldown_secs: 2 * 60 * 60, // 1 signal per instrument every 2 hours
            epsilon: 1e-9,
        }
    }
}

impl DetectorConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// Broker call, retry and reconciliation policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub order_type: OrderType,
    pub broker_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_concurrent_broker_calls: usize,
    pub reconcile_interval_secs: u64,
    pub event_poll_interval_ms: u64,
    pub order_ttl_secs: u64,
    pub cas_max_attempts: u32,
    pub shutdown_grace_secs: u64,
    pub worker_tick_capacity: usize, // Ticks queued per worker before new ones are shed
    pub max_signal_age_secs: u64,    // Older signals are discarded
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_type: OrderType::Market,
            broker_timeout_ms: 5_000,
            max_retries: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            max_concurrent_broker_calls: 8,
            reconcile_interval_secs: 30,
            event_poll_interval_ms: 500,
            order_ttl_secs: 300,
            cas_max_attempts: 5,
            shutdown_grace_secs: 15,
            worker_tick_capacity: 1024,
            max_signal_age_secs: 60,
        }
    }
}

impl ExecutionConfig {
    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn order_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.order_ttl_secs as i64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn max_signal_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_signal_age_secs as i64)
    }
}

/// Risk limits applied before an entry is submitted
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub position_notional: f64, // Quote currency per entry
    pub max_open_positions: usize,
    pub max_daily_stop_losses: u32,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,        // First target
    pub second_take_profit_pct: f64, // Second target, further out than the first
    pub first_target_fraction: f64,  // Share of the held quantity sold at each target;
    pub second_target_fraction: f64, // 1.0 at the first target disables staging
    pub trailing_stop_pct: f64,      // Distance of the trailing stop armed after the second target
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            position_notional: 100.0,
            max_open_positions: 3,
            max_daily_stop_losses: 2, // 2 stops in a day -> pause entries
            stop_loss_pct: 0.03,
            take_profit_pct: 0.05,
            second_take_profit_pct: 0.10,
            first_target_fraction: 0.3,
            second_target_fraction: 0.43, // ~30% of the original size
            trailing_stop_pct: 0.03,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    #[default]
    Paper,
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub requests_per_second: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Paper,
            base_url: None,
            api_key: None,
            api_secret: None,
            requests_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    #[default]
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Postgres,
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    #[default]
    Redis,
    Stdin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub kind: FeedKind,
    pub redis_url: String,
    pub poll_interval_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            kind: FeedKind::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            poll_interval_ms: 250,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub detector: DetectorConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub feed: FeedConfig,
    pub instruments: Vec<Instrument>,
}

impl EngineConfig {
    /// Load from an optional TOML file layered under `BREAKOUT__*` env vars
    ///
    /// `DATABASE_URL`, `BROKER_API_KEY` and `BROKER_API_SECRET` are honoured
    /// as plain env vars and win over everything else.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("store.database_url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("broker.api_key", std::env::var("BROKER_API_KEY").ok())?
            .set_override_option("broker.api_secret", std::env::var("BROKER_API_SECRET").ok())?
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instruments.is_empty() {
            return invalid("at least one instrument is required");
        }

        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                return invalid("instrument id must not be empty");
            }
            if !seen.insert(instrument.id.as_str()) {
                return invalid(format!("duplicate instrument {}", instrument.id));
            }
            if !(instrument.tick_size > 0.0) || !(instrument.min_order_size > 0.0) {
                return invalid(format!(
                    "instrument {} needs positive tick_size and min_order_size",
                    instrument.id
                ));
            }
        }

        let d = &self.detector;
        if d.lookback < 2 {
            return invalid("detector.lookback must be at least 2");
        }
        if !(d.breakout_threshold_pct > 0.0) || !(d.volume_multiple > 0.0) {
            return invalid("detector thresholds must be positive");
        }
        if d.arm_distance_pct < 0.0 || d.epsilon < 0.0 {
            return invalid("detector.arm_distance_pct and epsilon must not be negative");
        }

        let e = &self.execution;
        if e.broker_timeout_ms == 0 || e.reconcile_interval_secs == 0 || e.event_poll_interval_ms == 0
        {
            return invalid("execution timeouts and intervals must be non-zero");
        }
        if e.max_concurrent_broker_calls == 0 || e.cas_max_attempts == 0 {
            return invalid("execution.max_concurrent_broker_calls and cas_max_attempts must be non-zero");
        }
        if e.worker_tick_capacity == 0 || e.max_signal_age_secs == 0 {
            return invalid("execution.worker_tick_capacity and max_signal_age_secs must be non-zero");
        }

        let r = &self.risk;
        if !(r.position_notional > 0.0) || r.max_open_positions == 0 {
            return invalid("risk.position_notional and max_open_positions must be positive");
        }
        if !(r.stop_loss_pct > 0.0 && r.stop_loss_pct < 1.0) || !(r.take_profit_pct > 0.0) {
            return invalid("risk.stop_loss_pct must be in (0, 1) and take_profit_pct positive");
        }
        if !(r.second_take_profit_pct > r.take_profit_pct) {
            return invalid("risk.second_take_profit_pct must be beyond take_profit_pct");
        }
        let fraction_ok = |f: f64| f > 0.0 && f <= 1.0;
        if !fraction_ok(r.first_target_fraction) || !fraction_ok(r.second_target_fraction) {
            return invalid("risk target fractions must be in (0, 1]");
        }
        if !(r.trailing_stop_pct > 0.0 && r.trailing_stop_pct < 1.0) {
            return invalid("risk.trailing_stop_pct must be in (0, 1)");
        }

        if self.store.kind == StoreKind::Postgres && self.store.database_url.is_none() {
            return invalid("store.database_url (or DATABASE_URL) is required for postgres");
        }
        if self.broker.kind == BrokerKind::Rest {
            if self.broker.base_url.is_none() {
                return invalid("broker.base_url is required for the rest broker");
            }
            if self.broker.requests_per_second == 0 {
                return invalid("broker.requests_per_second must be non-zero");
            }
        }

        Ok(())
    }

    pub fn instrument(&self, id: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.id == id)
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EngineConfig {
        EngineConfig {
            store: StoreConfig {
                kind: StoreKind::Memory,
                ..Default::default()
            },
            instruments: vec![Instrument {
                id: "DOGE/USDT".to_string(),
                tick_size: 0.0001,
                min_order_size: 1.0,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_empty_instruments_rejected() {
        let mut config = valid_config();
        config.instruments.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one instrument"));
    }

    #[test]
    fn test_duplicate_instrument_rejected() {
        let mut config = valid_config();
        config.instruments.push(config.instruments[0].clone());
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut config = valid_config();
        config.store.kind = StoreKind::Postgres;
        assert!(config.validate().is_err());

        config.store.database_url = Some("postgres://localhost/breakout_bot".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rest_broker_requires_base_url() {
        let mut config = valid_config();
        config.broker.kind = BrokerKind::Rest;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_target_settings_checked() {
        let mut config = valid_config();
        config.risk.second_take_profit_pct = config.risk.take_profit_pct;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.risk.first_target_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.execution.worker_tick_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lookback_too_short() {
        let mut config = valid_config();
        config.detector.lookback = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        // No file and no instruments -> defaults load but fail validation
        let result = EngineConfig::load("does-not-exist-breakout.toml");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
