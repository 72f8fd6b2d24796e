//! Environment-driven engine configuration

use config::{Config, Environment};
use serde::Deserialize;

use crate::errors::EngineResult;

/// Engine settings, read from the process environment.
///
/// Every option has a default except `ENCRYPTION_KEY`, which must be set
/// before users can store exchange credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// SQLite database location
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Exchange REST endpoint
    #[serde(default = "default_exchange_base_url")]
    pub exchange_base_url: String,

    /// Hex-encoded 32-byte key for credential encryption at rest
    #[serde(default)]
    pub encryption_key: String,

    /// Monitor poll interval, seconds
    #[serde(default = "default_order_check_interval")]
    pub order_check_interval: u64,

    /// Health checker interval, seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Upper bound on range-grid level count
    #[serde(default = "default_max_grid_levels")]
    pub max_grid_levels: u32,

    /// Lower bound on range-grid level count (even)
    #[serde(default = "default_min_grid_levels")]
    pub min_grid_levels: u32,

    /// Lower bound on range-grid investment, in quote currency
    #[serde(default = "default_min_investment_usdt")]
    pub min_investment_usdt: u64,

    /// Profit milestone granularity, percent
    #[serde(default = "default_profit_notify_percent")]
    pub profit_notify_percent: u32,

    /// env_logger filter
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_database_url() -> String {
    "sqlite://gridcore.db".to_string()
}

fn default_exchange_base_url() -> String {
    "https://api.mexc.com".to_string()
}

fn default_order_check_interval() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    300
}

fn default_max_grid_levels() -> u32 {
    50
}

fn default_min_grid_levels() -> u32 {
    4
}

fn default_min_investment_usdt() -> u64 {
    50
}

fn default_profit_notify_percent() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// Variables map one-to-one onto field names, upper-cased:
    /// `ORDER_CHECK_INTERVAL`, `HEALTH_CHECK_INTERVAL`, `MAX_GRID_LEVELS`,
    /// `MIN_GRID_LEVELS`, `MIN_INVESTMENT_USDT`, `PROFIT_NOTIFY_PERCENT`,
    /// `ENCRYPTION_KEY`, `DATABASE_URL`, `EXCHANGE_BASE_URL`, `LOG_LEVEL`.
    pub fn from_env() -> EngineResult<Self> {
        let cfg = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            exchange_base_url: default_exchange_base_url(),
            encryption_key: String::new(),
            order_check_interval: default_order_check_interval(),
            health_check_interval: default_health_check_interval(),
            max_grid_levels: default_max_grid_levels(),
            min_grid_levels: default_min_grid_levels(),
            min_investment_usdt: default_min_investment_usdt(),
            profit_notify_percent: default_profit_notify_percent(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.order_check_interval, 10);
        assert_eq!(settings.health_check_interval, 300);
        assert_eq!(settings.max_grid_levels, 50);
        assert_eq!(settings.min_grid_levels, 4);
        assert_eq!(settings.profit_notify_percent, 5);
        assert!(settings.encryption_key.is_empty());
    }
}
