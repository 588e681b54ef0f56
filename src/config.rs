//! Configuration management for the budget guardian.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `DATA_DIR` - Optional. Where budgets and the cost ledger are stored. Defaults to `./.budget-guardian`.
//! - `BUDGET_STORE` - Optional. `sqlite` (default), `file` or `memory`.
//! - `LEDGER_STORE` - Optional. `sqlite` (default) or `memory`.
//! - `LEDGER_TIMEOUT_MS` - Optional. Timeout for reading today's spend. Defaults to `2000`.
//! - `LEDGER_FAILURE_MODE` - Optional. `open` (default, allow on ledger failure) or `closed`.
//! - `PRICING_URL` - Optional. OpenRouter-compatible models endpoint used by pricing sync.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::budget::{BudgetStoreType, LedgerFailureMode};
use crate::ledger::CostLedgerType;
use crate::pricing::DEFAULT_PRICING_URL;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory for budget and ledger storage
    pub data_dir: PathBuf,

    pub budget_store: BudgetStoreType,

    pub ledger_store: CostLedgerType,

    /// Upper bound on a single "spend today" ledger read
    pub ledger_timeout: Duration,

    /// Decision used when the ledger cannot be read
    pub ledger_failure_mode: LedgerFailureMode,

    /// Models endpoint for pricing sync
    pub pricing_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            data_dir: PathBuf::from(".budget-guardian"),
            budget_store: BudgetStoreType::default(),
            ledger_store: CostLedgerType::default(),
            ledger_timeout: Duration::from_millis(2000),
            ledger_failure_mode: LedgerFailureMode::default(),
            pricing_url: DEFAULT_PRICING_URL.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `PORT` or `LEDGER_TIMEOUT_MS`
    /// is not a number.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);

        let port = match lookup("PORT") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?,
            None => defaults.port,
        };

        let data_dir = lookup("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let budget_store = lookup("BUDGET_STORE")
            .map(|v| BudgetStoreType::from_str(&v))
            .unwrap_or(defaults.budget_store);

        let ledger_store = lookup("LEDGER_STORE")
            .map(|v| CostLedgerType::from_str(&v))
            .unwrap_or(defaults.ledger_store);

        let ledger_timeout = match lookup("LEDGER_TIMEOUT_MS") {
            Some(v) => Duration::from_millis(v.trim().parse().map_err(|e| {
                ConfigError::InvalidValue("LEDGER_TIMEOUT_MS".to_string(), format!("{}", e))
            })?),
            None => defaults.ledger_timeout,
        };

        let ledger_failure_mode = lookup("LEDGER_FAILURE_MODE")
            .map(|v| LedgerFailureMode::from_str(&v))
            .unwrap_or(defaults.ledger_failure_mode);

        let pricing_url = lookup("PRICING_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.pricing_url);

        Ok(Self {
            host,
            port,
            data_dir,
            budget_store,
            ledger_store,
            ledger_timeout,
            ledger_failure_mode,
            pricing_url,
        })
    }
}
