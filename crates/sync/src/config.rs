//! Sync engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Optional
//! - `COMANDA_ORDERS_COLLECTION` - Orders collection name (default: orders)
//! - `COMANDA_CARTS_COLLECTION` - Carts collection name (default: carts)
//! - `COMANDA_MERGE_POLICY` - `secondary_wins` or `newest_update` (default: `secondary_wins`)
//! - `COMANDA_BACKFILL_TIMEOUT_SECS` - Bound on the backfill's one-shot read
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment tag

use std::time::Duration;

use thiserror::Error;

use crate::aggregator::MergePolicy;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Collection holding order documents
    pub orders_collection: String,
    /// Collection holding cart documents
    pub carts_collection: String,
    /// Conflict rule for orders reachable through both identity keys
    pub merge_policy: MergePolicy,
    /// Optional timeout for the backfill's one-shot read
    pub backfill_timeout: Option<Duration>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment tag
    pub sentry_environment: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            orders_collection: "orders".to_string(),
            carts_collection: "carts".to_string(),
            merge_policy: MergePolicy::default(),
            backfill_timeout: None,
            sentry_dsn: None,
            sentry_environment: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is present but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let orders_collection =
            non_empty(&lookup, "COMANDA_ORDERS_COLLECTION")?.unwrap_or(defaults.orders_collection);
        let carts_collection =
            non_empty(&lookup, "COMANDA_CARTS_COLLECTION")?.unwrap_or(defaults.carts_collection);

        let merge_policy = match lookup("COMANDA_MERGE_POLICY") {
            Some(raw) => raw.parse::<MergePolicy>().map_err(|e| {
                ConfigError::InvalidEnvVar("COMANDA_MERGE_POLICY".to_string(), e)
            })?,
            None => defaults.merge_policy,
        };

        let backfill_timeout = lookup("COMANDA_BACKFILL_TIMEOUT_SECS")
            .map(|raw| parse_timeout("COMANDA_BACKFILL_TIMEOUT_SECS", &raw))
            .transpose()?;

        Ok(Self {
            orders_collection,
            carts_collection,
            merge_policy,
            backfill_timeout,
            sentry_dsn: lookup("SENTRY_DSN").filter(|v| !v.is_empty()),
            sentry_environment: lookup("SENTRY_ENVIRONMENT").filter(|v| !v.is_empty()),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get an optional variable, rejecting a present-but-blank value.
fn non_empty(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<String>, ConfigError> {
    match lookup(key) {
        Some(value) if value.trim().is_empty() => Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            "cannot be blank".to_string(),
        )),
        Some(value) => Ok(Some(value.trim().to_string())),
        None => Ok(None),
    }
}

/// Parse a positive number of seconds.
fn parse_timeout(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let secs = raw
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))?;
    if secs == 0 {
        return Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}
