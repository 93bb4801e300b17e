//! Configuration for the sync client.

use std::env;
use std::time::Duration;

/// Tunables for the queue, coordinator, cache and transport.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the sync server
    pub endpoint: String,
    /// Delivery attempts before an operation is dead-lettered
    pub max_retries: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_cap_ms: u64,
    /// Attempts per transaction step
    pub step_attempts: u32,
    /// Fixed delay between step attempts
    pub step_retry_delay_ms: u64,
    /// Cache sweep interval
    pub sweep_interval_ms: u64,
    /// How long completed transactions are retained for diagnostics
    pub txn_retention_ms: u64,
    /// How long resolved conflicts stay in the archive
    pub conflict_retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000".to_string(),
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            step_attempts: 3,
            step_retry_delay_ms: 200,
            sweep_interval_ms: 60_000,
            txn_retention_ms: 60 * 60 * 1000,
            conflict_retention_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(endpoint) = env::var("SYNC_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config.max_retries = parse_var("SYNC_MAX_RETRIES", config.max_retries)?;
        config.backoff_base_ms = parse_var("SYNC_BACKOFF_BASE_MS", config.backoff_base_ms)?;
        config.backoff_cap_ms = parse_var("SYNC_BACKOFF_CAP_MS", config.backoff_cap_ms)?;
        config.sweep_interval_ms = parse_var("SYNC_SWEEP_INTERVAL_MS", config.sweep_interval_ms)?;

        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn step_retry_delay(&self) -> Duration {
        Duration::from_millis(self.step_retry_delay_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SyncConfig::default();
        assert!(config.max_retries > 0);
        assert!(config.backoff_cap_ms >= config.backoff_base_ms);
        assert_eq!(config.sweep_interval(), Duration::from_millis(60_000));
    }
}
