//! Configuration management for the learning sync server

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::{CoordinatorOptions, DEFAULT_MAX_PULL_BATCH};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Longest wait for a user's exclusive version lock
    pub lock_timeout_ms: u64,
    /// Period of the background reconciliation pass; 0 disables it
    pub reconcile_interval_secs: u64,
    pub max_pull_batch: usize,
    /// Lag in versions after which pulls ask for a full resync
    pub resync_threshold: Option<u64>,
}

impl SyncConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            max_pull_batch: self.max_pull_batch.max(1),
            resync_threshold: self.resync_threshold,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./learning-sync.db".to_string(),
                max_connections: 5,
            },
            sync: SyncConfig {
                lock_timeout_ms: 5000,
                reconcile_interval_secs: 300,
                max_pull_batch: DEFAULT_MAX_PULL_BATCH,
                resync_threshold: None,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_var(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                ),
            },
            sync: SyncConfig {
                lock_timeout_ms: parse_var("SYNC_LOCK_TIMEOUT_MS", defaults.sync.lock_timeout_ms),
                reconcile_interval_secs: parse_var(
                    "SYNC_RECONCILE_INTERVAL_SECS",
                    defaults.sync.reconcile_interval_secs,
                ),
                max_pull_batch: parse_var("SYNC_MAX_PULL_BATCH", defaults.sync.max_pull_batch),
                resync_threshold: env::var("SYNC_RESYNC_THRESHOLD")
                    .ok()
                    .and_then(|raw| parse_value("SYNC_RESYNC_THRESHOLD", &raw)),
            },
        }
    }
}

/// Read a numeric variable, falling back to `default` when unset or malformed
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| parse_value(name, &raw))
        .unwrap_or(default)
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring malformed {}={:?}, using default", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.url, "sqlite:./learning-sync.db");
        assert_eq!(config.sync.lock_timeout(), Duration::from_millis(5000));
        assert_eq!(
            config.sync.reconcile_interval(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.sync.resync_threshold, None);
    }

    #[test]
    fn test_zero_interval_disables_reconciler() {
        let sync = SyncConfig {
            reconcile_interval_secs: 0,
            ..Config::default().sync
        };
        assert_eq!(sync.reconcile_interval(), None);
    }

    #[test]
    fn test_malformed_value_falls_back() {
        assert_eq!(parse_value::<u64>("X", "12"), Some(12));
        assert_eq!(parse_value::<u64>("X", "twelve"), None);
        assert_eq!(parse_value::<u16>("X", "70000"), None);
    }

    #[test]
    fn test_pull_batch_never_zero() {
        let sync = SyncConfig {
            max_pull_batch: 0,
            ..Config::default().sync
        };
        assert_eq!(sync.coordinator_options().max_pull_batch, 1);
    }
}
