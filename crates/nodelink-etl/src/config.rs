//! Database configuration

use nodelink_common::{EtlError, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/nodelink";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DbConfig {
    /// Load configuration from environment and defaults.
    ///
    /// `NODELINK_DATABASE_URL` wins over `DATABASE_URL`; the remaining pool
    /// knobs come from `NODELINK_DB_*` variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let url = std::env::var("NODELINK_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let config = DbConfig {
            url,
            max_connections: env_u32("NODELINK_DB_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS)?,
            min_connections: env_u32("NODELINK_DB_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS)?,
            connect_timeout_secs: env_u64(
                "NODELINK_DB_CONNECT_TIMEOUT_SECS",
                DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            )?,
            idle_timeout_secs: env_u64(
                "NODELINK_DB_IDLE_TIMEOUT_SECS",
                DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration directly from a connection URL, keeping the
    /// default pool settings.
    pub fn with_url(url: impl Into<String>) -> Self {
        DbConfig {
            url: url.into(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(EtlError::Config("database URL must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(EtlError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(EtlError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Open a connection pool with the configured limits
    pub async fn pool(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .connect(&self.url)
            .await
            .map_err(|e| EtlError::Database(e.to_string()))
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EtlError::Config(format!("{} must be an integer, got {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EtlError::Config(format!("{} must be an integer, got {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_url_keeps_pool_defaults() {
        let config = DbConfig::with_url("postgresql://localhost/test");
        assert_eq!(config.max_connections, DEFAULT_DATABASE_MAX_CONNECTIONS);
        assert_eq!(config.min_connections, DEFAULT_DATABASE_MIN_CONNECTIONS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_inverted_pool_bounds() {
        let mut config = DbConfig::with_url("postgresql://localhost/test");
        config.min_connections = 20;
        assert!(matches!(config.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn validation_rejects_empty_url() {
        let config = DbConfig::with_url("");
        assert!(matches!(config.validate(), Err(EtlError::Config(_))));
    }
}
