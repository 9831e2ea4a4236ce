use std::time::Duration;

use secrecy::Secret;

use crate::services::{LockStrategy, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<Secret<String>>,
    pub host: String,
    pub port: u16,

    pub storage: StorageBackend,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,

    // Issuance
    pub lock_strategy: LockStrategy,
    pub retry_policy: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Self::from_config(&config)
    }

    fn from_config(config: &config::Config) -> Result<Self, config::ConfigError> {
        let storage = match config.get::<String>("storage") {
            Ok(value) => parse_storage(&value)?,
            Err(_) => StorageBackend::Postgres,
        };

        let database_url = config.get::<String>("database_url").ok().map(Secret::new);
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(config::ConfigError::Message(
                "database_url is required when storage is postgres".to_string(),
            ));
        }

        let lock_strategy = match config.get::<String>("lock_strategy") {
            Ok(value) => value
                .parse::<LockStrategy>()
                .map_err(config::ConfigError::Message)?,
            Err(_) => LockStrategy::Pessimistic,
        };

        let max_attempts = config
            .get::<u32>("retry_max_attempts")
            .unwrap_or(crate::services::retry::DEFAULT_MAX_ATTEMPTS);
        let retry_policy = RetryPolicy::new(max_attempts).ok_or_else(|| {
            config::ConfigError::Message("retry_max_attempts must be at least 1".to_string())
        })?;

        Ok(Self {
            database_url,
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port").unwrap_or(8080),

            storage,
            db_max_connections: config.get("db_max_connections").unwrap_or(20),
            db_acquire_timeout: Duration::from_secs(
                config.get("db_acquire_timeout_secs").unwrap_or(60),
            ),

            lock_strategy,
            retry_policy,
        })
    }
}

fn parse_storage(value: &str) -> Result<StorageBackend, config::ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "postgres" => Ok(StorageBackend::Postgres),
        "memory" => Ok(StorageBackend::Memory),
        other => Err(config::ConfigError::Message(format!(
            "unknown storage backend: {}",
            other
        ))),
    }
}
