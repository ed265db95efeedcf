use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

use crate::capacity::CapacityPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub capacity_policy: CapacityPolicy,
    pub notify_webhook_url: Option<String>,
    pub notify_webhook_token: Option<String>,
    pub notify_timeout: Duration,
    pub notify_max_attempts: usize,
    pub cascade_drain_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let notify_max_attempts: usize = try_load("NOTIFY_MAX_ATTEMPTS", "3")?;
        if notify_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "NOTIFY_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        Ok(Self {
            port: try_load("RUST_PORT", "8080")?,
            database_url: try_load("DATABASE_URL", "sqlite://food.db")?,
            capacity_policy: try_load("CAPACITY_POLICY", "all_or_nothing")?,
            notify_webhook_url: var("NOTIFY_WEBHOOK_URL").filter(|url| !url.trim().is_empty()),
            notify_webhook_token: read_secret("NOTIFY_WEBHOOK_TOKEN"),
            notify_timeout: Duration::from_millis(try_load("NOTIFY_TIMEOUT_MS", "2000")?),
            notify_max_attempts,
            cascade_drain_timeout: Duration::from_millis(try_load("CASCADE_DRAIN_MS", "10000")?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "sqlite::memory:".to_string(),
            capacity_policy: CapacityPolicy::default(),
            notify_webhook_url: None,
            notify_webhook_token: None,
            notify_timeout: Duration::from_secs(2),
            notify_max_attempts: 3,
            cascade_drain_timeout: Duration::from_secs(10),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }
    })
}

/// Docker secret, absent when the file is missing.
fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            info!("No {secret_name} secret: {e}");
        })
        .ok()
        .filter(|secret| !secret.is_empty())
}
