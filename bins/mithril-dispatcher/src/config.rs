// Dispatcher configuration from the environment
use mithril_common::config::{self as env, ConfigError};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub nats_url: String,
    pub request_timeout: Duration,
    pub metrics_addr: String,
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let timeout_ms = env::env_parse("REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT_MS".to_string(),
                value: "0".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        Ok(Self {
            nats_url: env::nats_url(),
            request_timeout: Duration::from_millis(timeout_ms),
            metrics_addr: env::env_or("METRICS_ADDR", "0.0.0.0:9100"),
        })
    }
}
