use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    error::DispatchError,
    models::{listener::DebounceConfig, retry::RetryPolicy},
};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DelayStrategy {
    /// Delay queue with per-message expiration dead-lettering to the live exchange.
    #[default]
    Ttl,
    /// `x-delayed-message` exchange from the delayed message exchange plugin.
    Plugin,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub broker_uri: String,
    #[serde(default)]
    pub broker_name_prefix: String,
    #[serde(default = "default_publish_confirm_timeout_ms")]
    pub broker_publish_confirm_timeout_ms: u64,
    #[serde(default)]
    pub broker_delay_strategy: DelayStrategy,
    #[serde(default = "default_publisher_channels")]
    pub broker_publisher_channels: usize,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_debounce_wait_for_ms")]
    pub debounce_default_wait_for_ms: u64,
    #[serde(default = "default_debounce_max_wait_for_ms")]
    pub debounce_default_max_wait_for_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_publish_confirm_timeout_ms() -> u64 {
    5000
}

fn default_publisher_channels() -> usize {
    4
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    1000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_debounce_wait_for_ms() -> u64 {
    5000
}

fn default_debounce_max_wait_for_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults for everything except the broker URI.
    pub fn with_uri(broker_uri: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            broker_name_prefix: String::new(),
            broker_publish_confirm_timeout_ms: default_publish_confirm_timeout_ms(),
            broker_delay_strategy: DelayStrategy::default(),
            broker_publisher_channels: default_publisher_channels(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            debounce_default_wait_for_ms: default_debounce_wait_for_ms(),
            debounce_default_max_wait_for_ms: default_debounce_max_wait_for_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            server_port: default_server_port(),
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if !self.broker_name_prefix.is_empty() && !self.broker_name_prefix.ends_with('.') {
            return Err(DispatchError::Config(format!(
                "name prefix '{}' must end with '.'",
                self.broker_name_prefix
            )));
        }

        if self.broker_publisher_channels == 0 {
            return Err(DispatchError::Config(
                "publisher channel pool cannot be empty".to_string(),
            ));
        }

        self.retry_policy().validate()?;
        self.debounce_config().validate()?;

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay_ms: self.retry_initial_delay_ms,
            multiplier: self.retry_multiplier,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }

    pub fn debounce_config(&self) -> DebounceConfig {
        DebounceConfig {
            wait_for_ms: self.debounce_default_wait_for_ms,
            max_wait_for_ms: self.debounce_default_max_wait_for_ms,
        }
    }

    pub fn publish_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_publish_confirm_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
