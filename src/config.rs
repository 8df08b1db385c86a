// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Options recognised when a connection is opened. They can be built in code
//! or loaded from environment variables (`HEARTBEAT_INTERVAL`,
//! `AUTO_RECONNECT`, `PREFETCH_COUNT`, `CHANNEL_MAX`, `CONNECTION_NAME`),
//! falling back to the defaults for anything not set.
//!
//! The heartbeat interval and the reconnect flag are recorded for a transport
//! collaborator; the in-memory engine has no connection to keep alive.

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 60;
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Heartbeat interval in seconds.
    pub heartbeat_interval: u64,
    pub auto_reconnect: bool,
    /// Prefetch limit of the consumers created on new channels, 0 means unlimited.
    pub prefetch_count: u16,
    /// Highest channel number the connection hands out, 0 means unlimited.
    pub channel_max: u16,
    pub connection_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            auto_reconnect: true,
            prefetch_count: 0,
            channel_max: DEFAULT_CHANNEL_MAX,
            connection_name: None,
        }
    }
}

impl ConnectionConfig {
    /// Loads the configuration from unprefixed environment variables.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::load(Environment::default())
    }

    /// Loads the configuration from environment variables such as
    /// `{prefix}_PREFETCH_COUNT`.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, AmqpError> {
        Self::load(Environment::with_prefix(prefix))
    }

    fn load(source: Environment) -> Result<Self, AmqpError> {
        Config::builder()
            .add_source(source.try_parsing(true))
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load connection config");
                AmqpError::ConfigError(err.to_string())
            })
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    pub fn with_heartbeat_interval(mut self, seconds: u64) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Highest usable channel number.
    pub(crate) fn max_channel_number(&self) -> u16 {
        match self.channel_max {
            0 => u16::MAX,
            max => max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_apply_when_nothing_is_set() {
        temp_env::with_vars_unset(
            [
                "ENGINE_HEARTBEAT_INTERVAL",
                "ENGINE_AUTO_RECONNECT",
                "ENGINE_PREFETCH_COUNT",
                "ENGINE_CHANNEL_MAX",
                "ENGINE_CONNECTION_NAME",
            ],
            || {
                let cfg = ConnectionConfig::from_env_with_prefix("ENGINE").unwrap();
                assert_eq!(cfg, ConnectionConfig::default());
                assert_eq!(cfg.heartbeat(), Duration::from_secs(60));
            },
        );
    }

    #[test]
    #[serial]
    fn values_are_read_from_the_environment() {
        temp_env::with_vars(
            [
                ("ENGINE_HEARTBEAT_INTERVAL", Some("10")),
                ("ENGINE_AUTO_RECONNECT", Some("false")),
                ("ENGINE_PREFETCH_COUNT", Some("5")),
                ("ENGINE_CONNECTION_NAME", Some("orders-service")),
            ],
            || {
                let cfg = ConnectionConfig::from_env_with_prefix("ENGINE").unwrap();

                assert_eq!(cfg.heartbeat_interval, 10);
                assert!(!cfg.auto_reconnect);
                assert_eq!(cfg.prefetch_count, 5);
                assert_eq!(cfg.channel_max, DEFAULT_CHANNEL_MAX);
                assert_eq!(cfg.connection_name.as_deref(), Some("orders-service"));
            },
        );
    }

    #[test]
    #[serial]
    fn invalid_values_are_reported() {
        temp_env::with_var("ENGINE_PREFETCH_COUNT", Some("plenty"), || {
            assert!(matches!(
                ConnectionConfig::from_env_with_prefix("ENGINE"),
                Err(AmqpError::ConfigError(_))
            ));
        });
    }

    #[test]
    fn zero_channel_max_means_unlimited() {
        let cfg = ConnectionConfig::default().with_channel_max(0);
        assert_eq!(cfg.max_channel_number(), u16::MAX);
    }
}
