//! Session configuration. Durations are milliseconds in JSON and env form.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Room joined when the caller does not name one.
pub const DEFAULT_ROOM_ID: &str = "test-room-id";

/// Device enumeration retries before an empty list is accepted as final.
pub const DEFAULT_DEVICE_RETRY_LIMIT: u32 = 10;

pub const DEFAULT_DEVICE_RETRY_DELAY: Duration = Duration::from_secs(3);

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Payload written to the transport on every keepalive tick.
pub const DEFAULT_KEEPALIVE_MESSAGE: &str = "keepalive";

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(250);

/// Top-level configuration for a [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Mesh room joined by [`Session::join`](crate::session::Session::join)
    pub room_id: String,

    pub devices: DeviceConfig,

    pub channel: ChannelConfig,

    pub capture: CaptureConfig,
}

/// Device enumeration retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Retries issued while both device lists stay empty
    pub retry_limit: u32,

    /// Fixed delay between two enumeration attempts
    #[serde(with = "millis")]
    pub retry_delay: Duration,
}

/// Message channel keepalive and reconnect policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,

    pub keepalive_message: String,

    /// Consecutive reconnects after an unrequested close (0 disables)
    pub reconnect_attempts: u32,

    #[serde(with = "millis")]
    pub reconnect_delay: Duration,

    /// Upper bound of the random delay added to each reconnect
    #[serde(with = "millis")]
    pub reconnect_jitter: Duration,
}

/// Local capture policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Stop the current capture before requesting its replacement.
    ///
    /// Needed on platforms that refuse to open a device that is still held by
    /// another stream. A failed replacement then leaves no local stream.
    pub release_before_acquire: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_id: DEFAULT_ROOM_ID.to_string(),
            devices: DeviceConfig::default(),
            channel: ChannelConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_DEVICE_RETRY_LIMIT,
            retry_delay: DEFAULT_DEVICE_RETRY_DELAY,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_message: DEFAULT_KEEPALIVE_MESSAGE.to_string(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    /// Load configuration from `MEETS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a variable map (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(room_id) = vars.get("MEETS_ROOM_ID") {
            config.room_id = room_id.clone();
        }
        if let Some(limit) = parse_var(vars, "MEETS_DEVICE_RETRY_LIMIT")? {
            config.devices.retry_limit = limit;
        }
        if let Some(ms) = parse_var(vars, "MEETS_DEVICE_RETRY_DELAY_MS")? {
            config.devices.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(vars, "MEETS_KEEPALIVE_INTERVAL_MS")? {
            config.channel.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(message) = vars.get("MEETS_KEEPALIVE_MESSAGE") {
            config.channel.keepalive_message = message.clone();
        }
        if let Some(attempts) = parse_var(vars, "MEETS_RECONNECT_ATTEMPTS")? {
            config.channel.reconnect_attempts = attempts;
        }
        if let Some(ms) = parse_var(vars, "MEETS_RECONNECT_DELAY_MS")? {
            config.channel.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(release) = parse_var(vars, "MEETS_RELEASE_BEFORE_ACQUIRE")? {
            config.capture.release_before_acquire = release;
        }

        Ok(config)
    }

    /// Set the room to join
    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self
    }

    /// Set the device enumeration retry policy
    pub fn device_retries(mut self, limit: u32, delay: Duration) -> Self {
        self.devices.retry_limit = limit;
        self.devices.retry_delay = delay;
        self
    }

    /// Set the keepalive interval
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.channel.keepalive_interval = interval;
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.channel.reconnect_attempts = attempts;
        self.channel.reconnect_delay = delay;
        self
    }

    /// Release the current capture before acquiring its replacement
    pub fn release_before_acquire(mut self, release: bool) -> Self {
        self.capture.release_before_acquire = release;
        self
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            }),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
