//! Host bridge configuration

use std::time::Duration;

use rtbridge_core::{BridgeError, BridgeResult, Version};
use serde::{Deserialize, Deserializer};

use crate::LogConfig;

/// Upper bound on a single push into the hosted runtime.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Host bridge configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Timeout for each policy, quote policy and block push, e.g. `"10s"`
    #[serde(deserialize_with = "de_duration")]
    pub notify_timeout: Duration,
    /// Version activated at provisioning; the highest provisioned version when unset
    #[serde(deserialize_with = "de_version")]
    pub default_version: Option<Version>,
    pub log: LogConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            default_version: None,
            log: LogConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn from_json_str(raw: &str) -> BridgeResult<Self> {
        let config: HostConfig =
            serde_json::from_str(raw).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.notify_timeout.is_zero() {
            return Err(BridgeError::Config("notify_timeout must be non-zero".into()));
        }
        Ok(())
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn with_default_version(mut self, version: Version) -> Self {
        self.default_version = Some(version);
        self
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn de_version<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Version>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    raw.map(|v| v.parse::<Version>().map_err(serde::de::Error::custom))
        .transpose()
}
