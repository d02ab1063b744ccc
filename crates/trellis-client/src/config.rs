//! Client configuration.
//!
//! Programmatic defaults, plus a TOML loader (raw structs with `Option`
//! fields, validated into the typed config).  Durations use milliseconds in
//! TOML.

use crate::reconnect::Backoff;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    /// Transport loss is terminal: pending and future operations fail with
    /// `CONNECTION_LOST`.
    Disabled,
    Enabled(Backoff),
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Enabled(Backoff::default())
    }
}

impl ReconnectPolicy {
    pub fn enabled(&self) -> bool {
        matches!(self, ReconnectPolicy::Enabled(_))
    }

    pub(crate) fn backoff(&self) -> Option<&Backoff> {
        match self {
            ReconnectPolicy::Enabled(b) => Some(b),
            ReconnectPolicy::Disabled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reconnect: ReconnectPolicy,
    /// Inactivity window after the last hydration hit before the cache
    /// drops itself.
    pub hydration_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            reconnect: ReconnectPolicy::default(),
            hydration_timeout: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization (Option fields, validated into ClientConfig)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    hydration_timeout_ms: Option<u64>,
    reconnect: Option<RawReconnect>,
}

#[derive(Debug, Deserialize)]
struct RawReconnect {
    enabled: Option<bool>,
    max_retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parsing config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ClientConfig {
    /// Load from a TOML string, filling unset fields with defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
        let raw: RawConfig =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut cfg = ClientConfig::default();
        if let Some(ms) = raw.hydration_timeout_ms {
            cfg.hydration_timeout = Duration::from_millis(ms);
        }
        if let Some(reconnect) = raw.reconnect {
            if reconnect.enabled == Some(false) {
                cfg.reconnect = ReconnectPolicy::Disabled;
            } else {
                let mut backoff = Backoff::default();
                if let Some(n) = reconnect.max_retries {
                    backoff.max_retries = n;
                }
                if let Some(ms) = reconnect.initial_delay_ms {
                    backoff.initial_delay = Duration::from_millis(ms);
                }
                if let Some(ms) = reconnect.max_delay_ms {
                    backoff.max_delay = Duration::from_millis(ms);
                }
                if let Some(m) = reconnect.multiplier {
                    if m < 1.0 {
                        return Err(ConfigError::Invalid("multiplier must be >= 1.0".into()));
                    }
                    backoff.multiplier = m;
                }
                cfg.reconnect = ReconnectPolicy::Enabled(backoff);
            }
        }
        Ok(cfg)
    }
}
