//! Server configuration.
//!
//! Programmatic defaults, with an optional TOML loader for deployments that
//! ship a config file.  Timeout fields use milliseconds in TOML; `0`
//! disables the corresponding timer.

use serde::Deserialize;
use std::time::Duration;

/// Resource bounds and timers for one server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Close a connection after this long with no traffic and no pending
    /// operations.  `None` disables the idle timer.
    pub idle_timeout: Option<Duration>,
    /// Lifetime bound on a session's token space (root included); crossing
    /// it closes the connection.
    pub max_tokens: usize,
    /// Concurrent user-code executions per connection; excess work queues.
    pub max_pending_ops: usize,
    /// Unanswered messages per connection; crossing it closes the
    /// connection.
    pub max_queued_ops: usize,
    /// Per-operation wall-clock budget.  `None` disables the timer.
    pub max_operation_timeout: Option<Duration>,
    /// Replace wrapped opaque error messages before they reach the wire.
    pub redact_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            idle_timeout: None,
            max_tokens: 4096,
            max_pending_ops: 16,
            max_queued_ops: 256,
            max_operation_timeout: None,
            redact_errors: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization (Option fields, validated into ServerConfig)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    limits: Option<RawLimits>,
    timeouts: Option<RawTimeouts>,
    errors: Option<RawErrors>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    max_tokens: Option<usize>,
    max_pending_ops: Option<usize>,
    max_queued_ops: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawTimeouts {
    idle_ms: Option<u64>,
    operation_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawErrors {
    redact: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parsing config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Load from a TOML string, filling unset fields with defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
        let raw: RawConfig =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut cfg = ServerConfig::default();

        if let Some(limits) = raw.limits {
            if let Some(n) = limits.max_tokens {
                cfg.max_tokens = n;
            }
            if let Some(n) = limits.max_pending_ops {
                if n == 0 {
                    return Err(ConfigError::Invalid("max_pending_ops must be >= 1".into()));
                }
                cfg.max_pending_ops = n;
            }
            if let Some(n) = limits.max_queued_ops {
                if n == 0 {
                    return Err(ConfigError::Invalid("max_queued_ops must be >= 1".into()));
                }
                cfg.max_queued_ops = n;
            }
        }
        if let Some(timeouts) = raw.timeouts {
            cfg.idle_timeout = timeouts.idle_ms.filter(|&ms| ms > 0).map(Duration::from_millis);
            cfg.max_operation_timeout = timeouts
                .operation_ms
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis);
        }
        if let Some(errors) = raw.errors {
            if let Some(redact) = errors.redact {
                cfg.redact_errors = redact;
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.max_tokens, 4096);
        assert_eq!(cfg.max_pending_ops, 16);
        assert!(cfg.idle_timeout.is_none());
        assert!(cfg.redact_errors);
    }

    #[test]
    fn zero_timeouts_disable_the_timers() {
        let cfg = ServerConfig::from_toml_str(
            "[timeouts]\nidle_ms = 0\noperation_ms = 0\n",
        )
        .unwrap();
        assert!(cfg.idle_timeout.is_none());
        assert!(cfg.max_operation_timeout.is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = ServerConfig::from_toml_str(
            "[limits]\nmax_tokens = 2\nmax_pending_ops = 2\n\n[timeouts]\nidle_ms = 5000\n\n[errors]\nredact = false\n",
        )
        .unwrap();
        assert_eq!(cfg.max_tokens, 2);
        assert_eq!(cfg.max_pending_ops, 2);
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(5)));
        assert!(!cfg.redact_errors);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(ServerConfig::from_toml_str("[limits]\nmax_pending_ops = 0\n").is_err());
    }
}
