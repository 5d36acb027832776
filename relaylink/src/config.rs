//! Instance configuration.
//!
//! The host loads and deserializes this; the engine only validates it at
//! construction and reads the resolved values.

use std::time::Duration;

use serde::Deserialize;

use crate::credential::CredentialMode;
use crate::error::ConfigError;

fn default_max_login_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_refresh_interval_ms() -> u64 {
    300_000
}

fn default_operation_timeout_ms() -> u64 {
    5000
}

/// Configuration for one relay instance.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Device address. Opaque to the engine; the transport interprets it.
    pub address: String,

    /// Fixed operator token or dynamic out-of-band retrieval.
    pub credential: CredentialMode,

    /// Login attempts before the session is declared failed.
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,

    /// Delay before the second login attempt; doubles on each failure.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff delay.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Period of the autonomous credential refresh (dynamic mode only).
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Default per-operation deadline.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Restart the whole host process on unrecoverable failures, even when
    /// this instance shares it with others.
    #[serde(default)]
    pub force_restart_on_failure: bool,

    /// Explicit topology override. `None` defers to what the host detected.
    #[serde(default)]
    pub isolated_instance: Option<bool>,
}

impl RelayConfig {
    /// Minimal configuration with all defaults applied.
    pub fn new(address: impl Into<String>, credential: CredentialMode) -> Self {
        RelayConfig {
            address: address.into(),
            credential,
            max_login_attempts: default_max_login_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            force_restart_on_failure: false,
            isolated_instance: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if let CredentialMode::Fixed(token) = &self.credential {
            if token.is_empty() {
                return Err(ConfigError::EmptyCredential);
            }
        }
        if self.max_login_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "initial_backoff_ms",
            });
        }
        if self.backoff_cap_ms < self.initial_backoff_ms {
            return Err(ConfigError::BackoffCapBelowInitial);
        }
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "refresh_interval_ms",
            });
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "operation_timeout_ms",
            });
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}
