//! Error types for the relay link.
//!
//! The taxonomy follows the failure classes the engine actually distinguishes:
//! credential rejections (recoverable via a token refresh), network failures
//! (recoverable via retry with backoff), refresh failures and login exhaustion
//! (terminal, escalation candidates), and the caller-facing timeout and
//! shutdown errors that never touch internal state.

use std::time::Duration;
use thiserror::Error;

/// Status code devices report when the current token is rejected.
pub const CREDENTIAL_REJECTED_STATUS: u16 = 401;

/// Message fragments older firmware uses to report a token rejection without
/// setting the status code. Matched case-insensitively.
pub const CREDENTIAL_MESSAGE_VARIANTS: &[&str] =
    &["invalid token", "token expired", "please login first"];

/// Errors reported by the device transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The device rejected the current credential.
    #[error("credential rejected by device ({status}): {message}")]
    Credential { status: u16, message: String },

    /// Transport-level failure: unreachable host, dropped connection, refused
    /// socket.
    #[error("network error: {0}")]
    Network(String),

    /// The device answered, but with an error of its own.
    #[error("device error {status}: {message}")]
    Device { status: u16, message: String },
}

impl TransportError {
    /// Whether this failure means the current credential was rejected.
    ///
    /// The structured `Credential` variant is authoritative. `Device` and
    /// `Network` errors are additionally matched against the status code and
    /// message fragments in [`CREDENTIAL_MESSAGE_VARIANTS`], so transports
    /// that only surface free-form device messages still classify correctly.
    pub fn is_credential_class(&self) -> bool {
        match self {
            TransportError::Credential { .. } => true,
            TransportError::Device { status, message } => {
                *status == CREDENTIAL_REJECTED_STATUS || matches_credential_message(message)
            }
            TransportError::Network(message) => matches_credential_message(message),
        }
    }
}

fn matches_credential_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CREDENTIAL_MESSAGE_VARIANTS.iter().any(|v| lower.contains(v))
}

/// Terminal session (login) errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// All configured login attempts failed.
    #[error("login failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The device rejected a credential that was just refreshed. Retrying
    /// further cannot help; the device likely needs reconfiguration.
    #[error("credential rejected again after refresh: {0}")]
    CredentialRejected(String),

    /// Shutdown was requested while the login sequence was running.
    #[error("login aborted: shutdown requested")]
    Shutdown,
}

/// Out-of-band credential refresh errors.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    /// The side channel answered but had no token to give out.
    #[error("out-of-band channel returned no credential")]
    Empty,

    /// The side channel itself failed.
    #[error("credential fetch failed: {0}")]
    Fetch(String),

    /// The instance is configured with a fixed credential; there is nothing
    /// to refresh.
    #[error("dynamic credential refresh is disabled")]
    Disabled,
}

/// Caller-facing error for `read_state` / `write_state`.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error(transparent)]
    Session(SessionError),

    #[error(transparent)]
    Refresh(RefreshError),

    #[error(transparent)]
    Transport(TransportError),

    /// The operation did not complete before its deadline. The underlying
    /// transport call keeps running in the background; its eventual outcome
    /// is logged but no longer delivered.
    #[error("operation '{operation}' timed out after {deadline:?}")]
    Timeout {
        operation: &'static str,
        deadline: Duration,
    },

    /// The link is shutting down; no further operations are accepted.
    #[error("link is shutting down")]
    Shutdown,
}

impl LinkError {
    /// Whether the caller can reasonably retry the same operation later.
    ///
    /// Network failures and timeouts are temporary. Credential rejections,
    /// device errors, refresh failures and exhausted logins mean the device
    /// likely needs attention or reconfiguration.
    pub fn is_transient(&self) -> bool {
        match self {
            LinkError::Timeout { .. } => true,
            LinkError::Transport(TransportError::Network(_)) => true,
            LinkError::Transport(_) => false,
            LinkError::Session(_) | LinkError::Refresh(_) | LinkError::Shutdown => false,
        }
    }
}

impl From<SessionError> for LinkError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Shutdown => LinkError::Shutdown,
            other => LinkError::Session(other),
        }
    }
}

impl From<RefreshError> for LinkError {
    fn from(err: RefreshError) -> Self {
        LinkError::Refresh(err)
    }
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        LinkError::Transport(err)
    }
}

/// Configuration validation errors, surfaced at construction.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("device address must not be empty")]
    EmptyAddress,

    #[error("fixed credential must not be empty")]
    EmptyCredential,

    #[error("max_login_attempts must be at least 1")]
    ZeroAttempts,

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("backoff_cap_ms must not be below initial_backoff_ms")]
    BackoffCapBelowInitial,
}
