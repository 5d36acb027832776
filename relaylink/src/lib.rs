//! Resilient control link to a single remote relay device.
//!
//! This crate keeps an authenticated session to one stateful device alive
//! over an unreliable network and exposes two idempotent operations, reading
//! and writing the device state, with bounded latency and exactly-one-response
//! delivery. It provides:
//! - Connection establishment with exponential backoff and a retry cap
//! - Credential lifecycle management with out-of-band token refresh
//! - Single-flight login and refresh: concurrent callers share one attempt
//! - Strict FIFO serialization of all device operations
//! - Per-operation deadlines that stop the wait without cancelling the
//!   in-flight call
//! - A failure escalation policy that decides the restart scope from the
//!   deployment topology
//!
//! The device wire protocol itself is not implemented here; the host supplies
//! it through the [`DeviceTransport`] trait.

pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod escalation;
pub mod session;
pub mod transport;

mod context;
mod refresh;
mod scheduler;

pub use config::RelayConfig;
pub use controller::RelayController;
pub use credential::{Credential, CredentialMode};
pub use error::{
    ConfigError, LinkError, RefreshError, SessionError, TransportError,
};
pub use escalation::{
    EscalationAction, EscalationPolicy, RuntimeContext, EXIT_RESTART_HOST, EXIT_RESTART_INSTANCE,
};
pub use session::{BackoffConfig, SessionState};
pub use transport::DeviceTransport;
