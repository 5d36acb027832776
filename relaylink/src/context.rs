//! Per-instance shared context.
//!
//! All components hold this one object instead of ambient module state, so
//! multiple device instances can coexist in one process.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::config::RelayConfig;
use crate::credential::CredentialStore;
use crate::escalation::EscalationPolicy;
use crate::session::SessionState;
use crate::transport::DeviceTransport;

pub(crate) struct LinkShared {
    pub(crate) transport: Arc<dyn DeviceTransport>,
    pub(crate) credentials: CredentialStore,
    pub(crate) escalation: EscalationPolicy,
    pub(crate) config: RelayConfig,
    session_state: Mutex<SessionState>,
    /// Attempt counter of the most recent login sequence.
    login_attempt: AtomicU32,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl LinkShared {
    pub(crate) fn new(
        transport: Arc<dyn DeviceTransport>,
        credentials: CredentialStore,
        escalation: EscalationPolicy,
        config: RelayConfig,
    ) -> Self {
        LinkShared {
            transport,
            credentials,
            escalation,
            config,
            session_state: Mutex::new(SessionState::Disconnected),
            login_attempt: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }
    }

    pub(crate) fn session_state(&self) -> SessionState {
        *self.session_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_session_state(&self, next: SessionState) {
        let mut state = self.session_state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!("session state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Drop a live session after a credential change. A connection built on
    /// the old credential must not serve further operations.
    pub(crate) fn invalidate_session(&self) {
        let mut state = self.session_state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SessionState::Ready {
            debug!("session state Ready -> Disconnected (credential changed)");
            *state = SessionState::Disconnected;
        }
    }

    pub(crate) fn set_login_attempt(&self, attempt: u32) {
        self.login_attempt.store(attempt, Ordering::SeqCst);
    }

    pub(crate) fn login_attempt(&self) -> u32 {
        self.login_attempt.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Resolves when shutdown is signaled. Pending calls see the flag; this
    /// exists for tasks parked on long sleeps.
    pub(crate) async fn shutdown_signaled(&self) {
        if self.is_shutdown() {
            return;
        }
        self.shutdown_notify.notified().await;
    }
}
