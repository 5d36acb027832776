//! Session management: the connect/retry/backoff state machine.
//!
//! `ensure_connected` guarantees at most one login attempt sequence is in
//! flight; concurrent callers join the same shared future and observe its
//! outcome. A sequence walks the configured attempt budget with exponential
//! backoff, recovering credential rejections through an on-demand token
//! refresh when dynamic credentials are enabled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::context::LinkShared;
use crate::error::SessionError;
use crate::refresh::TokenRefreshCoordinator;

/// Connection state of the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

/// Backoff schedule for login retries.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Login attempts before the session is declared failed.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Spread delays randomly to avoid thundering herds of reconnecting
    /// instances.
    pub use_jitter: bool,
    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            use_jitter: false,
            jitter_factor: 0.3,
        }
    }
}

impl BackoffConfig {
    pub fn from_config(config: &RelayConfig) -> Self {
        BackoffConfig {
            max_attempts: config.max_login_attempts,
            initial_delay: config.initial_backoff(),
            max_delay: config.backoff_cap(),
            ..BackoffConfig::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed): the initial
    /// delay doubled per attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let exponential = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.use_jitter && self.jitter_factor > 0.0 {
            let jitter_range = exponential.as_secs_f64() * self.jitter_factor;
            let random_factor = rand_simple() * jitter_range - (jitter_range / 2.0);
            let jittered = (exponential.as_secs_f64() + random_factor).max(0.1);
            Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
        } else {
            exponential
        }
    }
}

/// Simple pseudo-random number generator for jitter (0.0 to 1.0).
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as f64 % 1000.0) / 1000.0
}

type LoginFuture = Shared<BoxFuture<'static, Result<(), SessionError>>>;

/// Owns the login sequence. At most one sequence runs at a time.
pub(crate) struct SessionManager {
    shared: Arc<LinkShared>,
    refresher: Arc<TokenRefreshCoordinator>,
    backoff: BackoffConfig,
    pending: Arc<Mutex<Option<LoginFuture>>>,
}

impl SessionManager {
    pub(crate) fn new(shared: Arc<LinkShared>, refresher: Arc<TokenRefreshCoordinator>) -> Self {
        let backoff = BackoffConfig::from_config(&shared.config);
        SessionManager {
            shared,
            refresher,
            backoff,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Return once the session is `Ready`, starting a login sequence if none
    /// is in flight. Concurrent callers share the in-flight sequence and its
    /// outcome.
    pub(crate) async fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.shared.is_shutdown() {
            return Err(SessionError::Shutdown);
        }
        if self.shared.session_state() == SessionState::Ready {
            return Ok(());
        }

        let login = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.as_ref() {
                Some(login) => login.clone(),
                None => {
                    let login = login_sequence(
                        self.shared.clone(),
                        self.refresher.clone(),
                        self.backoff.clone(),
                        self.pending.clone(),
                    )
                    .boxed()
                    .shared();
                    *pending = Some(login.clone());
                    login
                }
            }
        };
        login.await
    }
}

/// One complete login attempt sequence. Clears the shared handle before
/// resolving, updates the session state, and escalates terminal failures.
async fn login_sequence(
    shared: Arc<LinkShared>,
    refresher: Arc<TokenRefreshCoordinator>,
    backoff: BackoffConfig,
    pending: Arc<Mutex<Option<LoginFuture>>>,
) -> Result<(), SessionError> {
    let result = run_attempts(&shared, &refresher, &backoff).await;
    pending.lock().unwrap_or_else(|e| e.into_inner()).take();

    match &result {
        Ok(()) => {}
        Err(SessionError::Shutdown) => {
            shared.set_session_state(SessionState::Disconnected);
        }
        Err(err) => {
            shared.set_session_state(SessionState::Failed);
            shared.escalation.escalate(err);
        }
    }
    result
}

enum AttemptOutcome {
    Connected,
    /// Fresh token in hand; retry at once without consuming the attempt.
    RetryImmediately,
    RetryAfterBackoff(String),
    Terminal(SessionError),
}

async fn run_attempts(
    shared: &Arc<LinkShared>,
    refresher: &TokenRefreshCoordinator,
    backoff: &BackoffConfig,
) -> Result<(), SessionError> {
    shared.set_session_state(SessionState::Connecting);
    let mut attempt: u32 = 1;
    // None: no refresh tried yet. Some(true): a fresh token was fetched.
    // Some(false): the fetch failed; do not try again this sequence.
    let mut refresh_outcome: Option<bool> = None;

    loop {
        if shared.is_shutdown() {
            debug!("login sequence aborted: shutdown requested");
            return Err(SessionError::Shutdown);
        }
        shared.set_login_attempt(attempt);
        debug!("login attempt {}/{}", attempt, backoff.max_attempts);

        match attempt_once(shared, refresher, &mut refresh_outcome).await {
            AttemptOutcome::Connected => {
                info!("session established on login attempt {attempt}");
                shared.set_session_state(SessionState::Ready);
                return Ok(());
            }
            AttemptOutcome::RetryImmediately => continue,
            AttemptOutcome::Terminal(err) => {
                error!("login failed: {err}");
                return Err(err);
            }
            AttemptOutcome::RetryAfterBackoff(message) => {
                if attempt >= backoff.max_attempts {
                    return Err(SessionError::RetriesExhausted {
                        attempts: attempt,
                        last_error: message,
                    });
                }
                let delay = backoff.delay_for_attempt(attempt);
                warn!(
                    "login attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, backoff.max_attempts, message, delay
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shared.shutdown_signaled() => {}
                }
                attempt += 1;
            }
        }
    }
}

async fn attempt_once(
    shared: &Arc<LinkShared>,
    refresher: &TokenRefreshCoordinator,
    refresh_outcome: &mut Option<bool>,
) -> AttemptOutcome {
    // Dynamic mode starts with no token; fetch one before the first login.
    let credential = match shared.credentials.current() {
        Some(credential) => credential,
        None => match refresher.refresh().await {
            Ok(()) => match shared.credentials.current() {
                Some(credential) => credential,
                None => {
                    return AttemptOutcome::RetryAfterBackoff(
                        "credential store empty after fetch".to_string(),
                    )
                }
            },
            Err(err) => return AttemptOutcome::RetryAfterBackoff(err.to_string()),
        },
    };

    match shared.transport.login(&credential).await {
        Ok(()) => AttemptOutcome::Connected,
        Err(err) if err.is_credential_class() => match *refresh_outcome {
            // The device rejected a token it just handed out. Retrying
            // cannot help.
            Some(true) => AttemptOutcome::Terminal(SessionError::CredentialRejected(
                err.to_string(),
            )),
            Some(false) => AttemptOutcome::RetryAfterBackoff(err.to_string()),
            None if shared.credentials.is_dynamic() => {
                warn!("device rejected the credential during login; requesting a fresh token");
                match refresher.refresh().await {
                    Ok(()) => {
                        *refresh_outcome = Some(true);
                        AttemptOutcome::RetryImmediately
                    }
                    Err(refresh_err) => {
                        warn!("credential refresh failed during login: {refresh_err}");
                        *refresh_outcome = Some(false);
                        AttemptOutcome::RetryAfterBackoff(err.to_string())
                    }
                }
            }
            None => AttemptOutcome::RetryAfterBackoff(err.to_string()),
        },
        Err(err) => AttemptOutcome::RetryAfterBackoff(err.to_string()),
    }
}
