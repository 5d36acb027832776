//! Out-of-band credential refresh.
//!
//! The coordinator owns the single-flight fetch from the side channel: while
//! one fetch runs, every other caller joins it and observes the same outcome.
//! A successful fetch replaces the stored credential and invalidates any live
//! session, since a connection built on the old token must not serve further
//! operations. An autonomous periodic timer drives refreshes in dynamic mode;
//! ticks that find a refresh already running are skipped, not queued.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::LinkShared;
use crate::error::RefreshError;
use crate::session::SessionManager;

type RefreshFuture = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

/// Coordinates credential refreshes for one device instance.
pub(crate) struct TokenRefreshCoordinator {
    shared: Arc<LinkShared>,
    in_flight: Arc<Mutex<Option<RefreshFuture>>>,
}

impl TokenRefreshCoordinator {
    pub(crate) fn new(shared: Arc<LinkShared>) -> Self {
        TokenRefreshCoordinator {
            shared,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a refresh is currently running.
    pub(crate) fn refresh_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Fetch a fresh credential from the out-of-band channel and store it.
    ///
    /// Single-flight: concurrent callers share one fetch and its outcome.
    pub(crate) async fn refresh(&self) -> Result<(), RefreshError> {
        if !self.shared.credentials.is_dynamic() {
            return Err(RefreshError::Disabled);
        }

        let refresh = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = run_refresh(self.shared.clone(), self.in_flight.clone())
                        .boxed()
                        .shared();
                    *in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }
}

/// One refresh run. Clears the shared handle before resolving.
async fn run_refresh(
    shared: Arc<LinkShared>,
    in_flight: Arc<Mutex<Option<RefreshFuture>>>,
) -> Result<(), RefreshError> {
    let result = fetch_and_store(&shared).await;
    in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
    result
}

async fn fetch_and_store(shared: &LinkShared) -> Result<(), RefreshError> {
    debug!("fetching a fresh credential over the out-of-band channel");
    match shared.transport.fetch_credential_out_of_band().await {
        Ok(Some(credential)) => {
            shared.credentials.replace(credential);
            shared.invalidate_session();
            info!("credential refreshed");
            Ok(())
        }
        Ok(None) => {
            warn!("out-of-band channel returned no credential");
            Err(RefreshError::Empty)
        }
        Err(err) => {
            warn!("credential fetch failed: {err}");
            Err(RefreshError::Fetch(err.to_string()))
        }
    }
}

/// Autonomous refresh on the configured period. Runs until shutdown.
///
/// Failures here happen outside any caller's retry path, so they go straight
/// to the escalation policy.
pub(crate) fn spawn_periodic_refresh(
    shared: Arc<LinkShared>,
    coordinator: Arc<TokenRefreshCoordinator>,
    session: Arc<SessionManager>,
) -> JoinHandle<()> {
    let period = shared.config.refresh_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; the loop below starts with a
        // full period
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shared.shutdown_signaled() => break,
            }
            if shared.is_shutdown() {
                break;
            }
            if coordinator.refresh_in_flight() {
                debug!("periodic refresh skipped: a refresh is already in progress");
                continue;
            }
            match coordinator.refresh().await {
                Ok(()) => {
                    // reconnect with the new token; session failures escalate
                    // on their own
                    if let Err(err) = session.ensure_connected().await {
                        warn!("reconnect after periodic refresh failed: {err}");
                    }
                }
                Err(err) => {
                    error!("periodic credential refresh failed: {err}");
                    shared.escalation.escalate(&err);
                }
            }
        }
        debug!("periodic refresh timer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::credential::{Credential, CredentialMode, CredentialStore};
    use crate::error::TransportError;
    use crate::escalation::{EscalationPolicy, RuntimeContext, EXIT_GRACE_DELAY};
    use crate::session::SessionState;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    struct Harness {
        transport: Arc<MockTransport>,
        shared: Arc<LinkShared>,
        coordinator: Arc<TokenRefreshCoordinator>,
        exit_codes: Arc<Mutex<Vec<i32>>>,
    }

    fn harness(config: RelayConfig) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let exit_codes = Arc::new(Mutex::new(Vec::new()));
        let sink = exit_codes.clone();
        let context = RuntimeContext {
            isolated_instance: true,
            force_restart_on_failure: false,
        };
        let escalation = EscalationPolicy::with_exit_handler(context, move |code| {
            sink.lock().unwrap().push(code);
        });
        let credentials = CredentialStore::new(&config.credential);
        let shared = Arc::new(LinkShared::new(
            transport.clone(),
            credentials,
            escalation,
            config,
        ));
        let coordinator = Arc::new(TokenRefreshCoordinator::new(shared.clone()));
        Harness {
            transport,
            shared,
            coordinator,
            exit_codes,
        }
    }

    fn dynamic_config() -> RelayConfig {
        RelayConfig::new("device.local", CredentialMode::Dynamic)
    }

    #[tokio::test]
    async fn refresh_stores_the_new_credential_and_invalidates_the_session() {
        let h = harness(dynamic_config());
        h.shared.set_session_state(SessionState::Ready);

        h.coordinator.refresh().await.unwrap();
        assert_eq!(h.shared.credentials.current().unwrap().expose(), "fresh-token");
        assert_eq!(h.shared.session_state(), SessionState::Disconnected);
        assert_eq!(h.transport.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn refresh_is_disabled_in_fixed_mode() {
        let h = harness(RelayConfig::new(
            "device.local",
            CredentialMode::Fixed(Credential::new("operator-token")),
        ));
        let err = h.coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::Disabled));
        assert_eq!(h.transport.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn empty_channel_and_fetch_errors_are_distinct() {
        let h = harness(dynamic_config());
        h.transport.push_fetch(Ok(None));
        h.transport
            .push_fetch(Err(TransportError::Network("side channel down".into())));

        assert!(matches!(
            h.coordinator.refresh().await.unwrap_err(),
            RefreshError::Empty
        ));
        assert!(matches!(
            h.coordinator.refresh().await.unwrap_err(),
            RefreshError::Fetch(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_fetch() {
        let h = harness(dynamic_config());
        h.transport.set_fetch_delay(Duration::from_millis(100));

        let (a, b) = tokio::join!(h.coordinator.refresh(), h.coordinator.refresh());
        a.unwrap();
        b.unwrap();
        assert_eq!(h.transport.fetch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_skip_while_a_refresh_runs_and_stop_on_shutdown() {
        let mut config = dynamic_config();
        config.refresh_interval_ms = 1000;
        let h = harness(config);
        // each fetch spans three periods; intervening ticks must not queue
        h.transport.set_fetch_delay(Duration::from_millis(3000));

        let refresher = Arc::new(TokenRefreshCoordinator::new(h.shared.clone()));
        let session = Arc::new(SessionManager::new(h.shared.clone(), refresher));
        let timer = spawn_periodic_refresh(h.shared.clone(), h.coordinator.clone(), session);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(h.transport.fetch_calls(), 1);

        h.shared.signal_shutdown();
        timer.await.unwrap();
        let fetches = h.transport.fetch_calls();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(h.transport.fetch_calls(), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_failure_escalates() {
        let mut config = dynamic_config();
        config.refresh_interval_ms = 1000;
        let h = harness(config);
        h.transport.push_fetch(Ok(None));

        let refresher = Arc::new(TokenRefreshCoordinator::new(h.shared.clone()));
        let session = Arc::new(SessionManager::new(h.shared.clone(), refresher));
        let timer = spawn_periodic_refresh(h.shared.clone(), h.coordinator.clone(), session);

        tokio::time::sleep(Duration::from_millis(1100) + EXIT_GRACE_DELAY).await;
        assert_eq!(*h.exit_codes.lock().unwrap(), vec![crate::escalation::EXIT_RESTART_INSTANCE]);

        h.shared.signal_shutdown();
        timer.await.unwrap();
    }
}
