//! Public entry point: one controller per device instance.
//!
//! The controller validates the configuration, resolves the deployment
//! topology, wires the session manager, refresh coordinator and operation
//! scheduler around one shared context, and spawns the worker and (in dynamic
//! credential mode) the periodic refresh timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::RelayConfig;
use crate::context::LinkShared;
use crate::credential::CredentialStore;
use crate::error::{ConfigError, LinkError};
use crate::escalation::{EscalationPolicy, RuntimeContext};
use crate::refresh::{spawn_periodic_refresh, TokenRefreshCoordinator};
use crate::scheduler::{OperationKind, OperationOutcome, OperationScheduler};
use crate::session::{SessionManager, SessionState};
use crate::transport::DeviceTransport;

/// Resilient control link to a single remote relay device.
///
/// Construction spawns background tasks and therefore must happen within a
/// tokio runtime.
pub struct RelayController {
    shared: Arc<LinkShared>,
    scheduler: OperationScheduler,
    #[allow(dead_code)]
    worker: JoinHandle<()>,
    #[allow(dead_code)]
    refresh_timer: Option<JoinHandle<()>>,
}

impl RelayController {
    /// Build a controller for the given device.
    ///
    /// `detected_isolated` is the host's view of the deployment topology; an
    /// explicit `isolated_instance` setting in the configuration overrides it.
    pub fn new(
        config: RelayConfig,
        transport: Arc<dyn DeviceTransport>,
        detected_isolated: Option<bool>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, transport, detected_isolated, EscalationPolicy::new)
    }

    /// Like [`RelayController::new`], but routing restart exits through the
    /// given handler instead of terminating the process. For hosts that
    /// manage their own lifecycle.
    pub fn with_exit_handler(
        config: RelayConfig,
        transport: Arc<dyn DeviceTransport>,
        detected_isolated: Option<bool>,
        exit: impl Fn(i32) + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        Self::build(config, transport, detected_isolated, |context| {
            EscalationPolicy::with_exit_handler(context, exit)
        })
    }

    fn build(
        config: RelayConfig,
        transport: Arc<dyn DeviceTransport>,
        detected_isolated: Option<bool>,
        policy: impl FnOnce(RuntimeContext) -> EscalationPolicy,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let context = RuntimeContext::resolve(
            config.isolated_instance,
            detected_isolated,
            config.force_restart_on_failure,
        );
        let escalation = policy(context);
        let credentials = CredentialStore::new(&config.credential);
        let dynamic = credentials.is_dynamic();

        info!(
            "relay link to {} starting (credentials: {}, isolated: {})",
            config.address,
            if dynamic { "dynamic" } else { "fixed" },
            context.isolated_instance
        );

        let shared = Arc::new(LinkShared::new(transport, credentials, escalation, config));
        let refresher = Arc::new(TokenRefreshCoordinator::new(shared.clone()));
        let session = Arc::new(SessionManager::new(shared.clone(), refresher.clone()));
        let (scheduler, worker) =
            OperationScheduler::new(shared.clone(), session.clone(), refresher.clone());
        let refresh_timer =
            dynamic.then(|| spawn_periodic_refresh(shared.clone(), refresher, session));

        Ok(RelayController {
            shared,
            scheduler,
            worker,
            refresh_timer,
        })
    }

    /// Read the device's on/off state.
    ///
    /// Resolves within `deadline` (the configured default when `None`): with
    /// the state, an error, or a timeout, exactly one of the three.
    pub async fn read_state(&self, deadline: Option<Duration>) -> Result<bool, LinkError> {
        let deadline = deadline.unwrap_or_else(|| self.shared.config.operation_timeout());
        match self.scheduler.submit(OperationKind::Read, deadline).await? {
            OperationOutcome::State(on) => Ok(on),
            OperationOutcome::Done => unreachable!("read operations always yield a state"),
        }
    }

    /// Set the device's on/off state. Same delivery guarantees as
    /// [`RelayController::read_state`].
    pub async fn write_state(&self, on: bool, deadline: Option<Duration>) -> Result<(), LinkError> {
        let deadline = deadline.unwrap_or_else(|| self.shared.config.operation_timeout());
        match self
            .scheduler
            .submit(OperationKind::Write(on), deadline)
            .await?
        {
            OperationOutcome::Done => Ok(()),
            OperationOutcome::State(_) => unreachable!("write operations yield no state"),
        }
    }

    /// Current connection state of the device session.
    pub fn session_state(&self) -> SessionState {
        self.shared.session_state()
    }

    /// Attempt counter of the most recent login sequence.
    pub fn login_attempts(&self) -> u32 {
        self.shared.login_attempt()
    }

    /// Whether an unrecoverable failure has left this instance degraded
    /// (loaded but without a working session, per the escalation policy).
    pub fn is_degraded(&self) -> bool {
        self.shared.escalation.is_degraded()
    }

    /// Release resources deterministically: reject new operations, abort the
    /// login retry loop at its next boundary, stop the periodic refresh
    /// timer, and close the transport. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.is_shutdown() {
            return;
        }
        info!("shutting down relay link to {}", self.shared.config.address);
        self.shared.signal_shutdown();
        // queued requests drain with shutdown errors, then the worker exits
        self.scheduler.close();
        self.shared.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{Credential, CredentialMode};
    use crate::error::TransportError;
    use crate::transport::mock::{Call, MockTransport};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn fixed_config() -> RelayConfig {
        RelayConfig::new(
            "192.168.1.50",
            CredentialMode::Fixed(Credential::new("operator-token")),
        )
    }

    fn controller(config: RelayConfig) -> (RelayController, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let controller =
            RelayController::with_exit_handler(config, transport.clone(), None, |_code| {})
                .unwrap();
        (controller, transport)
    }

    #[tokio::test]
    async fn rejects_invalid_configuration() {
        let mut config = fixed_config();
        config.address = String::new();
        let transport = Arc::new(MockTransport::new());
        assert!(RelayController::new(config, transport, None).is_err());
    }

    #[tokio::test]
    async fn reads_and_writes_through_one_session() {
        let (controller, transport) = controller(fixed_config());
        transport.push_query(Ok(true));

        assert!(controller.read_state(None).await.unwrap());
        controller.write_state(false, None).await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![Call::Login, Call::Query, Call::Set(false)]
        );
        assert_eq!(controller.session_state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_operations_trigger_one_login() {
        let (controller, transport) = controller(fixed_config());
        transport.set_login_delay(Duration::from_millis(100));

        let (read, write) =
            tokio::join!(controller.read_state(None), controller.write_state(true, None));
        read.unwrap();
        write.unwrap();
        assert_eq!(transport.login_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_device_yields_a_timeout_at_the_default_deadline() {
        let (controller, transport) = controller(fixed_config());
        transport.hang_operations();

        let start = Instant::now();
        let err = controller.read_state(None).await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert_eq!(start.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_operations_and_closes_the_transport() {
        let (controller, transport) = controller(fixed_config());
        controller.read_state(None).await.unwrap();

        controller.shutdown().await;
        assert!(transport.is_closed());

        let err = controller.read_state(None).await.unwrap_err();
        assert!(matches!(err, LinkError::Shutdown));

        // idempotent
        controller.shutdown().await;
        assert_eq!(transport.count(&Call::Close), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_host_without_force_restart_degrades_instead_of_exiting() {
        let mut config = fixed_config();
        config.max_login_attempts = 1;
        let transport = Arc::new(MockTransport::new());
        let exit_codes = Arc::new(Mutex::new(Vec::new()));
        let sink = exit_codes.clone();
        let controller = RelayController::with_exit_handler(
            config,
            transport.clone(),
            Some(false),
            move |code| sink.lock().unwrap().push(code),
        )
        .unwrap();
        transport.push_login(Err(TransportError::Network("host unreachable".into())));

        let err = controller.read_state(None).await.unwrap_err();
        assert!(matches!(err, LinkError::Session(_)));
        assert!(controller.is_degraded());
        assert_eq!(controller.session_state(), SessionState::Failed);
        assert_eq!(controller.login_attempts(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(exit_codes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_mode_runs_the_periodic_refresh_timer() {
        let mut config = RelayConfig::new("192.168.1.50", CredentialMode::Dynamic);
        config.refresh_interval_ms = 1000;
        let (controller, transport) = controller(config);

        // no operations submitted; the timer alone drives fetch + reconnect
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(transport.fetch_calls() >= 1);

        controller.shutdown().await;
    }
}
