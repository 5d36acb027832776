//! Failure escalation policy.
//!
//! Classifies terminal failures and decides the restart scope: none, this
//! instance only, or the whole host process. The decision depends on the
//! deployment topology (isolated sub-process vs shared host) and the
//! configured force-restart flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

/// Exit code asking the process manager to restart only this instance.
pub const EXIT_RESTART_INSTANCE: i32 = 1;

/// Exit code asking the process manager to restart the whole host process.
pub const EXIT_RESTART_HOST: i32 = 2;

/// Delay between deciding to exit and the exit itself, leaving time for log
/// output to flush and in-flight responses to drain.
pub const EXIT_GRACE_DELAY: Duration = Duration::from_millis(500);

/// Immutable snapshot of deployment topology and restart policy, resolved
/// once per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeContext {
    /// Whether this instance runs as its own restart-isolated process.
    pub isolated_instance: bool,
    /// Whether to restart the whole host on unrecoverable failures.
    pub force_restart_on_failure: bool,
}

impl RuntimeContext {
    /// Resolve the topology: an explicit configuration override wins, then
    /// whatever the host detected, then shared-process.
    pub fn resolve(
        configured: Option<bool>,
        detected: Option<bool>,
        force_restart_on_failure: bool,
    ) -> Self {
        RuntimeContext {
            isolated_instance: configured.or(detected).unwrap_or(false),
            force_restart_on_failure,
        }
    }
}

/// Restart scope for a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// Log and remain loaded in a degraded state.
    None,
    /// Exit with [`EXIT_RESTART_INSTANCE`].
    RestartInstance,
    /// Exit with [`EXIT_RESTART_HOST`].
    RestartHost,
}

impl EscalationAction {
    fn exit_code(self) -> Option<i32> {
        match self {
            EscalationAction::None => None,
            EscalationAction::RestartInstance => Some(EXIT_RESTART_INSTANCE),
            EscalationAction::RestartHost => Some(EXIT_RESTART_HOST),
        }
    }
}

type ExitHandler = Arc<dyn Fn(i32) + Send + Sync>;

/// Decides and executes the restart scope for terminal failures.
///
/// At most one exit is ever scheduled; later escalations while an exit is
/// pending only log. Without a scheduled exit the instance keeps running and
/// reports itself as degraded.
pub struct EscalationPolicy {
    context: RuntimeContext,
    exit_scheduled: AtomicBool,
    degraded: AtomicBool,
    exit: ExitHandler,
}

impl EscalationPolicy {
    pub fn new(context: RuntimeContext) -> Self {
        Self::with_exit_handler(context, |code| std::process::exit(code))
    }

    /// Hosts that manage their own lifecycle can intercept the exit instead
    /// of letting the process terminate.
    pub fn with_exit_handler(
        context: RuntimeContext,
        exit: impl Fn(i32) + Send + Sync + 'static,
    ) -> Self {
        EscalationPolicy {
            context,
            exit_scheduled: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            exit: Arc::new(exit),
        }
    }

    pub fn context(&self) -> RuntimeContext {
        self.context
    }

    /// The restart scope this policy applies to terminal failures.
    pub fn decide(&self) -> EscalationAction {
        match (
            self.context.isolated_instance,
            self.context.force_restart_on_failure,
        ) {
            (true, _) => EscalationAction::RestartInstance,
            (false, true) => EscalationAction::RestartHost,
            (false, false) => EscalationAction::None,
        }
    }

    /// Whether a no-exit escalation has left the instance degraded.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Whether an exit has been scheduled.
    pub fn exit_scheduled(&self) -> bool {
        self.exit_scheduled.load(Ordering::SeqCst)
    }

    /// Handle a terminal failure according to the decision table.
    ///
    /// Must be called from within a tokio runtime: the exit fires from a
    /// spawned task after [`EXIT_GRACE_DELAY`].
    pub(crate) fn escalate(&self, failure: &dyn fmt::Display) {
        let action = self.decide();
        let Some(code) = action.exit_code() else {
            error!(
                "unrecoverable failure: {failure}; instance remains loaded in a degraded state"
            );
            self.degraded.store(true, Ordering::SeqCst);
            return;
        };

        if self.exit_scheduled.swap(true, Ordering::SeqCst) {
            debug!("exit already scheduled; not escalating again for: {failure}");
            return;
        }

        error!(
            "unrecoverable failure: {failure}; scheduling exit with code {code} in {:?}",
            EXIT_GRACE_DELAY
        );
        let exit = self.exit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EXIT_GRACE_DELAY).await;
            exit(code);
        });
    }
}
