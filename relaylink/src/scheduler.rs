//! Operation scheduling.
//!
//! Every read and write passes through one FIFO queue drained by a single
//! worker task, so the transport never sees two calls in flight. The worker
//! fully resolves each request, including the one-shot credential
//! refresh-and-retry, before taking the next.
//!
//! `submit` is also the deadline boundary: it races the response against the
//! configured timeout. The response sink fires at most once by construction,
//! so the caller receives exactly one outcome; a request that outlives its
//! caller keeps running and has its eventual outcome logged instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::LinkShared;
use crate::error::{LinkError, TransportError};
use crate::refresh::TokenRefreshCoordinator;
use crate::session::SessionManager;

const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    Read,
    Write(bool),
}

impl OperationKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write(_) => "write",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationOutcome {
    State(bool),
    Done,
}

struct OperationRequest {
    kind: OperationKind,
    respond: oneshot::Sender<Result<OperationOutcome, LinkError>>,
}

/// FIFO scheduler for all device operations of one instance.
pub(crate) struct OperationScheduler {
    shared: Arc<LinkShared>,
    queue: Mutex<Option<mpsc::Sender<OperationRequest>>>,
}

impl OperationScheduler {
    pub(crate) fn new(
        shared: Arc<LinkShared>,
        session: Arc<SessionManager>,
        refresher: Arc<TokenRefreshCoordinator>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = spawn_worker(shared.clone(), session, refresher, rx);
        let scheduler = OperationScheduler {
            shared,
            queue: Mutex::new(Some(tx)),
        };
        (scheduler, worker)
    }

    /// Queue one operation and wait for its response or the deadline,
    /// whichever comes first.
    pub(crate) async fn submit(
        &self,
        kind: OperationKind,
        deadline: Duration,
    ) -> Result<OperationOutcome, LinkError> {
        if self.shared.is_shutdown() {
            debug!("{} rejected: link is shutting down", kind.name());
            return Err(LinkError::Shutdown);
        }
        let queue = match self.queue.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(queue) => queue,
            None => {
                debug!("{} rejected: operation queue is closed", kind.name());
                return Err(LinkError::Shutdown);
            }
        };

        let (respond, response) = oneshot::channel();
        queue
            .send(OperationRequest { kind, respond })
            .await
            .map_err(|_| LinkError::Shutdown)?;

        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(result)) => result,
            // the worker dropped the sink without answering; only shutdown
            // tears the queue down like that
            Ok(Err(_)) => Err(LinkError::Shutdown),
            Err(_) => {
                warn!(
                    "{} did not complete within {:?}; the in-flight call continues in the background",
                    kind.name(),
                    deadline
                );
                Err(LinkError::Timeout {
                    operation: kind.name(),
                    deadline,
                })
            }
        }
    }

    /// Close the queue: new submissions are rejected and the worker exits
    /// after draining what was already queued.
    pub(crate) fn close(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

fn spawn_worker(
    shared: Arc<LinkShared>,
    session: Arc<SessionManager>,
    refresher: Arc<TokenRefreshCoordinator>,
    mut queue: mpsc::Receiver<OperationRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = queue.recv().await {
            let kind = request.kind;
            let result = if shared.is_shutdown() {
                Err(LinkError::Shutdown)
            } else {
                execute(&shared, &session, &refresher, kind).await
            };

            if let Err(err) = &result {
                debug!("{} finished with error: {err}", kind.name());
            }
            if request.respond.send(result).is_err() {
                debug!(
                    "{} finished after its caller stopped waiting; outcome dropped",
                    kind.name()
                );
            }
        }
        debug!("operation queue closed; worker exiting");
    })
}

/// Run one operation to completion: connect, call the transport, and recover
/// a credential rejection through one refresh-and-retry.
async fn execute(
    shared: &Arc<LinkShared>,
    session: &SessionManager,
    refresher: &TokenRefreshCoordinator,
    kind: OperationKind,
) -> Result<OperationOutcome, LinkError> {
    session.ensure_connected().await?;

    match perform(shared, kind).await {
        Ok(outcome) => Ok(outcome),
        Err(err) if err.is_credential_class() && shared.credentials.is_dynamic() => {
            warn!(
                "device rejected the credential mid-session; refreshing and retrying {} once",
                kind.name()
            );
            match refresher.refresh().await {
                Ok(()) => {
                    session.ensure_connected().await?;
                    match perform(shared, kind).await {
                        Ok(outcome) => Ok(outcome),
                        Err(second) => {
                            // a second rejection right after a refresh is not
                            // recoverable here
                            error!(
                                "{} failed again after credential refresh: {second}",
                                kind.name()
                            );
                            fail(shared, second)
                        }
                    }
                }
                Err(refresh_err) => {
                    error!(
                        "credential refresh failed during {}: {refresh_err}",
                        kind.name()
                    );
                    shared.escalation.escalate(&refresh_err);
                    Err(LinkError::Refresh(refresh_err))
                }
            }
        }
        Err(err) => fail(shared, err),
    }
}

async fn perform(
    shared: &LinkShared,
    kind: OperationKind,
) -> Result<OperationOutcome, TransportError> {
    match kind {
        OperationKind::Read => shared
            .transport
            .query_state()
            .await
            .map(OperationOutcome::State),
        OperationKind::Write(on) => shared
            .transport
            .set_state(on)
            .await
            .map(|()| OperationOutcome::Done),
    }
}

/// Surface a transport failure. Network errors are temporary and stay with
/// the caller; anything else is unrecoverable and may force a restart when
/// the instance is configured for it.
fn fail(shared: &LinkShared, err: TransportError) -> Result<OperationOutcome, LinkError> {
    if shared.config.force_restart_on_failure && !matches!(err, TransportError::Network(_)) {
        shared.escalation.escalate(&err);
    }
    Err(LinkError::Transport(err))
}
