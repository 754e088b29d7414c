//! The worker loop.
//!
//! ## Lifecycle
//!
//! `Uninitialized` → (Generate) → `Active` → (remove / idle / abort) → `Destroyed`
//!
//! The idle deadline is re-armed in the same step that accepts a request,
//! and the timer is not polled while a request is being processed, so a
//! worker can never be evicted mid-request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::request::{
    Envelope, GenerateParams, IdentityStatus, Lifecycle, QueryKind, Reply, Request, Response,
};
use crate::identity::{SigningIdentity, TransactionRequest};
use crate::ledger::LedgerConnector;
use crate::nonce::NonceSynchronizer;
use crate::types::{KeywardError, Result};

/// Shared collaborators every worker needs
pub(crate) struct WorkerContext {
    pub connector: Arc<dyn LedgerConnector>,
    pub synchronizer: NonceSynchronizer,
    pub idle_timeout: Duration,
}

/// Why a worker left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Explicit removal by the embedder
    Removed,
    /// No accepted request within the idle timeout
    IdleTimeout,
    /// The registry was shut down
    Shutdown,
    /// An internal invariant was violated while handling a request
    Aborted,
}

/// Called once when a worker stops routing, before it drains its mailbox
pub(crate) type ExitHook = Box<dyn FnOnce(Uuid, ExitReason) + Send>;

enum WorkerState {
    Uninitialized,
    Active(SigningIdentity),
    Destroyed,
}

impl WorkerState {
    fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::Uninitialized => Lifecycle::Uninitialized,
            Self::Active(_) => Lifecycle::Active,
            Self::Destroyed => Lifecycle::Destroyed,
        }
    }
}

pub(crate) struct Worker {
    key: String,
    instance: Uuid,
    state: WorkerState,
    last_activity: DateTime<Utc>,
    context: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(key: String, instance: Uuid, context: Arc<WorkerContext>) -> Self {
        Self {
            key,
            instance,
            state: WorkerState::Uninitialized,
            last_activity: Utc::now(),
            context,
        }
    }

    /// Serve the mailbox until removal, shutdown, idle timeout or abort.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        on_exit: ExitHook,
    ) -> ExitReason {
        let idle_timeout = self.context.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        info!(key = %self.key, instance = %self.instance, "Worker started");

        let reason = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break if shutdown.is_cancelled() {
                        ExitReason::Shutdown
                    } else {
                        ExitReason::Removed
                    };
                }

                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else {
                        break ExitReason::Removed;
                    };

                    // The caller gave up before we got here.
                    if envelope.reply.is_closed() {
                        debug!(
                            key = %self.key,
                            op = envelope.request.name(),
                            "Dropping request abandoned before acceptance"
                        );
                        continue;
                    }

                    idle.as_mut().reset(Instant::now() + idle_timeout);

                    if self.accept(envelope).await.is_err() {
                        break ExitReason::Aborted;
                    }
                }

                _ = &mut idle => {
                    break ExitReason::IdleTimeout;
                }
            }
        };

        on_exit(self.instance, reason);

        // Anything still queued was never accepted; hand it back for re-routing.
        inbox.close();
        let mut rejected = 0usize;
        while let Ok(envelope) = inbox.try_recv() {
            let _ = envelope.reply.send(Reply::Rejected(envelope.request));
            rejected += 1;
        }

        let previous = self.state.lifecycle();
        self.state = WorkerState::Destroyed;

        info!(
            key = %self.key,
            instance = %self.instance,
            ?reason,
            ?previous,
            rejected,
            "Worker destroyed"
        );

        reason
    }

    /// Process one accepted request. `Err` means the worker must abort.
    async fn accept(&mut self, envelope: Envelope) -> std::result::Result<(), ()> {
        let Envelope {
            key,
            request,
            reply,
        } = envelope;

        if key != self.key {
            let violation = format!(
                "request for key {key} was routed to the worker for {}",
                self.key
            );
            error!(key = %self.key, instance = %self.instance, %violation, "Aborting worker");
            let _ = reply.send(Reply::Done(Err(KeywardError::InternalInvariantViolation(
                violation,
            ))));
            return Err(());
        }

        self.last_activity = Utc::now();
        let op = request.name();
        let result = self.handle(request).await;

        match &result {
            Ok(_) => debug!(key = %self.key, op, "Request completed"),
            Err(e) => debug!(key = %self.key, op, error = %e, "Request failed"),
        }

        if reply.send(Reply::Done(result)).is_err() {
            debug!(key = %self.key, op, "Caller left before the reply was delivered");
        }

        Ok(())
    }

    async fn handle(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Generate(params) => self.generate(params).await,
            Request::Sign(tx) => self.sign(tx),
            Request::SyncNonce => {
                let context = Arc::clone(&self.context);
                let identity = self.identity_mut()?;
                let outcome = context.synchronizer.sync(identity).await?;
                Ok(Response::Synced(outcome))
            }
            Request::Query(kind) => self.query(kind),
        }
    }

    async fn generate(&mut self, params: GenerateParams) -> Result<Response> {
        let GenerateParams {
            endpoint,
            private_key,
            algorithm,
            initial_sequence,
        } = params;

        let ledger = self.context.connector.connect(&endpoint).await?;
        let identity =
            SigningIdentity::new(private_key, algorithm, ledger, endpoint, initial_sequence);
        let address = *identity.address();

        let replaced = matches!(self.state, WorkerState::Active(_));
        self.state = WorkerState::Active(identity);

        info!(
            key = %self.key,
            %address,
            %algorithm,
            initial_sequence,
            replaced,
            "Identity generated"
        );

        Ok(Response::Generated { address })
    }

    fn sign(&mut self, request: TransactionRequest) -> Result<Response> {
        let identity = self.identity_mut()?;
        identity.check_sequence_available()?;

        // Sign against the current value and only consume it on success.
        let tx = request.with_nonce(identity.sequence_number());
        let signed = identity.sign(&tx)?;
        let consumed = identity.next_sequence_number()?;
        debug_assert_eq!(consumed, signed.nonce());

        Ok(Response::Signed(signed))
    }

    fn query(&mut self, kind: QueryKind) -> Result<Response> {
        let key = self.key.clone();
        let last_activity = self.last_activity;
        let identity = self.identity_mut()?;

        Ok(match kind {
            QueryKind::Address => Response::Address {
                address: *identity.address(),
            },
            QueryKind::Nonce => Response::Nonce {
                sequence_number: identity.sequence_number(),
            },
            QueryKind::Status => Response::Status(IdentityStatus {
                key,
                address: *identity.address(),
                sequence_number: identity.sequence_number(),
                algorithm: identity.algorithm(),
                endpoint: identity.endpoint().to_string(),
                lifecycle: Lifecycle::Active,
                last_activity,
            }),
        })
    }

    fn identity_mut(&mut self) -> Result<&mut SigningIdentity> {
        match &mut self.state {
            WorkerState::Active(identity) => Ok(identity),
            WorkerState::Uninitialized => {
                Err(KeywardError::IdentityNotInitialized(self.key.clone()))
            }
            WorkerState::Destroyed => Err(KeywardError::NotFound(self.key.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, PrivateKeyMaterial};
    use crate::ledger::MemoryConnector;
    use crate::worker::WorkerHandle;
    use tokio::sync::oneshot;

    fn context(idle_timeout: Duration) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            connector: Arc::new(MemoryConnector::new()),
            synchronizer: NonceSynchronizer::default(),
            idle_timeout,
        })
    }

    fn spawn(key: &str, idle_timeout: Duration) -> (WorkerHandle, oneshot::Receiver<ExitReason>) {
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = WorkerHandle::spawn(
            key.to_string(),
            context(idle_timeout),
            8,
            &CancellationToken::new(),
            Box::new(move |_, reason| {
                let _ = exit_tx.send(reason);
            }),
        );
        (handle, exit_rx)
    }

    async fn call(handle: &WorkerHandle, key: &str, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        handle
            .mailbox
            .send(Envelope {
                key: key.to_string(),
                request,
                reply,
            })
            .await
            .expect("worker is running");
        match rx.await.expect("worker replied") {
            Reply::Done(result) => result,
            Reply::Rejected(_) => panic!("request was rejected"),
        }
    }

    fn generate() -> Request {
        Request::Generate(GenerateParams::new(
            "memory://actor",
            PrivateKeyMaterial::from_bytes([4; 32]),
        ))
    }

    fn transfer() -> Request {
        let to: Address = "0x00000000000000000000000000000000000000cc".parse().unwrap();
        Request::Sign(TransactionRequest::transfer(to, 1))
    }

    #[tokio::test]
    async fn test_sign_before_generate_is_not_initialized() {
        let (handle, _exit) = spawn("k", Duration::from_secs(60));

        let result = call(&handle, "k", transfer()).await;
        assert!(matches!(result, Err(KeywardError::IdentityNotInitialized(k)) if k == "k"));

        let result = call(&handle, "k", Request::Query(QueryKind::Nonce)).await;
        assert!(matches!(result, Err(KeywardError::IdentityNotInitialized(_))));
    }

    #[tokio::test]
    async fn test_generate_then_sign_consumes_sequence() {
        let (handle, _exit) = spawn("k", Duration::from_secs(60));
        call(&handle, "k", generate()).await.unwrap();

        for expected in 0..3 {
            match call(&handle, "k", transfer()).await.unwrap() {
                Response::Signed(signed) => assert_eq!(signed.nonce(), expected),
                other => panic!("unexpected response: {other:?}"),
            }
        }

        match call(&handle, "k", Request::Query(QueryKind::Nonce)).await.unwrap() {
            Response::Nonce { sequence_number } => assert_eq!(sequence_number, 3),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_sign_does_not_consume_sequence() {
        let (handle, _exit) = spawn("k", Duration::from_secs(60));
        call(&handle, "k", generate()).await.unwrap();

        let to: Address = "0x00000000000000000000000000000000000000cc".parse().unwrap();
        let mismatched = Request::Sign(TransactionRequest::transfer(to, 1).on_chain(77));
        let result = call(&handle, "k", mismatched).await;
        assert!(matches!(result, Err(KeywardError::SigningFailed(_))));

        match call(&handle, "k", transfer()).await.unwrap() {
            Response::Signed(signed) => assert_eq!(signed.nonce(), 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_regenerate_overwrites_identity() {
        let (handle, _exit) = spawn("k", Duration::from_secs(60));
        call(&handle, "k", generate()).await.unwrap();
        call(&handle, "k", transfer()).await.unwrap();

        let other_key = Request::Generate(GenerateParams::new(
            "memory://actor",
            PrivateKeyMaterial::from_bytes([5; 32]),
        ));
        call(&handle, "k", other_key).await.unwrap();

        match call(&handle, "k", Request::Query(QueryKind::Nonce)).await.unwrap() {
            Response::Nonce { sequence_number } => assert_eq!(sequence_number, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_misrouted_request_aborts_worker() {
        let (handle, exit) = spawn("k", Duration::from_secs(60));

        let result = call(&handle, "other", Request::Query(QueryKind::Address)).await;
        assert!(matches!(result, Err(KeywardError::InternalInvariantViolation(_))));
        assert_eq!(exit.await.unwrap(), ExitReason::Aborted);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_skipped() {
        let (handle, _exit) = spawn("k", Duration::from_secs(60));
        call(&handle, "k", generate()).await.unwrap();

        // Queue a sign whose caller is already gone.
        let (reply, rx) = oneshot::channel();
        drop(rx);
        handle
            .mailbox
            .try_send(Envelope {
                key: "k".into(),
                request: transfer(),
                reply,
            })
            .ok()
            .expect("mailbox has room");

        match call(&handle, "k", Request::Query(QueryKind::Nonce)).await.unwrap() {
            Response::Nonce { sequence_number } => assert_eq!(sequence_number, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_exits() {
        let (handle, exit) = spawn("k", Duration::from_secs(30));
        call(&handle, "k", generate()).await.unwrap();

        assert_eq!(exit.await.unwrap(), ExitReason::IdleTimeout);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_stops_worker() {
        let (handle, exit) = spawn("k", Duration::from_secs(60));
        handle.cancel.cancel();
        assert_eq!(exit.await.unwrap(), ExitReason::Removed);
    }
}
