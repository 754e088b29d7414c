//! Worker Registry - maps keys to their signing workers
//!
//! The registry is the only shared structure callers touch. It decides,
//! per request, whether to route to an existing worker or spawn a new one;
//! the request itself is processed by the worker, outside any registry lock.
//!
//! ## Thread Safety
//!
//! Uses DashMap's entry API for the create-or-route decision, so concurrent
//! first requests for the same key converge on a single worker. A worker
//! leaving the map removes its entry only if the entry still names that
//! worker instance, so a successor is never removed by its predecessor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::identity::{Address, SignedTransaction, TransactionRequest};
use crate::ledger::LedgerConnector;
use crate::nonce::{NonceSyncConfig, NonceSynchronizer, SyncOutcome};
use crate::types::{KeywardError, Result};
use crate::worker::{
    Envelope, ExitHook, ExitReason, GenerateParams, IdentityStatus, QueryKind, Reply, Request,
    Response, WorkerContext, WorkerHandle,
};

/// Default inactivity window before a worker is evicted (10 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default per-worker mailbox capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Bound on re-routing a request whose worker left between lookup and send
const MAX_ROUTE_ATTEMPTS: usize = 3;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the worker registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a worker may go without an accepted request
    pub idle_timeout: Duration,

    /// Bounded mailbox size per worker
    pub queue_capacity: usize,

    /// Optional caller-side deadline per request
    pub request_timeout: Option<Duration>,

    /// Nonce synchronization settings
    pub nonce_sync: NonceSyncConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: None,
            nonce_sync: NonceSyncConfig::default(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for registry activity
#[derive(Debug, Default)]
pub struct RegistryStats {
    created: AtomicU64,
    removed: AtomicU64,
    evicted: AtomicU64,
    aborted: AtomicU64,
    dispatched: AtomicU64,
    not_found: AtomicU64,
}

impl RegistryStats {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStatsSnapshot {
    pub created: u64,
    pub removed: u64,
    pub evicted: u64,
    pub aborted: u64,
    pub dispatched: u64,
    pub not_found: u64,
}

// =============================================================================
// Registry
// =============================================================================

struct RegistryInner {
    workers: DashMap<String, WorkerHandle>,
    context: Arc<WorkerContext>,
    config: RegistryConfig,
    shutdown: CancellationToken,
    stats: RegistryStats,
}

/// Keyed directory of signing workers.
///
/// `Clone`-able (wraps an `Arc`); share one registry across all callers.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workers", &self.inner.workers.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Registry {
    pub fn new(config: RegistryConfig, connector: Arc<dyn LedgerConnector>) -> Self {
        let context = Arc::new(WorkerContext {
            connector,
            synchronizer: NonceSynchronizer::new(config.nonce_sync.clone()),
            idle_timeout: config.idle_timeout,
        });

        Self {
            inner: Arc::new(RegistryInner {
                workers: DashMap::new(),
                context,
                config,
                shutdown: CancellationToken::new(),
                stats: RegistryStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Route `request` to the worker for `key`, spawning one for Generate.
    ///
    /// Suspends until the worker has processed the request. Dropping the
    /// returned future before the worker dequeues the request withdraws it.
    pub async fn dispatch(&self, key: &str, request: Request) -> Result<Response> {
        match self.inner.config.request_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.route(key, request))
                .await
                .map_err(|_| KeywardError::Timeout)?,
            None => self.route(key, request).await,
        }
    }

    async fn route(&self, key: &str, mut request: Request) -> Result<Response> {
        RegistryStats::record(&self.inner.stats.dispatched);

        for _ in 0..MAX_ROUTE_ATTEMPTS {
            if self.inner.shutdown.is_cancelled() {
                return Err(KeywardError::Cancelled);
            }

            let handle = if request.creates_worker() {
                self.get_or_spawn(key)
            } else {
                match self.inner.workers.get(key) {
                    Some(handle) => handle.clone(),
                    None => return Err(self.not_found(key)),
                }
            };

            let op = request.name();
            debug!(%key, op, instance = %handle.instance, "Dispatching");

            let (reply, response) = oneshot::channel();
            let envelope = Envelope {
                key: key.to_string(),
                request,
                reply,
            };

            if let Err(returned) = handle.mailbox.send(envelope).await {
                // The worker closed its mailbox between lookup and send.
                self.detach(key, handle.instance);
                request = returned.0.request;
                continue;
            }

            match response.await {
                Ok(Reply::Done(result)) => return result,
                Ok(Reply::Rejected(returned)) => request = returned,
                Err(_) => {
                    // Every exit path replies, so a dropped channel means the task died.
                    if self.detach(key, handle.instance) {
                        RegistryStats::record(&self.inner.stats.aborted);
                    }
                    error!(%key, op, instance = %handle.instance, "Worker stopped without replying");
                    return Err(KeywardError::InternalInvariantViolation(format!(
                        "worker for {key} stopped while handling {op}"
                    )));
                }
            }
        }

        Err(self.not_found(key))
    }

    /// Drop the entry for `key` if it still names `instance`.
    fn detach(&self, key: &str, instance: Uuid) -> bool {
        self.inner
            .workers
            .remove_if(key, |_, handle| handle.instance == instance)
            .is_some()
    }

    fn get_or_spawn(&self, key: &str) -> WorkerHandle {
        match self.inner.workers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    let handle = self.spawn_worker(key);
                    occupied.insert(handle.clone());
                    handle
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let handle = self.spawn_worker(key);
                vacant.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn_worker(&self, key: &str) -> WorkerHandle {
        let handle = WorkerHandle::spawn(
            key.to_string(),
            Arc::clone(&self.inner.context),
            self.inner.config.queue_capacity,
            &self.inner.shutdown,
            self.exit_hook(key),
        );
        RegistryStats::record(&self.inner.stats.created);
        info!(%key, instance = %handle.instance, "Created worker");
        handle
    }

    fn exit_hook(&self, key: &str) -> ExitHook {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let key = key.to_string();

        Box::new(move |instance: Uuid, reason: ExitReason| {
            let Some(inner) = registry.upgrade() else {
                return;
            };

            let detached = inner
                .workers
                .remove_if(&key, |_, handle| handle.instance == instance)
                .is_some();

            match reason {
                ExitReason::IdleTimeout => {
                    RegistryStats::record(&inner.stats.evicted);
                    info!(%key, %instance, detached, "Evicted idle worker");
                }
                ExitReason::Aborted => {
                    RegistryStats::record(&inner.stats.aborted);
                    warn!(%key, %instance, detached, "Worker aborted");
                }
                ExitReason::Removed | ExitReason::Shutdown => {
                    debug!(%key, %instance, detached, ?reason, "Worker left registry");
                }
            }
        })
    }

    fn not_found(&self, key: &str) -> KeywardError {
        RegistryStats::record(&self.inner.stats.not_found);
        KeywardError::NotFound(key.to_string())
    }

    /// Destroy the worker for `key`.
    ///
    /// The key is unroutable as soon as this returns; a request the worker
    /// is already processing still completes.
    pub fn remove(&self, key: &str) -> Result<()> {
        let Some((_, handle)) = self.inner.workers.remove(key) else {
            return Err(self.not_found(key));
        };

        handle.cancel.cancel();
        RegistryStats::record(&self.inner.stats.removed);
        info!(%key, instance = %handle.instance, "Removed worker");
        Ok(())
    }

    /// Stop every worker and refuse further requests.
    pub fn shutdown(&self) {
        info!(workers = self.inner.workers.len(), "Shutting down registry");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of live workers
    pub fn len(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.workers.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.workers.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.workers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    // -------------------------------------------------------------------------
    // Typed operations
    // -------------------------------------------------------------------------

    /// Create (or replace) the identity for `key`, spawning its worker if needed.
    pub async fn generate(&self, key: &str, params: GenerateParams) -> Result<Address> {
        match self.dispatch(key, Request::Generate(params)).await? {
            Response::Generated { address } => Ok(address),
            other => Err(unexpected("generate", &other)),
        }
    }

    /// Sign `tx` with the identity for `key`, consuming one sequence number.
    pub async fn sign(&self, key: &str, tx: TransactionRequest) -> Result<SignedTransaction> {
        match self.dispatch(key, Request::Sign(tx)).await? {
            Response::Signed(signed) => Ok(signed),
            other => Err(unexpected("sign", &other)),
        }
    }

    /// Reconcile the identity's sequence number with its ledger.
    pub async fn sync_nonce(&self, key: &str) -> Result<SyncOutcome> {
        match self.dispatch(key, Request::SyncNonce).await? {
            Response::Synced(outcome) => Ok(outcome),
            other => Err(unexpected("sync_nonce", &other)),
        }
    }

    pub async fn address(&self, key: &str) -> Result<Address> {
        match self.dispatch(key, Request::Query(QueryKind::Address)).await? {
            Response::Address { address } => Ok(address),
            other => Err(unexpected("address", &other)),
        }
    }

    /// Next sequence number the identity will sign with.
    pub async fn nonce(&self, key: &str) -> Result<u64> {
        match self.dispatch(key, Request::Query(QueryKind::Nonce)).await? {
            Response::Nonce { sequence_number } => Ok(sequence_number),
            other => Err(unexpected("nonce", &other)),
        }
    }

    pub async fn status(&self, key: &str) -> Result<IdentityStatus> {
        match self.dispatch(key, Request::Query(QueryKind::Status)).await? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected("status", &other)),
        }
    }
}

fn unexpected(op: &str, response: &Response) -> KeywardError {
    KeywardError::InternalInvariantViolation(format!(
        "{op} produced an unexpected response: {response:?}"
    ))
}
