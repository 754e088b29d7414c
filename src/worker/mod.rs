//! Worker module - one serial actor per key
//!
//! Each worker is a spawned task that owns exactly one signing identity and
//! a bounded mailbox. Requests are processed one at a time in the order they
//! are accepted, so the identity's sequence number is never touched
//! concurrently. A worker that sees no accepted request for its idle
//! timeout leaves on its own.

pub mod actor;
pub mod request;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use actor::ExitReason;
pub use request::{GenerateParams, IdentityStatus, Lifecycle, QueryKind, Request, Response};

pub(crate) use actor::{ExitHook, Worker, WorkerContext};
pub(crate) use request::{Envelope, Reply};

/// Routing handle held by the registry for a live worker
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub instance: Uuid,
    pub mailbox: mpsc::Sender<Envelope>,
    pub cancel: CancellationToken,
}

impl WorkerHandle {
    /// Spawn a worker task for `key` and return its handle.
    ///
    /// `shutdown` is the registry-wide token; the worker listens on a child
    /// of it so it can also be stopped on its own.
    pub fn spawn(
        key: String,
        context: Arc<WorkerContext>,
        mailbox_capacity: usize,
        shutdown: &CancellationToken,
        on_exit: ExitHook,
    ) -> Self {
        let (mailbox, inbox) = mpsc::channel(mailbox_capacity.max(1));
        let instance = Uuid::new_v4();
        let cancel = shutdown.child_token();

        let worker = Worker::new(key, instance, context);
        tokio::spawn(worker.run(inbox, cancel.clone(), shutdown.clone(), on_exit));

        Self {
            instance,
            mailbox,
            cancel,
        }
    }

    /// Whether the worker behind this handle has stopped taking mail
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}
