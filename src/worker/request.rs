//! Requests accepted by a worker and the responses it produces.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::identity::{Address, PrivateKeyMaterial, SignedTransaction, SignerAlgorithm, TransactionRequest};
use crate::nonce::SyncOutcome;
use crate::types::Result;

/// Parameters for (re)generating a worker's identity
#[derive(Debug, Clone)]
pub struct GenerateParams {
    /// Ledger endpoint the identity transacts on
    pub endpoint: String,
    pub private_key: PrivateKeyMaterial,
    pub algorithm: SignerAlgorithm,
    /// Starting sequence number (0 for a fresh account)
    pub initial_sequence: u64,
}

impl GenerateParams {
    pub fn new(endpoint: impl Into<String>, private_key: PrivateKeyMaterial) -> Self {
        Self {
            endpoint: endpoint.into(),
            private_key,
            algorithm: SignerAlgorithm::default(),
            initial_sequence: 0,
        }
    }

    pub fn with_algorithm(mut self, algorithm: SignerAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_initial_sequence(mut self, initial_sequence: u64) -> Self {
        self.initial_sequence = initial_sequence;
        self
    }
}

/// Read-only inspections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Address,
    Nonce,
    Status,
}

/// Operations a worker performs against its identity
#[derive(Debug)]
pub enum Request {
    Generate(GenerateParams),
    Sign(TransactionRequest),
    SyncNonce,
    Query(QueryKind),
}

impl Request {
    /// Only Generate may bring a worker into existence.
    pub fn creates_worker(&self) -> bool {
        matches!(self, Self::Generate(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Generate(_) => "generate",
            Self::Sign(_) => "sign",
            Self::SyncNonce => "sync_nonce",
            Self::Query(QueryKind::Address) => "query_address",
            Self::Query(QueryKind::Nonce) => "query_nonce",
            Self::Query(QueryKind::Status) => "query_status",
        }
    }
}

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Destroyed,
}

/// Snapshot of an active identity
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub key: String,
    pub address: Address,
    pub sequence_number: u64,
    pub algorithm: SignerAlgorithm,
    pub endpoint: String,
    pub lifecycle: Lifecycle,
    pub last_activity: DateTime<Utc>,
}

/// Worker replies
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Generated { address: Address },
    Signed(SignedTransaction),
    Synced(SyncOutcome),
    Address { address: Address },
    Nonce { sequence_number: u64 },
    Status(IdentityStatus),
}

/// What comes back on an envelope's reply channel
pub(crate) enum Reply {
    /// The worker accepted and processed the request.
    Done(Result<Response>),
    /// The worker was already leaving; the request was never accepted.
    Rejected(Request),
}

/// A request in flight to a worker, with the channel its reply goes back on
pub(crate) struct Envelope {
    pub key: String,
    pub request: Request,
    pub reply: oneshot::Sender<Reply>,
}
