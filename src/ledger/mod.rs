//! Remote ledger collaborators
//!
//! The runtime only needs two things from a ledger: the authoritative
//! sequence number for an address, and somewhere to submit signed
//! transactions. Identities hold a shared `Arc<dyn LedgerClient>` obtained
//! from a [`LedgerConnector`] when they are generated.
//!
//! - **memory**: in-process ledger (`memory://<name>`), used in tests and
//!   offline runs
//! - **rpc**: JSON-RPC 2.0 over HTTP(S)

pub mod memory;
pub mod rpc;

use std::sync::Arc;

use async_trait::async_trait;

use crate::identity::{Address, SignedTransaction};
use crate::types::LedgerError;

pub use memory::{MemoryConnector, MemoryLedger, MEMORY_SCHEME};
pub use rpc::{RpcConnector, RpcLedgerClient};

/// Client handle to a remote ledger. Must be safe to share across workers.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Authoritative next sequence number for `address`.
    async fn nonce_at(&self, address: &Address) -> Result<u64, LedgerError>;

    /// Submit a signed transaction, returning the ledger's transaction hash.
    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, LedgerError>;
}

/// Establishes ledger client handles for an endpoint string.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn LedgerClient>, LedgerError>;
}

/// Routes `memory://` endpoints to the in-process ledger and everything
/// else to JSON-RPC.
pub struct EndpointConnector {
    memory: MemoryConnector,
    rpc: RpcConnector,
}

impl EndpointConnector {
    pub fn new(memory: MemoryConnector, rpc: RpcConnector) -> Self {
        Self { memory, rpc }
    }

    pub fn memory(&self) -> &MemoryConnector {
        &self.memory
    }
}

#[async_trait]
impl LedgerConnector for EndpointConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn LedgerClient>, LedgerError> {
        if endpoint.starts_with(MEMORY_SCHEME) {
            self.memory.connect(endpoint).await
        } else {
            self.rpc.connect(endpoint).await
        }
    }
}
