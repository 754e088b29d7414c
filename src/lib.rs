//! Keyward - keyed signing identity runtime
//!
//! Every key owns one worker: a spawned task holding a single signing
//! identity and processing its requests strictly one at a time, so sequence
//! numbers are handed out without gaps or duplicates.
//!
//! ## Components
//!
//! - **Registry**: key → worker directory; creates workers on Generate,
//!   routes everything else, removes and evicts
//! - **Worker**: serial request loop with an idle timeout
//! - **Identity**: private key, signer algorithm, address and local sequence number
//! - **Nonce**: bounded reconciliation of the sequence number with the ledger
//! - **Ledger**: client seam for the remote ledger (JSON-RPC or in-memory)

pub mod config;
pub mod identity;
pub mod ledger;
pub mod nonce;
pub mod registry;
pub mod types;
pub mod worker;

pub use config::Args;
pub use identity::{
    Address, PrivateKeyMaterial, SignedTransaction, SignerAlgorithm, SigningIdentity,
    Transaction, TransactionRequest,
};
pub use nonce::{NonceSyncConfig, NonceSynchronizer, SyncOutcome};
pub use registry::{Registry, RegistryConfig, RegistryStatsSnapshot};
pub use types::{KeywardError, LedgerError, Result};
pub use worker::{GenerateParams, IdentityStatus, QueryKind, Request, Response};
