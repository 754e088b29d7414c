//! In-process ledger.
//!
//! Keeps per-address sequence numbers and accepted transactions in memory.
//! Failures for `nonce_at` can be scripted so the nonce synchronizer can be
//! driven through its retry path deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{LedgerClient, LedgerConnector};
use crate::identity::{Address, SignedTransaction};
use crate::types::LedgerError;

/// Endpoint prefix resolved by [`MemoryConnector`]
pub const MEMORY_SCHEME: &str = "memory://";

/// In-memory ledger state.
#[derive(Default)]
pub struct MemoryLedger {
    nonces: DashMap<Address, u64>,
    scripted_failures: Mutex<VecDeque<LedgerError>>,
    nonce_calls: AtomicU64,
    submitted: Mutex<Vec<SignedTransaction>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the authoritative sequence number for an address.
    pub fn set_nonce(&self, address: &Address, nonce: u64) {
        self.nonces.insert(*address, nonce);
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.nonces.get(address).map(|n| *n).unwrap_or(0)
    }

    /// Make the next `count` calls to `nonce_at` fail with `error`.
    pub fn fail_next(&self, count: usize, error: LedgerError) {
        let mut failures = self
            .scripted_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Number of `nonce_at` calls observed, failed ones included.
    pub fn nonce_calls(&self) -> u64 {
        self.nonce_calls.load(Ordering::Relaxed)
    }

    /// Transactions accepted so far, in submission order.
    pub fn submitted(&self) -> Vec<SignedTransaction> {
        self.submitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_failure(&self) -> Option<LedgerError> {
        self.scripted_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn nonce_at(&self, address: &Address) -> Result<u64, LedgerError> {
        self.nonce_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = self.next_failure() {
            debug!(%address, %error, "Scripted nonce_at failure");
            return Err(error);
        }

        Ok(self.nonce(address))
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, LedgerError> {
        if !tx.verify() {
            return Err(LedgerError::Rpc {
                code: -32000,
                message: "invalid signature".into(),
            });
        }

        let mut entry = self.nonces.entry(tx.signer).or_insert(0);
        if tx.nonce() < *entry {
            return Err(LedgerError::Rpc {
                code: -32000,
                message: format!("nonce too low: next is {}, got {}", *entry, tx.nonce()),
            });
        }
        *entry = tx.nonce().saturating_add(1);
        drop(entry);

        self.submitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx.clone());

        Ok(tx.hash.clone())
    }
}

/// Resolves `memory://<name>` endpoints to shared named ledgers.
#[derive(Default)]
pub struct MemoryConnector {
    ledgers: DashMap<String, Arc<MemoryLedger>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the ledger behind `memory://<name>`.
    pub fn ledger(&self, name: &str) -> Arc<MemoryLedger> {
        self.ledgers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryLedger::new()))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }
}

#[async_trait]
impl LedgerConnector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn LedgerClient>, LedgerError> {
        let name = endpoint
            .strip_prefix(MEMORY_SCHEME)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| LedgerError::UnsupportedEndpoint(endpoint.to_string()))?;

        let ledger: Arc<dyn LedgerClient> = self.ledger(name);
        Ok(ledger)
    }
}
