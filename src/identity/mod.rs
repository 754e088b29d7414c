//! Signing identities
//!
//! A [`SigningIdentity`] is the mutable state behind one key: the private
//! key, the signer algorithm, the locally cached next sequence number and
//! a handle to the ledger it transacts on.
//!
//! It has no synchronization of its own. Exactly one worker owns each
//! identity and every mutation goes through that worker's serial loop.

pub mod crypto;
pub mod transaction;

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::SigningKey;

use crate::ledger::LedgerClient;
use crate::types::{KeywardError, Result};

pub use crypto::{Address, PrivateKeyMaterial, SignerAlgorithm, PRIVATE_KEY_LEN};
pub use transaction::{SignedTransaction, Transaction, TransactionRequest, MAX_DATA_LEN};

/// One key's signing state.
pub struct SigningIdentity {
    signing_key: SigningKey,
    algorithm: SignerAlgorithm,
    address: Address,
    sequence_number: u64,
    ledger: Arc<dyn LedgerClient>,
    endpoint: String,
}

impl SigningIdentity {
    pub fn new(
        key: PrivateKeyMaterial,
        algorithm: SignerAlgorithm,
        ledger: Arc<dyn LedgerClient>,
        endpoint: String,
        initial_sequence: u64,
    ) -> Self {
        let signing_key = key.signing_key();
        let address = Address::from_verifying_key(&signing_key.verifying_key());

        Self {
            signing_key,
            algorithm,
            address,
            sequence_number: initial_sequence,
            ledger,
            endpoint,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn algorithm(&self) -> SignerAlgorithm {
        self.algorithm
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Current local sequence number, without consuming it.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Fails once the counter has reached `u64::MAX` and cannot be consumed.
    pub fn check_sequence_available(&self) -> Result<()> {
        self.successor().map(|_| ())
    }

    /// Return the current sequence number and advance past it.
    ///
    /// An exhausted counter is left where it is.
    pub fn next_sequence_number(&mut self) -> Result<u64> {
        let current = self.sequence_number;
        self.sequence_number = self.successor()?;
        Ok(current)
    }

    fn successor(&self) -> Result<u64> {
        self.sequence_number.checked_add(1).ok_or_else(|| {
            KeywardError::SigningFailed(format!(
                "sequence number exhausted at {}",
                self.sequence_number
            ))
        })
    }

    /// Adopt `remote` only if it is strictly ahead of the local value.
    ///
    /// Returns whether the local value moved.
    pub fn advance_to(&mut self, remote: u64) -> bool {
        if remote > self.sequence_number {
            self.sequence_number = remote;
            true
        } else {
            false
        }
    }

    /// Sign a nonce-bound transaction.
    ///
    /// Does not touch the sequence number; callers consume it separately.
    pub fn sign(&self, tx: &Transaction) -> Result<SignedTransaction> {
        tx.validate()?;
        self.algorithm.check_chain(tx.chain_id)?;

        let canonical = tx.canonical_bytes()?;
        let signature = self.algorithm.sign(&self.signing_key, &canonical);

        Ok(SignedTransaction::new(
            tx.clone(),
            self.algorithm,
            self.address,
            self.signing_key.verifying_key().to_bytes().to_vec(),
            &canonical,
            signature.to_vec(),
        ))
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("address", &self.address)
            .field("algorithm", &self.algorithm)
            .field("sequence_number", &self.sequence_number)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
