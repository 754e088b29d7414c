//! Sequence number reconciliation against the ledger.
//!
//! The local sequence number runs ahead of the ledger while transactions are
//! in flight, so a remote read is only adopted when it is strictly greater.
//! A successful read that does not advance the local value still ends the
//! loop: only failed lookups consume the attempt budget.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::identity::SigningIdentity;
use crate::types::{KeywardError, LedgerError, Result};

/// Default attempt bound for ledger lookups
pub const DEFAULT_SYNC_ATTEMPTS: u32 = 10;

/// Configuration for nonce synchronization
#[derive(Debug, Clone)]
pub struct NonceSyncConfig {
    /// Maximum number of `nonce_at` lookups per sync
    pub max_attempts: u32,

    /// Delay after a failed lookup before the next one (zero = retry immediately)
    pub backoff: Duration,
}

impl Default for NonceSyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SYNC_ATTEMPTS,
            backoff: Duration::ZERO,
        }
    }
}

/// Result of a successful sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The ledger was ahead; the local value moved forward.
    Adopted { previous: u64, current: u64 },
    /// The ledger answered with an equal or lower value; nothing changed.
    Unchanged { local: u64, remote: u64 },
}

impl SyncOutcome {
    /// Local sequence number after the sync
    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Adopted { current, .. } => *current,
            Self::Unchanged { local, .. } => *local,
        }
    }
}

/// Reconciles an identity's local sequence number with its ledger
#[derive(Debug, Clone, Default)]
pub struct NonceSynchronizer {
    config: NonceSyncConfig,
}

impl NonceSynchronizer {
    pub fn new(config: NonceSyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NonceSyncConfig {
        &self.config
    }

    /// Run one reconciliation against `identity`'s ledger.
    ///
    /// On failure the identity is left exactly as it was.
    pub async fn sync(&self, identity: &mut SigningIdentity) -> Result<SyncOutcome> {
        let ledger = Arc::clone(identity.ledger());
        let address = *identity.address();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error: Option<LedgerError> = None;

        for attempt in 1..=max_attempts {
            match ledger.nonce_at(&address).await {
                Ok(remote) => {
                    let local = identity.sequence_number();
                    if identity.advance_to(remote) {
                        info!(
                            %address,
                            previous = local,
                            current = remote,
                            attempt,
                            "Adopted ledger sequence number"
                        );
                        return Ok(SyncOutcome::Adopted {
                            previous: local,
                            current: remote,
                        });
                    }

                    debug!(%address, local, remote, attempt, "Local sequence number is current");
                    return Ok(SyncOutcome::Unchanged { local, remote });
                }
                Err(error) => {
                    warn!(
                        %address,
                        attempt,
                        max_attempts,
                        error = %error,
                        "Ledger nonce lookup failed"
                    );
                    last_error = Some(error);

                    if attempt < max_attempts && !self.config.backoff.is_zero() {
                        tokio::time::sleep(self.config.backoff).await;
                    }
                }
            }
        }

        Err(KeywardError::NonceSyncFailed {
            attempts: max_attempts,
            source: last_error
                .unwrap_or_else(|| LedgerError::Transport("no lookup attempted".into())),
        })
    }
}
