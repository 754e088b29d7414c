//! Error types for Keyward
//!
//! `KeywardError` is returned by every registry and worker operation.
//! `LedgerError` is what the remote ledger collaborators produce; it is
//! wrapped rather than flattened so the nonce synchronizer can report the
//! last transport failure as the cause of an exhausted retry budget.

/// Errors raised by the ledger collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),

    #[error("Unsupported ledger endpoint: {0}")]
    UnsupportedEndpoint(String),
}

impl LedgerError {
    /// Whether the failure is connectivity rather than a ledger verdict
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Main error type for Keyward operations
#[derive(Debug, thiserror::Error)]
pub enum KeywardError {
    #[error("Not found: no live worker for key {0}")]
    NotFound(String),

    #[error("Identity not initialized for key {0}")]
    IdentityNotInitialized(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Nonce sync failed after {attempts} attempts: {source}")]
    NonceSyncFailed {
        attempts: u32,
        #[source]
        source: LedgerError,
    },

    #[error("Internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Request timed out")]
    Timeout,

    #[error("Registry is shut down")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KeywardError {
    /// Whether the caller can safely retry the same request.
    ///
    /// A failed sync leaves local state untouched, so it is always retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NonceSyncFailed { .. } | Self::Timeout => true,
            Self::Ledger(e) => e.is_transport(),
            _ => false,
        }
    }

    /// Short machine-readable kind, used in log fields and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::IdentityNotInitialized(_) => "identity_not_initialized",
            Self::SigningFailed(_) => "signing_failed",
            Self::NonceSyncFailed { .. } => "nonce_sync_failed",
            Self::InternalInvariantViolation(_) => "internal_invariant_violation",
            Self::InvalidKeyMaterial(_) => "invalid_key_material",
            Self::Ledger(_) => "ledger",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
        }
    }
}

impl From<rmp_serde::encode::Error> for KeywardError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::SigningFailed(format!("transaction encoding: {}", err))
    }
}

/// Result type alias for Keyward operations
pub type Result<T> = std::result::Result<T, KeywardError>;
