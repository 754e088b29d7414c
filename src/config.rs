//! Configuration for Keyward
//!
//! CLI arguments and environment variable handling using clap.

use std::time::Duration;

use clap::Parser;

use crate::nonce::NonceSyncConfig;
use crate::registry::RegistryConfig;
use crate::types::{KeywardError, Result};

/// Keyward - keyed signing identity runtime
#[derive(Parser, Debug, Clone)]
#[command(name = "keyward")]
#[command(about = "Serial per-key signing workers with ledger nonce sync")]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds a worker may sit without a request before it is evicted
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value = "600")]
    pub idle_timeout_secs: u64,

    /// Bounded mailbox size per worker
    #[arg(long, env = "QUEUE_CAPACITY", default_value = "64")]
    pub queue_capacity: usize,

    /// Caller-side deadline per request in milliseconds (unset = wait forever)
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Ledger lookups per nonce sync before giving up
    #[arg(long, env = "NONCE_SYNC_ATTEMPTS", default_value = "10")]
    pub nonce_sync_attempts: u32,

    /// Delay between failed nonce lookups in milliseconds
    #[arg(long, env = "NONCE_SYNC_BACKOFF_MS", default_value = "0")]
    pub nonce_sync_backoff_ms: u64,

    /// Ledger endpoint used when `generate` does not name one
    /// (`memory://<name>` for the in-process ledger, or an http(s) JSON-RPC URL)
    #[arg(long, env = "LEDGER_URL", default_value = "memory://default")]
    pub ledger_url: String,

    /// HTTP timeout for JSON-RPC ledger calls in milliseconds
    #[arg(long, env = "LEDGER_TIMEOUT_MS", default_value = "10000")]
    pub ledger_timeout_ms: u64,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            return Err(KeywardError::Config(
                "IDLE_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(KeywardError::Config(
                "QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        if self.nonce_sync_attempts == 0 {
            return Err(KeywardError::Config(
                "NONCE_SYNC_ATTEMPTS must be greater than zero".to_string(),
            ));
        }

        if self.request_timeout_ms == Some(0) {
            return Err(KeywardError::Config(
                "REQUEST_TIMEOUT_MS must be greater than zero when set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            queue_capacity: self.queue_capacity,
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            nonce_sync: NonceSyncConfig {
                max_attempts: self.nonce_sync_attempts,
                backoff: Duration::from_millis(self.nonce_sync_backoff_ms),
            },
        }
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }
}
