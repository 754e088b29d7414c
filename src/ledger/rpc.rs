//! JSON-RPC 2.0 ledger client over HTTP(S).
//!
//! One `reqwest::Client` (and therefore one connection pool) is shared by
//! every endpoint handle; handles themselves are cached per endpoint so
//! identities generated against the same ledger share a client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use super::{LedgerClient, LedgerConnector};
use crate::identity::{Address, SignedTransaction};
use crate::types::LedgerError;

/// RPC method returning the next sequence number for an address
pub const METHOD_NONCE_AT: &str = "keyward_getTransactionCount";

/// RPC method accepting a signed transaction
pub const METHOD_SEND_TRANSACTION: &str = "keyward_sendTransaction";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Ledger client bound to one JSON-RPC endpoint
pub struct RpcLedgerClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: JsonValue,
    ) -> Result<T, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(endpoint = %self.endpoint, method, id, "Ledger RPC call");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let envelope: RpcResponse = response.json().await?;
        let result = decode_envelope(envelope)?;

        serde_json::from_value(result).map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }
}

fn decode_envelope(envelope: RpcResponse) -> Result<JsonValue, LedgerError> {
    if let Some(error) = envelope.error {
        return Err(LedgerError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    envelope
        .result
        .ok_or_else(|| LedgerError::InvalidResponse("response has neither result nor error".into()))
}

/// Parse a quantity returned either as a JSON number or a `0x` hex string.
pub(crate) fn parse_quantity(value: &JsonValue) -> Result<u64, LedgerError> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("not a u64: {n}"))),
        JsonValue::String(s) => {
            let digits = s
                .strip_prefix("0x")
                .ok_or_else(|| LedgerError::InvalidResponse(format!("quantity without 0x: {s}")))?;
            u64::from_str_radix(digits, 16)
                .map_err(|e| LedgerError::InvalidResponse(format!("bad quantity {s}: {e}")))
        }
        other => Err(LedgerError::InvalidResponse(format!(
            "unexpected quantity type: {other}"
        ))),
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn nonce_at(&self, address: &Address) -> Result<u64, LedgerError> {
        let value: JsonValue = self
            .call(METHOD_NONCE_AT, json!([address.to_string(), "latest"]))
            .await?;
        parse_quantity(&value)
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, LedgerError> {
        let params = serde_json::to_value(tx)
            .map_err(|e| LedgerError::InvalidResponse(format!("encode transaction: {e}")))?;
        self.call(METHOD_SEND_TRANSACTION, json!([params])).await
    }
}

/// Hands out pooled JSON-RPC clients for `http://` and `https://` endpoints
pub struct RpcConnector {
    http: reqwest::Client,
    clients: DashMap<String, Arc<RpcLedgerClient>>,
}

impl RpcConnector {
    pub fn new(request_timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            clients: DashMap::new(),
        })
    }

    /// Number of distinct endpoints with a cached client
    pub fn endpoint_count(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait]
impl LedgerConnector for RpcConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn LedgerClient>, LedgerError> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(LedgerError::UnsupportedEndpoint(endpoint.to_string()));
        }

        let client = self
            .clients
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(RpcLedgerClient::new(self.http.clone(), endpoint)))
            .clone();

        let client: Arc<dyn LedgerClient> = client;
        Ok(client)
    }
}
