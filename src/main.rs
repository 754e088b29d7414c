//! Keyward - keyed signing identity runtime
//!
//! Line-oriented driver: one command per stdin line, one JSON object per
//! stdout line.

use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyward::{
    config::Args,
    ledger::{EndpointConnector, MemoryConnector, RpcConnector},
    Address, GenerateParams, KeywardError, PrivateKeyMaterial, Registry, SignerAlgorithm,
    TransactionRequest,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Logs go to stderr; stdout carries responses only
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keyward={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Keyward - keyed signing runtime");
    info!("======================================");
    info!("Idle timeout: {}s", args.idle_timeout_secs);
    info!("Queue capacity: {}", args.queue_capacity);
    info!("Nonce sync attempts: {}", args.nonce_sync_attempts);
    info!("Default ledger: {}", args.ledger_url);
    info!("======================================");

    let rpc = RpcConnector::new(args.ledger_timeout())?;
    let connector = Arc::new(EndpointConnector::new(MemoryConnector::new(), rpc));
    let registry = Registry::new(args.registry_config(), connector);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received ctrl-c");
                break;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match Command::parse(line, &args.ledger_url) {
            Ok(Command::Quit) => break,
            Ok(command) => command,
            Err(message) => {
                println!("{}", json!({ "ok": false, "error": { "kind": "usage", "message": message } }));
                continue;
            }
        };

        println!("{}", command.execute(&registry).await);
    }

    registry.shutdown();
    info!("Keyward stopped");
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug)]
enum Command {
    Generate { key: String, params: GenerateParams },
    Sign { key: String, tx: TransactionRequest },
    Sync { key: String },
    Address { key: String },
    Nonce { key: String },
    Status { key: String },
    Remove { key: String },
    Stats,
    Quit,
}

impl Command {
    fn parse(line: &str, default_endpoint: &str) -> Result<Self, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let (name, rest) = words.split_first().ok_or("empty command")?;

        let key = || {
            rest.first()
                .map(|k| k.to_string())
                .ok_or_else(|| format!("usage: {name} <key>"))
        };

        match *name {
            "generate" => {
                let [key, private_key, optional @ ..] = rest else {
                    return Err(
                        "usage: generate <key> <private-key-hex> [endpoint] [chain-id]".into(),
                    );
                };
                let private_key =
                    PrivateKeyMaterial::from_hex(private_key).map_err(|e| e.to_string())?;
                let endpoint = optional.first().copied().unwrap_or(default_endpoint);

                let mut params = GenerateParams::new(endpoint, private_key);
                if let Some(chain_id) = optional.get(1) {
                    let chain_id = chain_id
                        .parse()
                        .map_err(|_| format!("invalid chain id: {chain_id}"))?;
                    params = params.with_algorithm(SignerAlgorithm::ChainBound { chain_id });
                }

                Ok(Self::Generate {
                    key: key.to_string(),
                    params,
                })
            }
            "sign" => {
                let [key, to, value, optional @ ..] = rest else {
                    return Err("usage: sign <key> <to> <value> [data-hex]".into());
                };
                let to: Address = to.parse().map_err(|e: KeywardError| e.to_string())?;
                let value = value
                    .parse()
                    .map_err(|_| format!("invalid value: {value}"))?;

                let mut tx = TransactionRequest::transfer(to, value);
                if let Some(data) = optional.first() {
                    let data = hex::decode(data.trim_start_matches("0x"))
                        .map_err(|e| format!("invalid data: {e}"))?;
                    tx = tx.with_data(data);
                }

                Ok(Self::Sign {
                    key: key.to_string(),
                    tx,
                })
            }
            "sync" => Ok(Self::Sync { key: key()? }),
            "address" => Ok(Self::Address { key: key()? }),
            "nonce" => Ok(Self::Nonce { key: key()? }),
            "status" => Ok(Self::Status { key: key()? }),
            "remove" => Ok(Self::Remove { key: key()? }),
            "stats" => Ok(Self::Stats),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }

    async fn execute(self, registry: &Registry) -> Value {
        let result = match self {
            Self::Generate { key, params } => registry
                .generate(&key, params)
                .await
                .map(|address| json!({ "key": key, "address": address })),
            Self::Sign { key, tx } => registry
                .sign(&key, tx)
                .await
                .map(|signed| json!(signed)),
            Self::Sync { key } => registry
                .sync_nonce(&key)
                .await
                .map(|outcome| json!(outcome)),
            Self::Address { key } => registry
                .address(&key)
                .await
                .map(|address| json!({ "address": address })),
            Self::Nonce { key } => registry
                .nonce(&key)
                .await
                .map(|nonce| json!({ "sequence_number": nonce })),
            Self::Status { key } => registry
                .status(&key)
                .await
                .map(|status| json!(status)),
            Self::Remove { key } => registry
                .remove(&key)
                .map(|()| json!({ "removed": key })),
            Self::Stats => Ok(json!({
                "workers": registry.len(),
                "stats": registry.stats(),
            })),
            Self::Quit => Ok(Value::Null),
        };

        match result {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => json!({
                "ok": false,
                "error": {
                    "kind": e.kind(),
                    "message": e.to_string(),
                    "retryable": e.is_retryable(),
                },
            }),
        }
    }
}
