//! Registry integration tests against the public API

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};

use keyward::ledger::{LedgerClient, MemoryConnector, MemoryLedger};
use keyward::{
    Address, GenerateParams, KeywardError, LedgerError, NonceSyncConfig, PrivateKeyMaterial,
    Registry, RegistryConfig, SignerAlgorithm, SyncOutcome, TransactionRequest,
};

const ENDPOINT: &str = "memory://it";

fn setup(config: RegistryConfig) -> (Registry, Arc<MemoryLedger>) {
    let connector = Arc::new(MemoryConnector::new());
    let ledger = connector.ledger("it");
    (Registry::new(config, connector), ledger)
}

fn key_material(seed: u8) -> PrivateKeyMaterial {
    PrivateKeyMaterial::from_bytes([seed; 32])
}

fn recipient() -> Address {
    "0x000000000000000000000000000000000000beef".parse().unwrap()
}

#[tokio::test]
async fn test_concurrent_signs_get_contiguous_nonces() {
    let (registry, _) = setup(RegistryConfig {
        queue_capacity: 4,
        ..Default::default()
    });
    assert_ok!(registry.generate("alice", GenerateParams::new(ENDPOINT, key_material(1))).await);

    let signs = (0..50u64).map(|value| {
        let registry = registry.clone();
        async move { registry.sign("alice", TransactionRequest::transfer(recipient(), value)).await }
    });

    let mut nonces: Vec<u64> = join_all(signs)
        .await
        .into_iter()
        .map(|result| assert_ok!(result).nonce())
        .collect();
    nonces.sort_unstable();

    assert_eq!(nonces, (0..50).collect::<Vec<_>>());
    assert_eq!(assert_ok!(registry.nonce("alice").await), 50);
}

#[tokio::test]
async fn test_keys_are_isolated() {
    let (registry, _) = setup(RegistryConfig::default());

    let alice = assert_ok!(registry.generate("alice", GenerateParams::new(ENDPOINT, key_material(1))).await);
    let bob = assert_ok!(registry.generate("bob", GenerateParams::new(ENDPOINT, key_material(2))).await);
    assert_ne!(alice, bob);

    for _ in 0..3 {
        assert_ok!(registry.sign("alice", TransactionRequest::transfer(recipient(), 1)).await);
    }
    let signed = assert_ok!(registry.sign("bob", TransactionRequest::transfer(recipient(), 1)).await);

    assert_eq!(signed.nonce(), 0);
    assert_eq!(signed.signer, bob);
    assert_eq!(assert_ok!(registry.nonce("alice").await), 3);

    assert_ok!(registry.remove("alice"));
    assert_eq!(assert_ok!(registry.nonce("bob").await), 1);

    let keys: HashSet<String> = registry.keys().into_iter().collect();
    assert_eq!(keys, HashSet::from(["bob".to_string()]));
}

#[tokio::test]
async fn test_exhausted_sequence_refuses_to_sign() {
    let (registry, ledger) = setup(RegistryConfig::default());
    let params = GenerateParams::new(ENDPOINT, key_material(11)).with_initial_sequence(u64::MAX);
    assert_ok!(registry.generate("alice", params).await);

    let err = assert_err!(registry.sign("alice", TransactionRequest::transfer(recipient(), 1)).await);
    assert!(matches!(err, KeywardError::SigningFailed(_)));

    assert_eq!(assert_ok!(registry.nonce("alice").await), u64::MAX);
    assert_eq!(registry.len(), 1);
    assert!(ledger.submitted().is_empty());
}

#[tokio::test]
async fn test_signed_transactions_are_accepted_by_ledger() {
    let (registry, ledger) = setup(RegistryConfig::default());
    assert_ok!(
        registry
            .generate(
                "alice",
                GenerateParams::new(ENDPOINT, key_material(3))
                    .with_algorithm(SignerAlgorithm::ChainBound { chain_id: 5 }),
            )
            .await
    );

    for value in 0..3 {
        let signed = assert_ok!(
            registry
                .sign("alice", TransactionRequest::transfer(recipient(), value).on_chain(5))
                .await
        );
        assert!(signed.verify());
        assert_ok!(ledger.send_transaction(&signed).await);
    }
    assert_eq!(ledger.submitted().len(), 3);

    let mismatched = registry
        .sign("alice", TransactionRequest::transfer(recipient(), 9).on_chain(6))
        .await;
    assert!(matches!(mismatched, Err(KeywardError::SigningFailed(_))));
    assert_eq!(assert_ok!(registry.nonce("alice").await), 3);
}

#[tokio::test]
async fn test_recreated_identity_recovers_sequence_from_ledger() {
    let (registry, ledger) = setup(RegistryConfig::default());
    let params = || GenerateParams::new(ENDPOINT, key_material(4));

    assert_ok!(registry.generate("alice", params()).await);
    for value in 0..4 {
        let signed = assert_ok!(registry.sign("alice", TransactionRequest::transfer(recipient(), value)).await);
        assert_ok!(ledger.send_transaction(&signed).await);
    }

    assert_ok!(registry.remove("alice"));
    assert_ok!(registry.generate("alice", params()).await);
    assert_eq!(assert_ok!(registry.nonce("alice").await), 0);

    let outcome = assert_ok!(registry.sync_nonce("alice").await);
    assert_eq!(outcome, SyncOutcome::Adopted { previous: 0, current: 4 });

    let signed = assert_ok!(registry.sign("alice", TransactionRequest::transfer(recipient(), 1)).await);
    assert_eq!(signed.nonce(), 4);
    assert_ok!(ledger.send_transaction(&signed).await);
}

#[tokio::test]
async fn test_exhausted_sync_reports_and_preserves_sequence() {
    let (registry, ledger) = setup(RegistryConfig::default());
    let address = assert_ok!(
        registry
            .generate("alice", GenerateParams::new(ENDPOINT, key_material(5)).with_initial_sequence(7))
            .await
    );
    ledger.set_nonce(&address, 100);
    ledger.fail_next(10, LedgerError::Transport("unreachable".into()));

    let err = assert_err!(registry.sync_nonce("alice").await);
    assert!(matches!(err, KeywardError::NonceSyncFailed { attempts: 10, .. }));
    assert!(err.is_retryable());
    assert_eq!(assert_ok!(registry.nonce("alice").await), 7);

    // The worker is still serving; a retry reaches the ledger.
    let outcome = assert_ok!(registry.sync_nonce("alice").await);
    assert_eq!(outcome.sequence_number(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_idle_eviction_then_fresh_worker() {
    let (registry, _) = setup(RegistryConfig {
        idle_timeout: Duration::from_secs(30),
        ..Default::default()
    });
    let params = || GenerateParams::new(ENDPOINT, key_material(6));

    assert_ok!(registry.generate("alice", params()).await);
    assert_ok!(registry.sign("alice", TransactionRequest::transfer(recipient(), 1)).await);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(registry.is_empty());

    let err = assert_err!(registry.sign("alice", TransactionRequest::transfer(recipient(), 1)).await);
    assert!(matches!(err, KeywardError::NotFound(_)));

    assert_ok!(registry.generate("alice", params()).await);
    let signed = assert_ok!(registry.sign("alice", TransactionRequest::transfer(recipient(), 1)).await);
    assert_eq!(signed.nonce(), 0);

    let stats = registry.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.evicted, 1);
}

#[tokio::test]
async fn test_remove_twice() {
    let (registry, _) = setup(RegistryConfig::default());
    assert_ok!(registry.generate("alice", GenerateParams::new(ENDPOINT, key_material(7))).await);

    assert_ok!(registry.remove("alice"));
    let err = assert_err!(registry.remove("alice"));
    assert!(matches!(err, KeywardError::NotFound(key) if key == "alice"));
    assert_eq!(registry.stats().removed, 1);
}

fn slow_sync_config() -> RegistryConfig {
    RegistryConfig {
        nonce_sync: NonceSyncConfig {
            max_attempts: 10,
            backoff: Duration::from_secs(1),
        },
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_remove_completes_accepted_request_and_rejects_queued() {
    let (registry, ledger) = setup(slow_sync_config());
    let address = assert_ok!(registry.generate("alice", GenerateParams::new(ENDPOINT, key_material(8))).await);
    ledger.set_nonce(&address, 9);
    ledger.fail_next(3, LedgerError::Transport("flaky".into()));

    let sync = tokio::spawn({
        let registry = registry.clone();
        async move { registry.sync_nonce("alice").await }
    });
    // The worker is now inside its first backoff.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queued = tokio::spawn({
        let registry = registry.clone();
        async move { registry.nonce("alice").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!queued.is_finished());

    assert_ok!(registry.remove("alice"));
    assert!(!registry.contains("alice"));

    let outcome = assert_ok!(sync.await.unwrap());
    assert_eq!(outcome, SyncOutcome::Adopted { previous: 0, current: 9 });

    let err = assert_err!(queued.await.unwrap());
    assert!(matches!(err, KeywardError::NotFound(key) if key == "alice"));
}

#[tokio::test(start_paused = true)]
async fn test_busy_key_does_not_block_other_keys() {
    let connector = Arc::new(MemoryConnector::new());
    let slow_ledger = connector.ledger("slow");
    let registry = Registry::new(slow_sync_config(), connector);

    let slow = assert_ok!(
        registry
            .generate("slow", GenerateParams::new("memory://slow", key_material(9)))
            .await
    );
    assert_ok!(
        registry
            .generate("fast", GenerateParams::new("memory://fast", key_material(10)))
            .await
    );
    slow_ledger.set_nonce(&slow, 20);
    slow_ledger.fail_next(5, LedgerError::Transport("congested".into()));

    let sync = tokio::spawn({
        let registry = registry.clone();
        async move { registry.sync_nonce("slow").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Signs for the busy key queue behind its sync.
    let queued_signs = tokio::spawn({
        let registry = registry.clone();
        async move {
            join_all((0..5).map(|value| {
                registry.sign("slow", TransactionRequest::transfer(recipient(), value))
            }))
            .await
        }
    });

    let started = tokio::time::Instant::now();
    let fast_signs = join_all((0..20).map(|value| {
        registry.sign("fast", TransactionRequest::transfer(recipient(), value))
    }))
    .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!sync.is_finished());

    let mut fast_nonces: Vec<u64> = fast_signs
        .into_iter()
        .map(|result| assert_ok!(result).nonce())
        .collect();
    fast_nonces.sort_unstable();
    assert_eq!(fast_nonces, (0..20).collect::<Vec<_>>());

    assert_eq!(assert_ok!(sync.await.unwrap()).sequence_number(), 20);

    let mut slow_nonces: Vec<u64> = queued_signs
        .await
        .unwrap()
        .into_iter()
        .map(|result| assert_ok!(result).nonce())
        .collect();
    slow_nonces.sort_unstable();
    assert_eq!(slow_nonces, (20..25).collect::<Vec<_>>());
}
