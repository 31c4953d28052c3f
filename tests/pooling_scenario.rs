use std::sync::Arc;
use swell::committee::{Committee, Pool};
use swell::crypto::{Hash, KeyPair};
use swell::network::{InMemoryNetwork, Transport};
use swell::pooling::{launch, Consensus, Pooling, PoolingConfig, PoolingMessage};
use swell::types::Validator;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

const EPOCH: u64 = 7;

fn committee(n: usize) -> (Vec<Arc<KeyPair>>, Pool) {
    let keys: Vec<Arc<KeyPair>> = (0..n)
        .map(|i| Arc::new(KeyPair::from_seed(&[i as u8 + 40; 32])))
        .collect();
    let validators = keys
        .iter()
        .enumerate()
        .map(|(i, k)| Validator {
            token: k.token(),
            address: format!("validator-{i}"),
            weight: 1,
        })
        .collect();
    let committee = Committee::new(validators, Hash::of(b"scenario seed"));
    let pool = committee.pool(EPOCH, 32);
    (keys, pool)
}

fn config(pool: &Pool) -> PoolingConfig {
    PoolingConfig {
        timeout_propose: Duration::from_millis(150),
        timeout_vote: Duration::from_millis(150),
        timeout_commit: Duration::from_millis(150),
        ..PoolingConfig::default()
    }
    .for_pool(pool)
}

/// Runs one engine per online member over an in-memory network. Member `i`
/// seals `seal(i)` after `10 * i` ms.
async fn run_pool(
    keys: &[Arc<KeyPair>],
    pool: &Pool,
    config: PoolingConfig,
    offline: &[usize],
    seal: impl Fn(usize) -> Option<Hash>,
) -> Vec<Option<Consensus>> {
    let network = InMemoryNetwork::new();
    let cancel = CancellationToken::new();
    let members = pool.members();
    let mut results = Vec::new();

    for (i, key) in keys.iter().enumerate() {
        if offline.contains(&i) {
            results.push(None);
            continue;
        }
        let transport = network.join(key.token());
        let mut inbox = transport.subscribe();
        let (outbound, mut broadcasts) = mpsc::unbounded_channel::<Vec<u8>>();
        let sender = transport.clone();
        let targets = members.clone();
        tokio::spawn(async move {
            while let Some(data) = broadcasts.recv().await {
                sender.broadcast(&targets, &data);
            }
        });

        let engine = Pooling::new(config.clone(), EPOCH, pool.clone(), key.clone());
        let (finalize, finalized) = oneshot::channel();
        let (handle, _task) = launch(engine, outbound, finalize, cancel.clone());
        let inbound = handle.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Ok(message) = PoolingMessage::parse(&envelope.data) {
                    inbound.message(message);
                }
            }
        });
        if let Some(value) = seal(i) {
            tokio::spawn(async move {
                sleep(Duration::from_millis(10 * i as u64)).await;
                handle.seal_block(value);
            });
        }
        results.push(Some(finalized));
    }

    let mut consensus = Vec::new();
    for result in results {
        consensus.push(match result {
            Some(finalized) => timeout(Duration::from_secs(20), finalized)
                .await
                .ok()
                .and_then(Result::ok),
            None => None,
        });
    }
    cancel.cancel();
    consensus
}

#[tokio::test]
async fn test_twelve_validators_agree_on_sealed_block() {
    let (keys, pool) = committee(12);
    assert_eq!(config(&pool).f, 3);
    let value = Hash::of(b"epoch 7 block");
    let results = run_pool(&keys, &pool, config(&pool), &[], |_| Some(value)).await;
    for consensus in &results {
        let consensus = consensus.as_ref().expect("every validator finalizes");
        assert_eq!(consensus.epoch, EPOCH);
        assert_eq!(consensus.value, value);
        assert!(consensus.duplicates.is_empty());
    }
}

#[tokio::test]
async fn test_twelve_validators_agree_with_two_tolerated_faults() {
    let (keys, pool) = committee(12);
    let config = PoolingConfig { f: 2, ..config(&pool) };
    let value = Hash::of(b"epoch 7 block");

    let results = run_pool(&keys, &pool, config.clone(), &[], |_| Some(value)).await;
    for consensus in &results {
        assert_eq!(consensus.as_ref().map(|c| c.value), Some(value));
    }

    let leader = pool.leader(0).unwrap();
    let offline: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| k.token() != leader)
        .map(|(i, _)| i)
        .take(2)
        .collect();
    let results = run_pool(&keys, &pool, config, &offline, |_| Some(value)).await;
    assert_eq!(results.iter().flatten().count(), 10);
    for consensus in results.iter().flatten() {
        assert_eq!(consensus.value, value);
    }
}

#[tokio::test]
async fn test_agreement_survives_offline_validators() {
    let (keys, pool) = committee(12);
    let leader = pool.leader(0).unwrap();
    // Two validators never come up, neither of them the first leader.
    let offline: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| k.token() != leader)
        .map(|(i, _)| i)
        .take(2)
        .collect();
    let value = Hash::of(b"epoch 7 block");
    let results = run_pool(&keys, &pool, config(&pool), &offline, |_| Some(value)).await;
    for (i, consensus) in results.iter().enumerate() {
        if offline.contains(&i) {
            assert!(consensus.is_none());
        } else {
            assert_eq!(consensus.as_ref().map(|c| c.value), Some(value));
        }
    }
}

#[tokio::test]
async fn test_offline_leader_is_skipped() {
    let (keys, pool) = committee(12);
    let leader = pool.leader(0).unwrap();
    let offline: Vec<usize> = keys
        .iter()
        .position(|k| k.token() == leader)
        .into_iter()
        .collect();
    let value = Hash::of(b"epoch 7 block");
    let results = run_pool(&keys, &pool, config(&pool), &offline, |_| Some(value)).await;

    let finalized: Vec<&Consensus> = results.iter().flatten().collect();
    assert_eq!(finalized.len(), 11);
    for consensus in finalized {
        assert_eq!(consensus.value, value);
        assert!(consensus.round > 0);
    }
}
