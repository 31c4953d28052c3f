use std::sync::Arc;
use swell::chain::{Action, Chain, Wallet};
use swell::crypto::{Hash, KeyPair};
use swell::network::InMemoryNetwork;
use swell::permission::Permissionless;
use swell::pooling::PoolingConfig;
use swell::swell::{Swell, SwellConfig};
use swell::types::{Epoch, Validator};
use tokio::time::{sleep, Duration, Instant};

fn config() -> SwellConfig {
    SwellConfig {
        network_hash: Hash::of(b"swell-network-test"),
        checksum_window: 6,
        epoch_duration: Duration::from_millis(300),
        build_margin: Duration::from_millis(150),
        retrieval_stagger: Duration::from_millis(50),
        retrieval_timeout: Duration::from_secs(2),
        pooling: PoolingConfig {
            timeout_propose: Duration::from_millis(150),
            timeout_vote: Duration::from_millis(150),
            timeout_commit: Duration::from_millis(150),
            ..PoolingConfig::default()
        },
        ..SwellConfig::default()
    }
}

struct Cluster {
    validators: Vec<Swell>,
    observer: Swell,
    payer: KeyPair,
    genesis: Instant,
}

fn cluster(size: usize) -> Cluster {
    let network = InMemoryNetwork::new();
    let payer = KeyPair::from_seed(&[99; 32]);
    let wallet = Wallet::new(vec![(payer.token(), 1_000_000)]);
    let genesis = Instant::now() + Duration::from_millis(50);
    let keys: Vec<KeyPair> = (0..size).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();
    let committee: Vec<Validator> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| Validator {
            token: k.token(),
            address: format!("node-{i}"),
            weight: 1,
        })
        .collect();

    let node = |key: &KeyPair, address: String, config: SwellConfig| {
        let chain = Chain::genesis(config.network_hash, wallet.clone(), key.clone());
        let node = Swell::new(
            config,
            key.clone(),
            address,
            chain,
            network.join(key.token()),
            Arc::new(Permissionless::new()),
            genesis,
        )
        .unwrap();
        node.start(committee.clone()).unwrap();
        node
    };
    let validators = keys
        .iter()
        .enumerate()
        .map(|(i, key)| node(key, format!("node-{i}"), config()))
        .collect();
    let observer = node(
        &KeyPair::from_seed(&[77; 32]),
        "observer".to_string(),
        SwellConfig {
            candidate: false,
            ..config()
        },
    );
    Cluster {
        validators,
        observer,
        payer,
        genesis,
    }
}

fn last_commit(node: &Swell) -> Epoch {
    node.chain().lock().last_commit_epoch()
}

async fn wait_for(nodes: &[&Swell], epoch: Epoch, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if nodes.iter().all(|n| last_commit(n) >= epoch) {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_validators_commit_identical_blocks_across_windows() {
    let cluster = cluster(4);
    let clock = cluster.validators[0].clock();
    let mut commits = cluster.validators[0].subscribe_commits();
    let recipient = KeyPair::from_seed(&[98; 32]).token();
    for i in 0..20u64 {
        let epoch = clock.epoch_at(Instant::now().max(cluster.genesis));
        let action = Action::transfer(&cluster.payer, epoch, recipient, 10 + i, 1, "");
        for node in &cluster.validators {
            node.submit_action(&action).unwrap();
        }
    }

    let nodes: Vec<&Swell> = cluster.validators.iter().collect();
    assert!(wait_for(&nodes, 8, Duration::from_secs(30)).await, "validators stalled");

    let reference = cluster.validators[0].chain();
    let reference = reference.lock();
    for node in &cluster.validators[1..] {
        let chain = node.chain();
        let chain = chain.lock();
        for epoch in 1..=8 {
            assert_eq!(
                chain.committed_block(epoch).map(|b| b.hash()),
                reference.committed_block(epoch).map(|b| b.hash()),
                "epoch {epoch} diverges"
            );
            assert_eq!(
                chain.committed_block(epoch).map(|b| b.commit.fees),
                reference.committed_block(epoch).map(|b| b.commit.fees),
            );
        }
        assert_eq!(chain.checksum().hash, reference.checksum().hash);
    }
    assert!(reference.checksum().epoch >= 4);
    let recipient_balance = reference.commit_state().balance(&recipient);
    assert_eq!(recipient_balance, (0..20u64).map(|i| 10 + i).sum::<u64>());
    drop(reference);

    // The second window runs with the committee formed at handoff.
    let next = cluster.validators[0].topology(7).unwrap();
    assert_eq!(next.len(), 4);

    let notice = commits.recv().await.unwrap();
    assert_eq!(notice.epoch, 1);
    assert!(cluster.validators[0].metrics().epochs_finalized.get() > 0);

    for node in &cluster.validators {
        node.shutdown();
    }
    cluster.observer.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observer_catches_up_through_sync() {
    let cluster = cluster(4);
    let nodes: Vec<&Swell> = cluster.validators.iter().collect();
    assert!(wait_for(&nodes, 4, Duration::from_secs(30)).await, "validators stalled");
    // Not on the committee, so nothing reaches the observer unprompted.
    assert_eq!(last_commit(&cluster.observer), 0);

    let source = &cluster.validators[1];
    let target = last_commit(source);
    cluster.observer.request_sync(&source.token(), false);
    assert!(
        wait_for(&[&cluster.observer], target, Duration::from_secs(10)).await,
        "observer did not sync"
    );
    let observed = cluster.observer.chain();
    let observed = observed.lock();
    let expected = source.chain();
    let expected = expected.lock();
    assert_eq!(
        observed.committed_block(target).map(|b| b.hash()),
        expected.committed_block(target).map(|b| b.hash())
    );

    for node in &cluster.validators {
        node.shutdown();
    }
    cluster.observer.shutdown();
}
