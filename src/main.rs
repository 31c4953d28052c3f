use clap::{Parser, ValueEnum};
use color_eyre::Result;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use swell::chain::{Action, Chain, Wallet};
use swell::crypto::KeyPair;
use swell::network::InMemoryNetwork;
use swell::permission::{Permission, Permissionless, ProofOfAuthority, ProofOfStake};
use swell::pooling::PoolingConfig;
use swell::swell::{Swell, SwellConfig};
use swell::types::CandidateInfo;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PermissionKind {
    Stake,
    Authority,
    Open,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "In-process Swell committee over an in-memory network")]
struct Args {
    /// Number of validators in the committee
    #[clap(long, value_name = "INT", default_value = "4")]
    validators: usize,
    /// Stop once this epoch is committed
    #[clap(long, value_name = "INT", default_value = "30")]
    epochs: u64,
    /// Epochs per checksum window
    #[clap(long, value_name = "INT", default_value = "10")]
    checksum_window: u64,
    /// Epoch duration in milliseconds
    #[clap(long, value_name = "MS", default_value = "500")]
    epoch_ms: u64,
    /// Maximum number of validators voting on one epoch
    #[clap(long, value_name = "INT", default_value = "32")]
    pool_size: usize,
    /// Payments submitted per epoch
    #[clap(long, value_name = "INT", default_value = "20")]
    actions: usize,
    #[clap(long, value_enum, default_value = "open")]
    permission: PermissionKind,
}

fn permission(kind: PermissionKind, authorities: &[CandidateInfo]) -> Arc<dyn Permission> {
    match kind {
        PermissionKind::Stake => Arc::new(ProofOfStake::new(100, 10, 10)),
        PermissionKind::Authority => Arc::new(ProofOfAuthority::new(
            authorities.iter().map(|c| (c.token, c.address.clone())),
        )),
        PermissionKind::Open => Arc::new(Permissionless::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if args.validators == 0 {
        color_eyre::eyre::bail!("at least one validator is required");
    }
    info!(
        validators = args.validators,
        epochs = args.epochs,
        permission = ?args.permission,
        "Starting swell committee"
    );

    let epoch_duration = Duration::from_millis(args.epoch_ms.max(10));
    let round_timeout = epoch_duration / 2;
    let config = SwellConfig {
        checksum_window: args.checksum_window.max(2),
        epoch_duration,
        build_margin: epoch_duration * 49 / 100,
        max_pool_size: args.pool_size.max(1),
        retrieval_stagger: epoch_duration / 5,
        retrieval_timeout: epoch_duration * 10,
        pooling: PoolingConfig {
            timeout_propose: round_timeout,
            timeout_vote: round_timeout,
            timeout_commit: round_timeout,
            ..PoolingConfig::default()
        },
        ..SwellConfig::default()
    };

    let faucet = KeyPair::generate();
    let keys: Vec<KeyPair> = (0..args.validators).map(|_| KeyPair::generate()).collect();
    let candidates: Vec<CandidateInfo> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| CandidateInfo {
            token: key.token(),
            address: format!("node-{i}"),
        })
        .collect();
    let mut balances = vec![(faucet.token(), u64::MAX / 4)];
    balances.extend(keys.iter().map(|key| (key.token(), 1_000)));
    let wallet = Wallet::new(balances);

    let network = InMemoryNetwork::new();
    let genesis = Instant::now() + Duration::from_millis(100);
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for (key, candidate) in keys.iter().zip(&candidates) {
        let policy = permission(args.permission, &candidates);
        let validators = policy.validators(&candidates, &wallet);
        let chain = Chain::genesis(config.network_hash, wallet.clone(), key.clone());
        let node = Swell::new(
            config.clone(),
            key.clone(),
            candidate.address.clone(),
            chain,
            network.join(key.token()),
            policy,
            genesis,
        )?;
        handles.push(node.start(validators)?);
        nodes.push(node);
    }

    let clock = nodes[0].clock();
    let recipients: Vec<_> = keys.iter().map(|k| k.token()).collect();
    let mut commits = nodes[0].subscribe_commits();
    let mut ticker = tokio::time::interval(epoch_duration);
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let epoch = clock.epoch_at(Instant::now());
                for _ in 0..args.actions {
                    let Some(to) = recipients.choose(&mut rand::thread_rng()) else {
                        break;
                    };
                    sent += 1;
                    let action = Action::transfer(&faucet, epoch, *to, 1 + sent % 10, 1, &format!("payment {sent}"));
                    for node in &nodes {
                        if let Err(e) = node.submit_action(&action) {
                            warn!(error = %e, "Payment rejected");
                        }
                    }
                }
            }
            notice = commits.recv() => match notice {
                Ok(notice) => {
                    info!(
                        epoch = notice.epoch,
                        hash = %notice.hash,
                        actions = notice.actions,
                        invalidated = notice.invalidated,
                        fees = notice.fees,
                        "Committed"
                    );
                    if notice.epoch >= args.epochs {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Commit notices lagging"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    for node in &nodes {
        let chain = node.chain();
        let chain = chain.lock();
        info!(
            token = %node.token(),
            last_commit = chain.last_commit_epoch(),
            hash = %chain.last_commit_hash(),
            checksum = chain.checksum().epoch,
            "Final chain"
        );
    }
    for node in &nodes {
        node.shutdown();
    }
    for handle in handles {
        let _ = handle.await;
    }
    println!("{}", nodes[0].metrics().gather());
    Ok(())
}
