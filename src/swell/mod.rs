//! Epoch driver tying the voting engine to the chain.
//!
//! Time is split into epochs of fixed duration and epochs into checksum
//! windows. Each window has its own committee and runs its own dispatch loop
//! (see `window`); the node routes inbound messages to the window owning their
//! epoch and answers sync, topology and block requests itself.

pub mod messages;
pub mod retrieve;
pub mod statement;
pub mod stream;
pub mod sync;
mod window;

use crate::chain::{Action, Chain, Checksum, SealedBlock, CANDIDACY_LEAD};
use crate::committee::Committee;
use crate::crypto::{Hash, KeyPair, Token};
use crate::mempool::{Mempool, MempoolError};
use crate::metrics::SwellMetrics;
use crate::network::{Envelope, NetworkError, Transport};
use crate::permission::Permission;
use crate::pooling::messages::is_pooling_kind;
use crate::pooling::{PoolingConfig, PoolingMessage};
use crate::types::{Epoch, Validator, WindowSpan};
use crate::wire::{kind_of, WireError};
use messages::{is_swell_kind, SwellMessage, SYNC_TOO_OLD};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync::SyncProgress;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use window::WindowInput;

/// Inputs buffered for windows that have not been launched yet.
const MAX_EARLY_INPUTS: usize = 16_384;
/// Committees kept for topology answers and commit checks.
const RETAINED_COMMITTEES: usize = 8;

#[derive(Clone, Debug)]
pub struct SwellConfig {
    pub network_hash: Hash,
    /// Epochs per checksum window.
    pub checksum_window: u64,
    pub epoch_duration: Duration,
    /// The leader stops adding actions this long before the next epoch, and
    /// voting on the epoch starts at that point.
    pub build_margin: Duration,
    pub max_pool_size: usize,
    pub max_block_actions: usize,
    pub retrieval_stagger: Duration,
    pub retrieval_timeout: Duration,
    /// Window fraction at which the next committee is formed.
    pub committee_handoff: f64,
    /// Window fraction whose epoch is checksummed.
    pub checksum_point: f64,
    /// Window fraction at which naked statements are revealed.
    pub statement_reveal: f64,
    pub recent_blocks: usize,
    pub mempool_capacity: usize,
    /// Whether this node applies for the next committees.
    pub candidate: bool,
    pub pooling: PoolingConfig,
}

impl Default for SwellConfig {
    fn default() -> Self {
        Self {
            network_hash: Hash::of(b"swell"),
            checksum_window: 100,
            epoch_duration: Duration::from_secs(2),
            build_margin: Duration::from_millis(980),
            max_pool_size: 32,
            max_block_actions: 10_000,
            retrieval_stagger: Duration::from_millis(400),
            retrieval_timeout: Duration::from_secs(10),
            committee_handoff: 0.9,
            checksum_point: 0.5,
            statement_reveal: 0.7,
            recent_blocks: 64,
            mempool_capacity: 100_000,
            candidate: true,
            pooling: PoolingConfig::default(),
        }
    }
}

impl SwellConfig {
    fn tick(&self) -> Duration {
        (self.epoch_duration / 20).max(Duration::from_millis(1))
    }
}

/// Maps epochs to wall-clock instants. Epoch 1 starts at `genesis`.
#[derive(Clone, Copy, Debug)]
pub struct EpochClock {
    genesis: Instant,
    epoch_duration: Duration,
}

impl EpochClock {
    pub fn new(genesis: Instant, epoch_duration: Duration) -> Self {
        Self {
            genesis,
            epoch_duration,
        }
    }

    pub fn start_of(&self, epoch: Epoch) -> Instant {
        let elapsed = epoch.saturating_sub(1).min(u32::MAX as u64) as u32;
        self.genesis + self.epoch_duration.saturating_mul(elapsed)
    }

    pub fn epoch_at(&self, instant: Instant) -> Epoch {
        let elapsed = instant.saturating_duration_since(self.genesis);
        1 + (elapsed.as_nanos() / self.epoch_duration.as_nanos().max(1)) as Epoch
    }
}

/// Published for every block this node commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitNotice {
    pub epoch: Epoch,
    pub hash: Hash,
    pub proposer: Token,
    pub actions: usize,
    pub invalidated: usize,
    pub fees: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SwellError {
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("node already started")]
    AlreadyStarted,
    #[error("initial committee has no weighted validator")]
    EmptyCommittee,
    #[error("checksum window of {window} epochs exceeds the candidacy lead of {limit}")]
    WindowTooLong { window: u64, limit: u64 },
}

#[derive(Default)]
struct Router {
    windows: BTreeMap<Epoch, (WindowSpan, mpsc::UnboundedSender<WindowInput>)>,
    early: Vec<(Epoch, WindowInput)>,
}

/// State shared by the router and every window of one node.
pub(crate) struct Shared {
    pub(crate) config: SwellConfig,
    pub(crate) credentials: Arc<KeyPair>,
    pub(crate) address: String,
    pub(crate) chain: Arc<Mutex<Chain>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) mempool: Arc<Mempool>,
    pub(crate) permission: Arc<dyn Permission>,
    pub(crate) metrics: Arc<SwellMetrics>,
    pub(crate) clock: EpochClock,
    pub(crate) cancel: CancellationToken,
    router: Mutex<Router>,
    committees: Mutex<BTreeMap<Epoch, Committee>>,
    topology: Mutex<BTreeMap<Epoch, Vec<Validator>>>,
    /// Open sync requests by peer, and whether the snapshot was asked for.
    sync_requests: Mutex<HashMap<Token, bool>>,
    /// Checksum hashes agreed by committee statements, by checksum epoch.
    trusted: Mutex<BTreeMap<Epoch, Hash>>,
    commits: broadcast::Sender<CommitNotice>,
}

impl Shared {
    pub(crate) fn token(&self) -> Token {
        self.credentials.token()
    }

    pub(crate) fn register(
        &self,
        span: WindowSpan,
        committee: Committee,
        inbox: mpsc::UnboundedSender<WindowInput>,
    ) {
        {
            let mut committees = self.committees.lock();
            committees.insert(span.start, committee);
            while committees.len() > RETAINED_COMMITTEES {
                committees.pop_first();
            }
        }
        let mut router = self.router.lock();
        let early = std::mem::take(&mut router.early);
        for (epoch, input) in early {
            if span.contains(epoch) {
                let _ = inbox.send(input);
            } else {
                router.early.push((epoch, input));
            }
        }
        router.windows.insert(span.start, (span, inbox));
    }

    pub(crate) fn unregister(&self, start: Epoch) {
        self.router.lock().windows.remove(&start);
    }

    fn route(&self, epoch: Epoch, input: WindowInput) {
        let mut router = self.router.lock();
        if let Some((_, inbox)) = router.windows.values().find(|(span, _)| span.contains(epoch)) {
            let _ = inbox.send(input);
            return;
        }
        let latest = router.windows.values().map(|(span, _)| span.end).max().unwrap_or(0);
        if epoch > latest && router.early.len() < MAX_EARLY_INPUTS {
            router.early.push((epoch, input));
        } else {
            debug!(epoch, "No window for inbound message");
        }
    }

    /// Committee of the window containing `epoch`, if known.
    pub(crate) fn committee_for(&self, epoch: Epoch) -> Option<(Epoch, Committee)> {
        let window = self.config.checksum_window;
        self.committees
            .lock()
            .range(..=epoch)
            .next_back()
            .filter(|(start, _)| epoch < **start + window)
            .map(|(start, committee)| (*start, committee.clone()))
    }

    /// Queues a candidacy or equivocation evidence for inclusion in a block.
    /// Committee changes only take effect once such entries are committed.
    pub(crate) fn enqueue(&self, data: Vec<u8>) {
        match self.mempool.submit(data) {
            Ok(hash) => debug!(%hash, "Entry queued"),
            Err(MempoolError::Duplicate(_)) => {}
            Err(e) => debug!(error = %e, "Entry not queued"),
        }
    }

    pub(crate) fn send(&self, to: &Token, message: &SwellMessage) {
        match message.serialize() {
            Ok(data) => {
                if let Err(e) = self.transport.send(to, data) {
                    debug!(peer = %to, error = %e, "Send failed");
                }
            }
            Err(e) => warn!(error = %e, "Cannot encode message"),
        }
    }

    pub(crate) fn broadcast(&self, to: &[Token], message: &SwellMessage) {
        match message.serialize() {
            Ok(data) => self.transport.broadcast(to, &data),
            Err(e) => warn!(error = %e, "Cannot encode message"),
        }
    }

    pub(crate) fn request_sync(&self, peer: &Token, state: bool) {
        let epoch = self.chain.lock().last_commit_epoch();
        *self.sync_requests.lock().entry(*peer).or_insert(false) |= state;
        info!(peer = %peer, epoch, state, "Requesting sync");
        self.send(peer, &SwellMessage::SyncRequest { epoch, state });
    }

    pub(crate) fn trust_checksum(&self, epoch: Epoch, hash: Hash) {
        let mut trusted = self.trusted.lock();
        trusted.insert(epoch, hash);
        while trusted.len() > RETAINED_COMMITTEES {
            trusted.pop_first();
        }
    }

    /// A snapshot may replace the ledger only if the committee agreed on it
    /// or it is the one held locally.
    fn trusts(&self, checksum: &Checksum) -> bool {
        if self.trusted.lock().get(&checksum.epoch) == Some(&checksum.hash) {
            return true;
        }
        let chain = self.chain.lock();
        chain.checksum().epoch == checksum.epoch && chain.checksum().hash == checksum.hash
    }

    /// Whether the proposer of `block` sits in the pool of its epoch.
    fn admits(&self, block: &SealedBlock) -> bool {
        let epoch = block.epoch();
        self.committee_for(epoch).is_some_and(|(_, committee)| {
            committee
                .pool(epoch, self.config.max_pool_size)
                .contains(&block.header.proposer)
        })
    }

    /// Metrics, notices and commit records for newly committed epochs.
    pub(crate) fn publish_commits(&self, epochs: &[Epoch]) {
        let me = self.token();
        for &epoch in epochs {
            let Some(block) = self.chain.lock().committed_block(epoch).cloned() else {
                continue;
            };
            let invalidated = block.commit.invalidated.len();
            let actions = block.sealed.actions.len();
            self.metrics.blocks_committed.inc();
            self.metrics
                .actions_committed
                .inc_by(actions.saturating_sub(invalidated) as u64);
            self.metrics.actions_invalidated.inc_by(invalidated as u64);
            self.metrics.last_committed_epoch.set(epoch as i64);

            let proposer = block.sealed.header.proposer;
            if proposer == me {
                if let Some((_, committee)) = self.committee_for(epoch) {
                    let members: Vec<Token> = committee.validators().iter().map(|v| v.token).collect();
                    self.broadcast(
                        &members,
                        &SwellMessage::Commit {
                            epoch,
                            hash: block.hash(),
                            commit: block.commit.clone(),
                        },
                    );
                }
            }
            let _ = self.commits.send(CommitNotice {
                epoch,
                hash: block.hash(),
                proposer,
                actions,
                invalidated,
                fees: block.commit.fees,
            });
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope { from, data } = envelope;
        let Some(kind) = kind_of(&data) else {
            return;
        };
        if is_pooling_kind(kind) {
            match PoolingMessage::parse(&data) {
                Ok(PoolingMessage::Candidate(_)) => self.enqueue(data),
                Ok(message @ PoolingMessage::Duplicate(_)) => {
                    self.enqueue(data);
                    self.route(message.epoch(), WindowInput::Pooling(message));
                }
                Ok(message) => self.route(message.epoch(), WindowInput::Pooling(message)),
                Err(e) => debug!(peer = %from, kind, error = %e, "Dropping invalid message"),
            }
        } else if is_swell_kind(kind) {
            match SwellMessage::parse(&data) {
                Ok(message) => self.handle(from, message),
                Err(e) => debug!(peer = %from, kind, error = %e, "Dropping invalid message"),
            }
        } else {
            debug!(peer = %from, kind, "Dropping message of unknown kind");
        }
    }

    fn handle(&self, from: Token, message: SwellMessage) {
        match message {
            SwellMessage::SyncRequest { epoch, state } => {
                let responses = sync::serve(&self.chain.lock(), epoch, state);
                debug!(peer = %from, epoch, messages = responses.len(), "Serving sync");
                for response in &responses {
                    self.send(&from, response);
                }
            }
            message @ (SwellMessage::SyncState(_)
            | SwellMessage::Committed(_)
            | SwellMessage::Sealed(_)
            | SwellMessage::SyncReady { .. }
            | SwellMessage::SyncError { .. }) => self.apply_sync(from, message),
            SwellMessage::TopologyRequest { epoch } => {
                let (window, validators) = match self.committee_for(epoch) {
                    Some((start, committee)) => (start, committee.validators().to_vec()),
                    None => (WindowSpan::containing(epoch, self.config.checksum_window).start, Vec::new()),
                };
                self.send(&from, &SwellMessage::TopologyResponse { window, validators });
            }
            SwellMessage::TopologyResponse { window, validators } => {
                debug!(peer = %from, window, validators = validators.len(), "Topology received");
                self.topology.lock().insert(window, validators);
            }
            SwellMessage::BlockRequest { epoch, hash } => {
                let block = self.chain.lock().block_by_hash(epoch, &hash);
                self.send(&from, &SwellMessage::BlockResponse { epoch, hash, block });
            }
            message => match message.routing_epoch() {
                Some(epoch) => self.route(epoch, WindowInput::Swell { from, message }),
                None => debug!(peer = %from, "Unroutable message"),
            },
        }
    }

    fn apply_sync(&self, from: Token, message: SwellMessage) {
        let Some(state_requested) = self.sync_requests.lock().get(&from).copied() else {
            debug!(peer = %from, kind = message.kind(), "Dropping unrequested sync response");
            return;
        };
        let admitted = match &message {
            SwellMessage::SyncState(checksum) => state_requested && self.trusts(checksum),
            SwellMessage::Committed(block) => block.verify() && self.admits(&block.sealed),
            SwellMessage::Sealed(block) => self.admits(block),
            SwellMessage::SyncReady { .. } | SwellMessage::SyncError { .. } => {
                self.sync_requests.lock().remove(&from);
                true
            }
            _ => false,
        };
        if !admitted {
            warn!(peer = %from, kind = message.kind(), "Rejecting sync response");
            return;
        }
        let (before, result, after) = {
            let mut chain = self.chain.lock();
            let before = chain.last_commit_epoch();
            let result = sync::apply(&mut chain, message);
            (before, result, chain.last_commit_epoch())
        };
        match result {
            Ok(SyncProgress::Ready(epoch)) => {
                info!(peer = %from, remote = epoch, local = after, "Sync complete");
            }
            Ok(SyncProgress::Failed(SYNC_TOO_OLD)) => {
                info!(peer = %from, "Peer no longer holds our blocks, requesting its state");
                self.request_sync(&from, true);
            }
            Ok(SyncProgress::Failed(code)) => warn!(peer = %from, code, "Sync failed"),
            Ok(SyncProgress::Continue) => {}
            Err(e) => debug!(peer = %from, error = %e, "Sync message rejected"),
        }
        if after > before {
            let epochs: Vec<Epoch> = (before + 1..=after).collect();
            self.publish_commits(&epochs);
        }
    }
}

/// One consensus node.
pub struct Swell {
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl Swell {
    /// `chain` must be owned by `credentials`; `genesis` is the instant epoch
    /// 1 starts and must be shared by every node.
    pub fn new(
        config: SwellConfig,
        credentials: KeyPair,
        address: impl Into<String>,
        chain: Chain,
        transport: Arc<dyn Transport>,
        permission: Arc<dyn Permission>,
        genesis: Instant,
    ) -> Result<Self, SwellError> {
        if config.checksum_window > CANDIDACY_LEAD {
            return Err(SwellError::WindowTooLong {
                window: config.checksum_window,
                limit: CANDIDACY_LEAD,
            });
        }
        let metrics = SwellMetrics::new()?;
        let (commits, _) = broadcast::channel(1024);
        let chain = chain
            .with_recent_blocks(config.recent_blocks)
            .with_max_sealed_ahead(config.checksum_window.saturating_mul(2));
        let shared = Shared {
            clock: EpochClock::new(genesis, config.epoch_duration),
            mempool: Arc::new(Mempool::new(config.mempool_capacity)),
            credentials: Arc::new(credentials),
            address: address.into(),
            chain: Arc::new(Mutex::new(chain)),
            transport,
            permission,
            metrics,
            cancel: CancellationToken::new(),
            router: Mutex::new(Router::default()),
            committees: Mutex::new(BTreeMap::new()),
            topology: Mutex::new(BTreeMap::new()),
            sync_requests: Mutex::new(HashMap::new()),
            trusted: Mutex::new(BTreeMap::new()),
            commits,
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
            started: AtomicBool::new(false),
        })
    }

    /// Starts routing and the window containing the current epoch, with
    /// `validators` as its committee. The returned task ends on shutdown.
    pub fn start(&self, validators: Vec<Validator>) -> Result<JoinHandle<()>, SwellError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SwellError::AlreadyStarted);
        }
        let shared = self.shared.clone();
        let seed = shared.chain.lock().checksum().hash;
        let committee = Committee::new(validators, seed);
        if committee.is_empty() {
            return Err(SwellError::EmptyCommittee);
        }
        let epoch = shared.clock.epoch_at(Instant::now());
        let span = WindowSpan::containing(epoch, shared.config.checksum_window);
        info!(
            token = %shared.token(),
            window = span.start,
            validators = committee.size(),
            "Starting node"
        );

        let mut inbox = shared.transport.subscribe();
        window::launch(shared.clone(), span, committee);
        Ok(tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    envelope = inbox.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                shared.dispatch(envelope);
            }
            debug!(token = %shared.token(), "Router stopped");
        }))
    }

    /// Stops every window, engine and timer, and closes the transport.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.transport.shutdown();
    }

    pub fn token(&self) -> Token {
        self.shared.token()
    }

    pub fn chain(&self) -> Arc<Mutex<Chain>> {
        self.shared.chain.clone()
    }

    pub fn metrics(&self) -> Arc<SwellMetrics> {
        self.shared.metrics.clone()
    }

    pub fn clock(&self) -> EpochClock {
        self.shared.clock
    }

    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommitNotice> {
        self.shared.commits.subscribe()
    }

    /// Queues a serialized action for the blocks this node proposes.
    pub fn submit(&self, data: Vec<u8>) -> Result<Hash, SwellError> {
        Ok(self.shared.mempool.submit(data)?)
    }

    pub fn submit_action(&self, action: &Action) -> Result<Hash, SwellError> {
        self.submit(action.serialize())
    }

    /// Asks `peer` for everything committed after our last commit, plus its
    /// state snapshot when `state` is set.
    pub fn request_sync(&self, peer: &Token, state: bool) {
        self.shared.request_sync(peer, state);
    }

    /// Accepts a snapshot with this hash at `epoch` over sync, for nodes
    /// bootstrapping from a checksum learned out of band.
    pub fn trust_checksum(&self, epoch: Epoch, hash: Hash) {
        self.shared.trust_checksum(epoch, hash);
    }

    pub fn request_topology(&self, peer: &Token, epoch: Epoch) {
        self.shared
            .send(peer, &SwellMessage::TopologyRequest { epoch });
    }

    /// Committee of the window containing `epoch`: the local one if this node
    /// ran that window, else one reported by a peer.
    pub fn topology(&self, epoch: Epoch) -> Option<Vec<Validator>> {
        if let Some((_, committee)) = self.shared.committee_for(epoch) {
            return Some(committee.validators().to_vec());
        }
        let start = WindowSpan::containing(epoch, self.shared.config.checksum_window).start;
        self.shared.topology.lock().get(&start).cloned()
    }
}

impl Drop for Swell {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_clock() {
        let genesis = Instant::now();
        let clock = EpochClock::new(genesis, Duration::from_millis(100));
        assert_eq!(clock.start_of(1), genesis);
        assert_eq!(clock.start_of(4), genesis + Duration::from_millis(300));
        assert_eq!(clock.epoch_at(genesis), 1);
        assert_eq!(clock.epoch_at(genesis + Duration::from_millis(250)), 3);
    }

    #[test]
    fn test_default_config_points_are_ordered() {
        let config = SwellConfig::default();
        assert!(config.checksum_point < config.statement_reveal);
        assert!(config.statement_reveal < config.committee_handoff);
        assert!(config.build_margin < config.epoch_duration);
        assert_eq!(config.tick(), Duration::from_millis(100));
    }
}
