//! Dispatch loop of one checksum window.
//!
//! Everything the window owns lives in this task: per-epoch slots with their
//! voting engine, block streams and retrievals, the checksum statements, and
//! the committee handoff. Spawned tasks report back through `Internal`.

use super::messages::{ChecksumStatement, SwellMessage};
use super::retrieve::{retrieve, Retrieval};
use super::statement::StatementTally;
use super::stream::{self, BuildParams, BuiltBlock, StreamError, StreamEvent};
use super::Shared;
use crate::chain::{
    clone_checksum, BlockCommit, Chain, ChainError, Checksum, CommitBlock, SealedBlock,
};
use crate::committee::{Committee, Pool};
use crate::crypto::{Hash, Token};
use crate::pooling::{self, Candidate, Consensus, Pooling, PoolingEvent, PoolingHandle, PoolingMessage};
use crate::types::{Epoch, WindowSpan};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Voting messages buffered per epoch before its engine starts.
const MAX_PENDING: usize = 4096;
/// Retrievals tried before falling back to sync.
const MAX_RETRIEVALS: u32 = 2;

/// A sealed block at `epoch` other than the finalized one, picked up from a
/// peer ahead of us, is rolled back together with everything after it.
fn drop_conflicting(chain: &mut Chain, epoch: Epoch, finalized: Hash) {
    let conflicting = chain
        .sealed_block(epoch)
        .is_some_and(|block| block.hash() != finalized);
    if conflicting {
        warn!(epoch, finalized = %finalized, "Sealed block conflicts with consensus, rolling back");
        if let Err(e) = chain.rollover(epoch - 1) {
            error!(epoch, error = %e, "Rollback failed");
        }
    }
}

/// Inbound traffic routed to a window.
#[derive(Debug)]
pub(crate) enum WindowInput {
    Pooling(PoolingMessage),
    Swell { from: Token, message: SwellMessage },
}

enum Internal {
    Built {
        epoch: Epoch,
        proposer: Token,
        result: Result<BuiltBlock, StreamError>,
    },
    Finalized(Consensus),
    Retrieved {
        epoch: Epoch,
        hash: Hash,
        block: Option<SealedBlock>,
    },
    Checksum(Result<Checksum, ChainError>),
}

struct Slot {
    pool: Pool,
    leader: Option<Token>,
    member: bool,
    opened: bool,
    /// Serialized broadcasts to the pool members.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pooling: Option<PoolingHandle>,
    pending: Vec<PoolingMessage>,
    blocks: HashMap<Hash, BuiltBlock>,
    listeners: HashMap<Token, mpsc::UnboundedSender<StreamEvent>>,
    leader_block: Option<Hash>,
    own_block: Option<Hash>,
    fallback: bool,
    finalized: Option<Hash>,
    retrieval: Option<(mpsc::UnboundedSender<SealedBlock>, JoinHandle<()>)>,
    retrievals: u32,
    done: bool,
}

impl Slot {
    fn favored(&self) -> Option<Hash> {
        self.leader_block.or(self.own_block)
    }

    fn stop_retrieval(&mut self) {
        if let Some((_, task)) = self.retrieval.take() {
            task.abort();
        }
    }
}

pub(crate) struct Window {
    shared: Arc<Shared>,
    span: WindowSpan,
    committee: Committee,
    me: Token,
    member: bool,
    slots: BTreeMap<Epoch, Slot>,
    tally: StatementTally,
    checksum: Option<Checksum>,
    checksum_started: bool,
    revealed: bool,
    handed_off: bool,
    candidate_sent: bool,
    internal: mpsc::UnboundedSender<Internal>,
    cancel: CancellationToken,
}

/// Registers and spawns the window for `span` run by `committee`.
pub(crate) fn launch(shared: Arc<Shared>, span: WindowSpan, committee: Committee) -> JoinHandle<()> {
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let (internal, internal_rx) = mpsc::unbounded_channel();
    shared.register(span, committee.clone(), inbox_tx);

    let weights = committee
        .validators()
        .iter()
        .map(|v| (v.token, v.weight))
        .collect();
    let me = shared.token();
    let window = Window {
        cancel: shared.cancel.child_token(),
        member: committee.contains(&me),
        tally: StatementTally::new(span.start, weights),
        slots: BTreeMap::new(),
        checksum: None,
        checksum_started: false,
        revealed: false,
        handed_off: false,
        candidate_sent: false,
        shared,
        span,
        committee,
        me,
        internal,
    };
    tokio::spawn(window.run(inbox, internal_rx))
}

impl Window {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<WindowInput>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!(
            start = self.span.start,
            end = self.span.end,
            validators = self.committee.size(),
            member = self.member,
            "Window started"
        );
        let mut ticker = tokio::time::interval(self.shared.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.on_tick(Instant::now());
                    if self.finished(Instant::now()) {
                        break;
                    }
                }
                Some(input) = inbox.recv() => self.on_input(input),
                Some(event) = internal.recv() => self.on_internal(event),
            }
        }
        self.cancel.cancel();
        self.shared.unregister(self.span.start);
        info!(start = self.span.start, end = self.span.end, "Window closed");
    }

    fn members(&self) -> Vec<Token> {
        self.committee.validators().iter().map(|v| v.token).collect()
    }

    fn finished(&self, now: Instant) -> bool {
        if !self.handed_off || now < self.shared.clock.start_of(self.span.end + 1) {
            return false;
        }
        !self.member || self.shared.chain.lock().last_commit_epoch() >= self.span.end
    }

    fn slot(&mut self, epoch: Epoch) -> &mut Slot {
        let shared = &self.shared;
        let committee = &self.committee;
        let me = self.me;
        self.slots.entry(epoch).or_insert_with(|| {
            let pool = committee.pool(epoch, shared.config.max_pool_size);
            let targets = pool.members();
            let (outbound, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let transport = shared.transport.clone();
            tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    transport.broadcast(&targets, &data);
                }
            });
            Slot {
                leader: pool.leader(0),
                member: pool.contains(&me),
                pool,
                opened: false,
                outbound,
                pooling: None,
                pending: Vec::new(),
                blocks: HashMap::new(),
                listeners: HashMap::new(),
                leader_block: None,
                own_block: None,
                fallback: false,
                finalized: None,
                retrieval: None,
                retrievals: 0,
                done: false,
            }
        })
    }

    fn on_tick(&mut self, now: Instant) {
        if !self.candidate_sent {
            self.send_candidate();
        }
        let clock = self.shared.clock;
        let duration = self.shared.config.epoch_duration;
        let margin = self.shared.config.build_margin;
        for epoch in self.span.start..=self.span.end {
            let start = clock.start_of(epoch);
            if now < start {
                break;
            }
            self.open(epoch, start + duration - margin);
            if now + margin >= start + duration {
                self.start_pooling(epoch);
            }
            if now >= start + duration {
                self.fallback(epoch);
            }
        }
        self.window_points(now);
    }

    fn send_candidate(&mut self) {
        self.candidate_sent = true;
        if !self.shared.config.candidate {
            return;
        }
        let next = self.span.next();
        let candidate = Candidate::new(&self.shared.credentials, next.start, &self.shared.address);
        let data = PoolingMessage::Candidate(candidate).serialize();
        self.shared.enqueue(data.clone());
        self.shared.transport.broadcast(&self.members(), &data);
    }

    fn open(&mut self, epoch: Epoch, deadline: Instant) {
        let me = self.me;
        let committed = self.shared.chain.lock().last_commit_epoch();
        let slot = self.slot(epoch);
        if slot.opened {
            return;
        }
        slot.opened = true;
        if epoch <= committed {
            slot.done = true;
            return;
        }
        if slot.member && slot.leader == Some(me) {
            debug!(epoch, "Leading epoch");
            self.spawn_build(epoch, deadline);
        }
    }

    fn spawn_build(&mut self, epoch: Epoch, deadline: Instant) {
        let shared = self.shared.clone();
        let outbound = self.slot(epoch).outbound.clone();
        let internal = self.internal.clone();
        let cancel = self.cancel.clone();
        let proposer = self.me;
        tokio::spawn(async move {
            let params = BuildParams {
                epoch,
                deadline,
                max_actions: shared.config.max_block_actions,
            };
            let result = stream::build(
                shared.chain.clone(),
                shared.credentials.clone(),
                shared.mempool.clone(),
                params,
                outbound,
                cancel,
            )
            .await;
            let _ = internal.send(Internal::Built {
                epoch,
                proposer,
                result,
            });
        });
    }

    fn start_pooling(&mut self, epoch: Epoch) {
        let shared = self.shared.clone();
        let internal = self.internal.clone();
        let cancel = self.cancel.clone();
        let slot = self.slot(epoch);
        if !slot.member || slot.pooling.is_some() || slot.done || slot.finalized.is_some() {
            return;
        }
        let config = shared.config.pooling.for_pool(&slot.pool);
        let engine = Pooling::new(config, epoch, slot.pool.clone(), shared.credentials.clone());
        let (finalize, finalized) = oneshot::channel();
        let (handle, _task) = pooling::launch(engine, slot.outbound.clone(), finalize, cancel);
        tokio::spawn(async move {
            if let Ok(consensus) = finalized.await {
                let _ = internal.send(Internal::Finalized(consensus));
            }
        });

        for message in slot.pending.drain(..) {
            handle.message(message);
        }
        let favored = slot.favored();
        for hash in slot.blocks.keys() {
            if Some(*hash) != favored {
                handle.send(PoolingEvent::Data(*hash));
            }
        }
        if let Some(hash) = favored {
            handle.seal_block(hash);
        }
        debug!(epoch, sealed = favored.is_some(), "Voting started");
        slot.pooling = Some(handle);
    }

    /// The leader's block did not arrive in time: build one of our own so a
    /// later round has something to vote on.
    fn fallback(&mut self, epoch: Epoch) {
        let me = self.me;
        let slot = self.slot(epoch);
        if !slot.member
            || slot.fallback
            || slot.done
            || slot.leader == Some(me)
            || slot.leader_block.is_some()
            || slot.finalized.is_some()
        {
            return;
        }
        slot.fallback = true;
        info!(epoch, "Leader block missing, building a replacement");
        self.spawn_build(epoch, Instant::now());
    }

    fn window_points(&mut self, now: Instant) {
        let config = &self.shared.config;
        let clock = self.shared.clock;
        let checksum_point = self.span.point(config.checksum_point);
        let reveal_at = clock.start_of(self.span.point(config.statement_reveal));
        let handoff_at = clock.start_of(self.span.point(config.committee_handoff));

        if !self.checksum_started {
            let chain = self.shared.chain.lock();
            if chain.checksum().epoch >= checksum_point {
                // Restored past this window's checksum.
                self.checksum = Some(chain.checksum().clone());
                self.checksum_started = true;
            } else if chain.last_commit_epoch() >= checksum_point {
                self.checksum_started = true;
                let handle = self.shared.chain.clone();
                let internal = self.internal.clone();
                tokio::spawn(async move {
                    let result = clone_checksum(handle, checksum_point).await;
                    let _ = internal.send(Internal::Checksum(result));
                });
            }
        }

        if !self.revealed && self.checksum.is_some() && (now >= reveal_at || now >= handoff_at) {
            self.reveal();
        }
        if !self.handed_off && now >= handoff_at {
            let consensus = self.tally.consensus();
            if let Some(hash) = consensus {
                self.shared.trust_checksum(checksum_point, hash);
            }
            let seed = consensus.or_else(|| self.checksum.as_ref().map(|c| c.hash));
            if let Some(seed) = seed {
                self.handoff(seed);
            }
        }
    }

    fn reveal(&mut self) {
        let Some(checksum) = &self.checksum else {
            return;
        };
        self.revealed = true;
        if !self.member {
            return;
        }
        let statement = ChecksumStatement::naked(
            &self.shared.credentials,
            self.span.start,
            checksum.epoch,
            checksum.hash,
        );
        self.tally.add_naked(&statement);
        self.shared
            .broadcast(&self.members(), &SwellMessage::Naked(statement));
    }

    fn handoff(&mut self, seed: Hash) {
        self.handed_off = true;
        let next = self.span.next();
        // Applications and offenses are read from the committed snapshot only,
        // so nodes agreeing on the checksum agree on the committee.
        let state = match &self.checksum {
            Some(checksum) => checksum.state.clone(),
            None => self.shared.chain.lock().checksum().state.clone(),
        };
        let candidates = state.candidates(next.start);
        let mut validators = self.shared.permission.validators(&candidates, &state);
        if validators.is_empty() {
            warn!(window = next.start, "No eligible candidate, keeping the current committee");
            validators = self.committee.validators().to_vec();
        }
        let committee = Committee::new(validators, seed);
        info!(
            window = next.start,
            validators = committee.size(),
            revealed = self.tally.revealed(),
            seed = %seed,
            "Next committee formed"
        );
        launch(self.shared.clone(), next, committee);
    }

    fn on_input(&mut self, input: WindowInput) {
        match input {
            WindowInput::Pooling(message) => {
                let epoch = message.epoch();
                if !self.span.contains(epoch) {
                    return;
                }
                let slot = self.slot(epoch);
                if !slot.member || slot.done || slot.finalized.is_some() {
                    return;
                }
                match &slot.pooling {
                    Some(handle) => {
                        handle.message(message);
                    }
                    None if slot.pending.len() < MAX_PENDING => slot.pending.push(message),
                    None => debug!(epoch, "Dropping early voting message"),
                }
            }
            WindowInput::Swell { from, message } => self.on_message(from, message),
        }
    }

    fn on_message(&mut self, from: Token, message: SwellMessage) {
        match message {
            SwellMessage::Header(header) => {
                let (epoch, proposer) = (header.epoch, header.proposer);
                self.on_stream(epoch, proposer, StreamEvent::Header(header));
            }
            SwellMessage::Action {
                epoch,
                proposer,
                data,
            } => self.on_stream(epoch, proposer, StreamEvent::Action(data)),
            SwellMessage::Seal {
                epoch,
                proposer,
                seal,
            } => self.on_stream(epoch, proposer, StreamEvent::Seal(seal)),
            SwellMessage::Commit { epoch, hash, commit } => self.check_commit(from, epoch, hash, commit),
            SwellMessage::BlockResponse {
                epoch,
                block: Some(block),
                ..
            } => {
                if let Some(slot) = self.slots.get(&epoch) {
                    if let Some((responses, _)) = &slot.retrieval {
                        let _ = responses.send(block);
                    }
                }
            }
            SwellMessage::Dressed(statement) => {
                self.tally.add_dressed(&statement);
            }
            SwellMessage::Naked(statement) => {
                self.tally.add_naked(&statement);
            }
            other => debug!(peer = %from, kind = other.kind(), "Ignoring message in window"),
        }
    }

    fn on_stream(&mut self, epoch: Epoch, proposer: Token, event: StreamEvent) {
        if !self.span.contains(epoch) || proposer == self.me {
            return;
        }
        let chain = self.shared.chain.clone();
        let internal = self.internal.clone();
        let cancel = self.cancel.clone();
        let slot = self.slot(epoch);
        if slot.done || !slot.pool.contains(&proposer) {
            return;
        }
        let listener = slot.listeners.entry(proposer).or_insert_with(|| {
            let (events, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let result = stream::listen(chain, epoch, proposer, rx, cancel).await;
                let _ = internal.send(Internal::Built {
                    epoch,
                    proposer,
                    result,
                });
            });
            events
        });
        let _ = listener.send(event);
    }

    /// Compares a proposer's commit record with ours.
    fn check_commit(&self, from: Token, epoch: Epoch, hash: Hash, commit: BlockCommit) {
        let chain = self.shared.chain.lock();
        let Some(local) = chain.committed_block(epoch) else {
            return;
        };
        if local.hash() != hash {
            error!(epoch, peer = %from, local = %local.hash(), remote = %hash, "Peer committed a different block");
            return;
        }
        let remote = CommitBlock {
            sealed: local.sealed.clone(),
            commit,
        };
        if !remote.verify() {
            debug!(epoch, peer = %from, "Commit record with bad signature");
            return;
        }
        if remote.commit.fees != local.commit.fees || remote.commit.invalidated != local.commit.invalidated {
            warn!(
                epoch,
                peer = %from,
                local_fees = local.commit.fees,
                remote_fees = remote.commit.fees,
                "Commit diverges from peer"
            );
        }
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Built {
                epoch,
                proposer,
                result,
            } => match result {
                Ok(built) => self.on_block(epoch, proposer, built),
                Err(StreamError::Cancelled) => {}
                Err(e) => debug!(epoch, proposer = %proposer, error = %e, "Block stream failed"),
            },
            Internal::Finalized(consensus) => self.on_finalized(consensus),
            Internal::Retrieved { epoch, hash, block } => self.on_retrieved(epoch, hash, block),
            Internal::Checksum(Ok(checksum)) => {
                self.shared.metrics.checksum_epoch.set(checksum.epoch as i64);
                if self.member {
                    let statement = ChecksumStatement::dressed(
                        &self.shared.credentials,
                        self.span.start,
                        checksum.epoch,
                        checksum.hash,
                    );
                    self.tally.add_dressed(&statement);
                    self.shared
                        .broadcast(&self.members(), &SwellMessage::Dressed(statement));
                }
                info!(epoch = checksum.epoch, hash = %checksum.hash, "Checksum taken");
                self.checksum = Some(checksum);
            }
            Internal::Checksum(Err(e)) => {
                warn!(window = self.span.start, error = %e, "Checksum failed, retrying");
                self.checksum_started = false;
            }
        }
    }

    fn on_block(&mut self, epoch: Epoch, proposer: Token, built: BuiltBlock) {
        let me = self.me;
        let hash = built.block.hash();
        let slot = self.slot(epoch);
        if slot.done {
            return;
        }
        slot.blocks.insert(hash, built);
        if Some(proposer) == slot.leader {
            slot.leader_block = Some(hash);
            if let Some(handle) = &slot.pooling {
                handle.seal_block(hash);
            }
        } else if proposer == me {
            slot.own_block = Some(hash);
            if let (Some(handle), None) = (&slot.pooling, slot.leader_block) {
                handle.seal_block(hash);
            }
        } else if let Some(handle) = &slot.pooling {
            handle.send(PoolingEvent::Data(hash));
        }
        if slot.finalized == Some(hash) {
            self.commit_candidate(epoch, hash);
        }
    }

    fn on_finalized(&mut self, consensus: Consensus) {
        let Consensus {
            epoch,
            value,
            round,
            duplicates,
            data_holders,
            ..
        } = consensus;
        let metrics = &self.shared.metrics;
        metrics.epochs_finalized.inc();
        metrics.extra_rounds.inc_by(round as u64);
        if round > 0 {
            metrics.blank_rounds.inc();
        }
        let latency = Instant::now().saturating_duration_since(self.shared.clock.start_of(epoch));
        metrics.finalize_latency.observe(latency.as_secs_f64());
        if !duplicates.is_empty() {
            metrics.duplicates_detected.inc_by(duplicates.len() as u64);
            warn!(epoch, offenders = duplicates.len(), "Equivocation detected");
            for duplicate in &duplicates {
                self.shared.enqueue(duplicate.serialize());
            }
        }
        info!(epoch, round, hash = %value, "Epoch finalized");

        let me = self.me;
        let slot = self.slot(epoch);
        slot.finalized = Some(value);
        slot.pooling = None;
        if slot.blocks.contains_key(&value) {
            self.commit_candidate(epoch, value);
            return;
        }
        let mut holders: Vec<Token> = data_holders.into_iter().filter(|t| *t != me).collect();
        if holders.is_empty() {
            holders = slot.pool.members().into_iter().filter(|t| *t != me).collect();
        }
        self.start_retrieval(epoch, value, holders);
    }

    fn commit_candidate(&mut self, epoch: Epoch, hash: Hash) {
        let shared = self.shared.clone();
        let slot = self.slot(epoch);
        let Some(built) = slot.blocks.remove(&hash) else {
            return;
        };
        slot.done = true;
        slot.stop_retrieval();
        slot.listeners.clear();
        slot.blocks.clear();
        let result = {
            let mut chain = shared.chain.lock();
            drop_conflicting(&mut chain, epoch, hash);
            chain.add_validated_block(built.block, built.mutations)
        };
        self.after_add(epoch, result);
    }

    fn after_add(&self, epoch: Epoch, result: Result<Vec<Epoch>, ChainError>) {
        match result {
            Ok(committed) => self.shared.publish_commits(&committed),
            Err(ChainError::StaleEpoch { .. }) | Err(ChainError::AlreadySealed { .. }) => {
                debug!(epoch, "Finalized block already known");
            }
            Err(e) => error!(epoch, error = %e, "Cannot add finalized block"),
        }
    }

    fn start_retrieval(&mut self, epoch: Epoch, hash: Hash, holders: Vec<Token>) {
        let shared = self.shared.clone();
        let internal = self.internal.clone();
        let cancel = self.cancel.clone();
        let slot = self.slot(epoch);
        slot.retrievals += 1;
        let (responses, rx) = mpsc::unbounded_channel();
        let retrieval = Retrieval {
            epoch,
            hash,
            holders,
            stagger: shared.config.retrieval_stagger,
            timeout: shared.config.retrieval_timeout,
        };
        let task = tokio::spawn(async move {
            let block = retrieve(retrieval, shared.transport.clone(), rx, cancel).await;
            let _ = internal.send(Internal::Retrieved { epoch, hash, block });
        });
        slot.stop_retrieval();
        slot.retrieval = Some((responses, task));
    }

    fn on_retrieved(&mut self, epoch: Epoch, hash: Hash, block: Option<SealedBlock>) {
        let me = self.me;
        let shared = self.shared.clone();
        let slot = self.slot(epoch);
        if slot.done {
            return;
        }
        slot.retrieval = None;
        match block {
            Some(block) => {
                slot.done = true;
                shared.metrics.blocks_retrieved.inc();
                let result = {
                    let mut chain = shared.chain.lock();
                    drop_conflicting(&mut chain, epoch, hash);
                    chain.add_sealed_block(block)
                };
                self.after_add(epoch, result);
            }
            None if slot.retrievals < MAX_RETRIEVALS => {
                let holders = slot.pool.members().into_iter().filter(|t| *t != me).collect();
                self.start_retrieval(epoch, hash, holders);
            }
            None => {
                slot.done = true;
                let peers: Vec<Token> = slot.pool.members().into_iter().filter(|t| *t != me).collect();
                match peers.get(epoch as usize % peers.len().max(1)) {
                    Some(peer) => shared.request_sync(peer, false),
                    None => error!(epoch, "Finalized block unavailable and no peer to sync from"),
                }
            }
        }
    }
}
