//! Round-based voting engine deciding the block hash of one epoch.
//!
//! Each round goes through `Proposing -> Voting -> Committing`. The round
//! leader proposes a value, pool members vote for it (or blank), and a vote
//! majority turns into commits. A value is final once more than two thirds
//! of the pool weight committed to it in some round. Timeouts and blank
//! consensus move the engine to the next round, and observing enough
//! activity in a later round makes it jump ahead.
//!
//! [`Pooling`] is a plain state machine that returns [`PoolingAction`]s;
//! [`launch`] wraps it in a dispatch task that owns the ballots, performs the
//! broadcasts and runs the timers.

pub mod ballot;
pub mod messages;

pub use ballot::Ballot;
pub use messages::{
    Candidate, Done, Duplicate, PoolingMessage, RoundCommit, RoundMessage, RoundPropose,
    RoundVote,
};

use crate::committee::Pool;
use crate::crypto::{Hash, KeyPair, Token};
use crate::types::{Epoch, Round, Weight};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct PoolingConfig {
    /// Tolerated faulty weight; activity checks need `2f + 1`.
    pub f: Weight,
    pub timeout_propose: Duration,
    pub timeout_vote: Duration,
    pub timeout_commit: Duration,
    /// Messages for rounds further ahead than this are dropped.
    pub max_rounds_ahead: Round,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            f: 0,
            timeout_propose: Duration::from_secs(1),
            timeout_vote: Duration::from_secs(1),
            timeout_commit: Duration::from_secs(1),
            max_rounds_ahead: 64,
        }
    }
}

impl PoolingConfig {
    /// Copy of this configuration with `f` derived from the pool weight.
    pub fn for_pool(&self, pool: &Pool) -> Self {
        Self {
            f: pool.fault_tolerance(),
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoundState {
    Proposing,
    Voting,
    Committing,
}

/// Outcome of a finalized epoch.
#[derive(Clone, Debug)]
pub struct Consensus {
    pub epoch: Epoch,
    pub value: Hash,
    pub round: Round,
    /// Every ballot seen, in round order.
    pub rounds: Vec<Ballot>,
    pub duplicates: Vec<Duplicate>,
    /// Pool members known to hold the block for `value`.
    pub data_holders: Vec<Token>,
}

#[derive(Clone, Debug)]
pub enum PoolingAction {
    Broadcast(Vec<u8>),
    ScheduleTimeout {
        round: Round,
        state: RoundState,
        after: Duration,
    },
    Finalize(Consensus),
}

pub struct Pooling {
    config: PoolingConfig,
    epoch: Epoch,
    pool: Pool,
    credentials: Arc<KeyPair>,
    round: Round,
    state: RoundState,
    ballots: BTreeMap<Round, Ballot>,
    /// Value favored locally: the block this node built or observed.
    sealed: Option<Hash>,
    /// Values whose block this node holds.
    data: HashSet<Hash>,
    /// Last value this node committed to.
    locked: Option<(Round, Hash)>,
    /// Latest round in which a value gathered a vote majority.
    valid: Option<(Round, Hash)>,
    /// Rounds for which this node already sent a proposal.
    proposed: HashSet<Round>,
    armed: HashSet<(Round, RoundState)>,
    duplicates: Vec<Duplicate>,
    evidence_keys: HashSet<(Token, Round, u8)>,
    finalized: bool,
    actions: Vec<PoolingAction>,
}

impl Pooling {
    pub fn new(config: PoolingConfig, epoch: Epoch, pool: Pool, credentials: Arc<KeyPair>) -> Self {
        Self {
            config,
            epoch,
            pool,
            credentials,
            round: 0,
            state: RoundState::Proposing,
            ballots: BTreeMap::new(),
            sealed: None,
            data: HashSet::new(),
            locked: None,
            valid: None,
            proposed: HashSet::new(),
            armed: HashSet::new(),
            duplicates: Vec::new(),
            evidence_keys: HashSet::new(),
            finalized: false,
            actions: Vec::new(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn duplicates(&self) -> &[Duplicate] {
        &self.duplicates
    }

    pub fn ballot(&self, round: Round) -> Option<&Ballot> {
        self.ballots.get(&round)
    }

    fn token(&self) -> Token {
        self.credentials.token()
    }

    /// Opens round 0. Returns the actions to perform.
    pub fn start(&mut self) -> Vec<PoolingAction> {
        self.new_round(0);
        self.check();
        self.take_actions()
    }

    /// Declares the locally built or observed block hash for this epoch.
    pub fn seal_block(&mut self, hash: Hash) -> Vec<PoolingAction> {
        if !self.finalized {
            self.sealed = Some(hash);
            self.data.insert(hash);
            self.try_propose();
            self.check();
        }
        self.take_actions()
    }

    /// Marks a block as held locally without favoring it.
    pub fn add_data(&mut self, hash: Hash) {
        self.data.insert(hash);
    }

    pub fn handle_message(&mut self, message: PoolingMessage) -> Vec<PoolingAction> {
        if self.finalized {
            return Vec::new();
        }
        if message.epoch() != self.epoch {
            debug!(epoch = self.epoch, other = message.epoch(), "Dropping message for another epoch");
            return Vec::new();
        }
        match message {
            PoolingMessage::Propose(propose) => self.on_propose(propose),
            PoolingMessage::Vote(vote) => self.on_vote(vote),
            PoolingMessage::Commit(commit) => self.on_commit(commit),
            PoolingMessage::Duplicate(duplicate) => self.on_duplicate(duplicate),
            PoolingMessage::Done(done) => {
                debug!(epoch = self.epoch, from = %done.token, value = %done.value, "Peer finalized");
            }
            PoolingMessage::Candidate(_) => {}
        }
        self.check();
        self.take_actions()
    }

    /// Timer expiry. Ignored unless the engine is still in `round`/`state`.
    pub fn handle_timeout(&mut self, round: Round, state: RoundState) -> Vec<PoolingAction> {
        if self.finalized || round != self.round || state != self.state {
            return Vec::new();
        }
        debug!(epoch = self.epoch, round, ?state, "Round timeout");
        match state {
            RoundState::Proposing => {
                self.cast_vote(true, Hash::ZERO);
                self.state = RoundState::Voting;
            }
            RoundState::Voting => {
                self.cast_commit(true, Hash::ZERO);
                self.state = RoundState::Committing;
            }
            RoundState::Committing => self.new_round(self.round + 1),
        }
        self.check();
        self.take_actions()
    }

    fn take_actions(&mut self) -> Vec<PoolingAction> {
        std::mem::take(&mut self.actions)
    }

    fn accepts_round(&self, round: Round) -> bool {
        round <= self.round.saturating_add(self.config.max_rounds_ahead)
    }

    fn ballot_mut(&mut self, round: Round) -> &mut Ballot {
        let total = self.pool.total_weight();
        self.ballots
            .entry(round)
            .or_insert_with(|| Ballot::new(round, total))
    }

    fn record_duplicate(&mut self, one: RoundMessage, two: RoundMessage) {
        let kind = match &one {
            RoundMessage::Propose(_) => messages::PROPOSE,
            RoundMessage::Vote(_) => messages::VOTE,
            RoundMessage::Commit(_) => messages::COMMIT,
        };
        if !self.evidence_keys.insert((one.token(), one.round(), kind)) {
            return;
        }
        warn!(epoch = self.epoch, round = one.round(), offender = %one.token(), "Equivocation detected");
        let duplicate = Duplicate { one, two };
        // Peers that only saw one of the two messages need the evidence to
        // get it committed.
        self.actions
            .push(PoolingAction::Broadcast(duplicate.serialize()));
        self.duplicates.push(duplicate);
    }

    fn on_propose(&mut self, propose: RoundPropose) {
        if self.pool.leader(propose.round) != Some(propose.token) {
            debug!(epoch = self.epoch, round = propose.round, from = %propose.token, "Proposal from non-leader");
            return;
        }
        if !self.accepts_round(propose.round) {
            return;
        }
        if let Some(earlier) = self.ballot_mut(propose.round).set_proposal(propose.clone()) {
            self.record_duplicate(RoundMessage::Propose(earlier), RoundMessage::Propose(propose));
        }
    }

    fn on_vote(&mut self, mut vote: RoundVote) {
        let weight = self.pool.weight(&vote.token);
        if weight == 0 || !self.accepts_round(vote.round) {
            debug!(epoch = self.epoch, round = vote.round, from = %vote.token, "Dropping vote");
            return;
        }
        vote.weight = weight;
        let (conflict, _) = self.ballot_mut(vote.round).incorporate_vote(vote.clone());
        if let Some(earlier) = conflict {
            self.record_duplicate(RoundMessage::Vote(earlier), RoundMessage::Vote(vote));
        }
    }

    fn on_commit(&mut self, mut commit: RoundCommit) {
        let weight = self.pool.weight(&commit.token);
        if weight == 0 || !self.accepts_round(commit.round) {
            debug!(epoch = self.epoch, round = commit.round, from = %commit.token, "Dropping commit");
            return;
        }
        commit.weight = weight;
        let (conflict, _) = self.ballot_mut(commit.round).incorporate_commit(commit.clone());
        if let Some(earlier) = conflict {
            self.record_duplicate(RoundMessage::Commit(earlier), RoundMessage::Commit(commit));
        }
    }

    fn on_duplicate(&mut self, duplicate: Duplicate) {
        if !self.pool.contains(&duplicate.offender()) {
            return;
        }
        let Duplicate { one, two } = duplicate;
        self.record_duplicate(one, two);
    }

    fn new_round(&mut self, round: Round) {
        debug!(epoch = self.epoch, round, "New round");
        self.round = round;
        self.state = RoundState::Proposing;
        self.ballot_mut(round);
        self.actions.push(PoolingAction::ScheduleTimeout {
            round,
            state: RoundState::Proposing,
            after: self.config.timeout_propose,
        });
        self.try_propose();
    }

    fn arm(&mut self, state: RoundState, after: Duration) {
        if self.armed.insert((self.round, state)) {
            self.actions.push(PoolingAction::ScheduleTimeout {
                round: self.round,
                state,
                after,
            });
        }
    }

    /// Leader proposal: the locked value, else the last majority value, else
    /// the local sealed value.
    fn try_propose(&mut self) {
        let round = self.round;
        if self.state != RoundState::Proposing
            || self.pool.leader(round) != Some(self.token())
            || self.proposed.contains(&round)
        {
            return;
        }
        let (value, last_valid_round) = match (self.locked, self.valid) {
            (Some((_, value)), Some((valid_round, valid_value))) if valid_value == value => {
                (value, Some(valid_round))
            }
            (Some((locked_round, value)), _) => (value, Some(locked_round)),
            (None, Some((valid_round, value))) => (value, Some(valid_round)),
            (None, None) => match self.sealed {
                Some(value) => (value, None),
                None => return,
            },
        };
        self.proposed.insert(round);
        let propose = RoundPropose::new(&self.credentials, self.epoch, round, value, last_valid_round);
        self.ballot_mut(round).set_proposal(propose.clone());
        self.actions
            .push(PoolingAction::Broadcast(propose.serialize()));
    }

    fn cast_vote(&mut self, blank: bool, value: Hash) {
        let round = self.round;
        let me = self.token();
        if self.ballot_mut(round).has_vote_from(&me) {
            return;
        }
        let has_data = !blank && self.data.contains(&value);
        let mut vote = RoundVote::new(&self.credentials, self.epoch, round, blank, value, has_data);
        self.actions.push(PoolingAction::Broadcast(vote.serialize()));
        vote.weight = self.pool.weight(&vote.token);
        if vote.weight > 0 {
            self.ballot_mut(round).incorporate_vote(vote);
        }
    }

    fn cast_commit(&mut self, blank: bool, value: Hash) {
        let round = self.round;
        let me = self.token();
        if self.ballot_mut(round).has_commit_from(&me) {
            return;
        }
        let mut commit = RoundCommit::new(&self.credentials, self.epoch, round, blank, value);
        self.actions.push(PoolingAction::Broadcast(commit.serialize()));
        commit.weight = self.pool.weight(&commit.token);
        if commit.weight > 0 {
            self.ballot_mut(round).incorporate_commit(commit);
        }
    }

    /// Whether the current round's proposal may be voted for.
    fn acceptable_proposal(&self) -> Option<Hash> {
        let proposal = self.ballots.get(&self.round)?.proposal()?;
        let value = proposal.value;
        let not_contrary = match self.locked {
            None => true,
            Some((_, locked)) if locked == value => true,
            Some((locked_round, _)) => proposal
                .last_valid_round
                .is_some_and(|valid_round| valid_round >= locked_round),
        };
        if !not_contrary {
            return None;
        }
        // After round 0 any block this node holds is acceptable, so a
        // replacement block can win when the epoch leader's never arrived.
        let held = self.sealed == Some(value) || (self.round > 0 && self.data.contains(&value));
        match proposal.last_valid_round {
            None => held.then_some(value),
            Some(valid_round) if valid_round < self.round => self
                .ballots
                .get(&valid_round)
                .filter(|ballot| ballot.has_majority_for_value(&value))
                .map(|_| value),
            Some(_) => None,
        }
    }

    fn check(&mut self) {
        if self.finalized {
            return;
        }

        // 1. Finalization in any round.
        let finalized = self
            .ballots
            .values()
            .find_map(|ballot| ballot.finalized().map(|value| (ballot.round(), value)));
        if let Some((round, value)) = finalized {
            self.finalize(round, value);
            return;
        }

        // Track the latest vote majority for later proposals.
        if let Some((round, value)) = self
            .ballots
            .values()
            .rev()
            .find_map(|ballot| ballot.consensus().map(|value| (ballot.round(), value)))
        {
            if self.valid.map_or(true, |(valid_round, _)| round > valid_round) {
                self.valid = Some((round, value));
            }
        }

        let f = self.config.f;

        // 2. Commit activity without a final value.
        if self.ballots.get(&self.round).is_some_and(|b| b.has_commit_quorum(f)) {
            self.arm(RoundState::Committing, self.config.timeout_commit);
        }

        // 3. Jump ahead to a busier later round.
        let ahead = self
            .ballots
            .range(self.round + 1..)
            .rev()
            .find(|(_, ballot)| ballot.activity_weight() > 2 * f)
            .map(|(round, _)| *round);
        if let Some(round) = ahead {
            info!(epoch = self.epoch, from = self.round, to = round, "Jumping ahead");
            self.new_round(round);
        }

        // 4. Proposing: vote once the proposal is acceptable.
        if self.state == RoundState::Proposing {
            if let Some(value) = self.acceptable_proposal() {
                self.cast_vote(false, value);
                self.state = RoundState::Voting;
            }
        }

        // 5. Voting: commit on majority or blank consensus.
        if self.state == RoundState::Voting {
            let round = self.round;
            let ballot = self.ballot_mut(round);
            let consensus = ballot.consensus();
            let blank = ballot.has_blank_consensus();
            let quorum = ballot.has_quorum(f);
            if let Some(value) = consensus {
                self.locked = Some((round, value));
                self.cast_commit(false, value);
                self.state = RoundState::Committing;
            } else if blank {
                self.cast_commit(true, Hash::ZERO);
                self.state = RoundState::Committing;
            } else if quorum {
                self.arm(RoundState::Voting, self.config.timeout_vote);
            }
        }

        // Re-check after our own commit, then move on after blank commits.
        if self.state == RoundState::Committing {
            if let Some(value) = self.ballots.get(&self.round).and_then(Ballot::finalized) {
                let round = self.round;
                self.finalize(round, value);
                return;
            }
            if self
                .ballots
                .get(&self.round)
                .is_some_and(Ballot::has_blank_commit_consensus)
            {
                self.new_round(self.round + 1);
                self.check();
            }
        }
    }

    fn finalize(&mut self, round: Round, value: Hash) {
        self.finalized = true;
        info!(epoch = self.epoch, round, value = %value, "Epoch finalized");
        let done = Done::new(&self.credentials, self.epoch, round, value);
        self.actions.push(PoolingAction::Broadcast(done.serialize()));

        let mut data_holders: Vec<Token> = Vec::new();
        for ballot in self.ballots.values() {
            if let Some(proposal) = ballot.proposal().filter(|p| p.value == value) {
                data_holders.push(proposal.token);
            }
            data_holders.extend(ballot.data_holders(&value));
        }
        let mut seen = HashSet::new();
        data_holders.retain(|token| seen.insert(*token) && *token != self.credentials.token());

        self.actions.push(PoolingAction::Finalize(Consensus {
            epoch: self.epoch,
            value,
            round,
            rounds: self.ballots.values().cloned().collect(),
            duplicates: self.duplicates.clone(),
            data_holders,
        }));
    }
}

/// Input to a running engine.
#[derive(Clone, Debug)]
pub enum PoolingEvent {
    Message(PoolingMessage),
    Seal(Hash),
    Data(Hash),
    Timeout { round: Round, state: RoundState },
}

/// Sending half of a running engine's queue.
#[derive(Clone, Debug)]
pub struct PoolingHandle {
    epoch: Epoch,
    events: mpsc::UnboundedSender<PoolingEvent>,
}

impl PoolingHandle {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Returns false once the engine has stopped.
    pub fn send(&self, event: PoolingEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn seal_block(&self, hash: Hash) -> bool {
        self.send(PoolingEvent::Seal(hash))
    }

    pub fn message(&self, message: PoolingMessage) -> bool {
        self.send(PoolingEvent::Message(message))
    }
}

/// Runs `pooling` as a dispatch task. Broadcasts go to `outbound`; the
/// consensus, if reached, is sent on `finalize`. Timers are aborted when the
/// task ends, whether by finalization or `cancel`.
pub fn launch(
    mut pooling: Pooling,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    finalize: oneshot::Sender<Consensus>,
    cancel: CancellationToken,
) -> (PoolingHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = PoolingHandle {
        epoch: pooling.epoch(),
        events: tx.clone(),
    };

    let task = tokio::spawn(async move {
        let mut timers: Vec<JoinHandle<()>> = Vec::new();
        let mut finalize = Some(finalize);
        let mut pending = pooling.start();

        loop {
            for action in pending.drain(..) {
                match action {
                    PoolingAction::Broadcast(data) => {
                        let _ = outbound.send(data);
                    }
                    PoolingAction::ScheduleTimeout { round, state, after } => {
                        let tx = tx.clone();
                        timers.retain(|timer| !timer.is_finished());
                        timers.push(tokio::spawn(async move {
                            tokio::time::sleep(after).await;
                            let _ = tx.send(PoolingEvent::Timeout { round, state });
                        }));
                    }
                    PoolingAction::Finalize(consensus) => {
                        if let Some(sender) = finalize.take() {
                            let _ = sender.send(consensus);
                        }
                    }
                }
            }
            if pooling.is_finalized() {
                break;
            }

            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            pending = match event {
                PoolingEvent::Message(message) => pooling.handle_message(message),
                PoolingEvent::Seal(hash) => pooling.seal_block(hash),
                PoolingEvent::Data(hash) => {
                    pooling.add_data(hash);
                    Vec::new()
                }
                PoolingEvent::Timeout { round, state } => pooling.handle_timeout(round, state),
            };
        }

        for timer in timers {
            timer.abort();
        }
        debug!(epoch = pooling.epoch(), finalized = pooling.is_finalized(), "Pooling stopped");
    });

    (handle, task)
}
