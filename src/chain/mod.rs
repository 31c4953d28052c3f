//! Ledger state machine.
//!
//! A block is born live in a [`BlockBuilder`], becomes a [`SealedBlock`] once
//! its hash is fixed and signed, and turns into a [`CommitBlock`] when it is
//! re-validated against the commit state and merged into it. Commits advance
//! strictly one epoch at a time.
//!
//! The chain keeps the commit state, sealed blocks ahead of it, a buffer of
//! recent committed blocks reaching back to the current [`Checksum`], and the
//! checksum itself. All of it sits behind a single lock owned by the epoch
//! driver.

pub mod action;
pub mod block;
pub mod checksum;
pub mod state;

pub use action::{Action, Entry, ACTION_VALIDITY, CANDIDACY_LEAD};
pub use block::{BlockBuilder, BlockCommit, BlockHeader, BlockSeal, CommitBlock, SealedBlock};
pub use checksum::{clone_checksum, Checksum, ChecksumJob};
pub use state::{KnownActions, MutatingState, Mutations, Wallet};

use crate::crypto::{Hash, KeyPair};
use crate::types::Epoch;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("epoch {epoch} is at or before the last commit {last_commit}")]
    StaleEpoch { epoch: Epoch, last_commit: Epoch },
    #[error("epoch {epoch} is already sealed")]
    AlreadySealed { epoch: Epoch },
    #[error("cannot commit epoch {epoch}, next commit must be {expected}")]
    OutOfOrderCommit { epoch: Epoch, expected: Epoch },
    #[error("no sealed block for epoch {epoch}")]
    NotSealed { epoch: Epoch },
    #[error("seal hash does not match block content at epoch {epoch}")]
    SealMismatch { epoch: Epoch },
    #[error("invalid proposer signature at epoch {epoch}")]
    InvalidSignature { epoch: Epoch },
    #[error("block at epoch {epoch} belongs to another network")]
    WrongNetwork { epoch: Epoch },
    #[error("checkpoint {checkpoint} predates the checksum at {checksum}")]
    CheckpointUnavailable { checkpoint: Epoch, checksum: Epoch },
    #[error("block for epoch {epoch} is not available")]
    MissingBlock { epoch: Epoch },
    #[error("cannot roll over to {epoch} before the last commit {last_commit} outside recovery")]
    RolloverBeforeCommit { epoch: Epoch, last_commit: Epoch },
    #[error("recovery to {epoch} outside retained range {from}..={to}")]
    RecoveryOutOfRange { epoch: Epoch, from: Epoch, to: Epoch },
    #[error("a checksum clone at epoch {epoch} is already in flight")]
    ChecksumInFlight { epoch: Epoch },
    #[error("checksum at epoch {epoch} does not match the clone in flight")]
    UnexpectedChecksum { epoch: Epoch },
    #[error("checksum clone at epoch {epoch} was aborted")]
    ChecksumAborted { epoch: Epoch },
    #[error("checksum epoch {epoch} outside {from}..={to}")]
    ChecksumOutOfRange { epoch: Epoch, from: Epoch, to: Epoch },
    #[error("epoch {epoch} is beyond the sealing horizon {limit}")]
    TooFarAhead { epoch: Epoch, limit: Epoch },
}

/// Default number of epochs past the last commit a block may be sealed at.
pub const MAX_SEALED_AHEAD: Epoch = 256;

/// Outcome of validating a block's actions against some state.
#[derive(Clone, Debug, Default)]
struct Validated {
    mutations: Mutations,
    invalidated: Vec<Hash>,
    invalid_fees: u64,
    /// Commit epoch of the state the actions were validated against, when
    /// that state was exactly the commit state with nothing in between.
    base_epoch: Option<Epoch>,
}

#[derive(Clone, Debug)]
struct SealedEntry {
    block: SealedBlock,
    validated: Validated,
}

#[derive(Clone, Debug)]
struct CommittedEntry {
    block: CommitBlock,
    mutations: Mutations,
}

pub struct Chain {
    network_hash: Hash,
    credentials: KeyPair,
    last_commit_epoch: Epoch,
    last_commit_hash: Hash,
    commit_state: Arc<Wallet>,
    known_actions: Arc<KnownActions>,
    sealed: BTreeMap<Epoch, SealedEntry>,
    recent: BTreeMap<Epoch, CommittedEntry>,
    recent_blocks: usize,
    max_sealed_ahead: Epoch,
    checksum: Checksum,
    cloning: Option<Epoch>,
}

impl Chain {
    /// Chain with `wallet` committed at epoch 0 and used as the first checksum.
    pub fn genesis(network_hash: Hash, wallet: Wallet, credentials: KeyPair) -> Self {
        let state = Arc::new(wallet);
        let genesis_hash = Hash::of_parts(&[&network_hash.0, &state.hash().0]);
        let checksum = Checksum::compute(0, state.clone(), genesis_hash);
        Self::from_checksum(network_hash, checksum, credentials)
    }

    /// Chain resuming from a snapshot received over sync.
    pub fn from_checksum(network_hash: Hash, checksum: Checksum, credentials: KeyPair) -> Self {
        Self {
            network_hash,
            credentials,
            last_commit_epoch: checksum.epoch,
            last_commit_hash: checksum.last_block_hash,
            commit_state: checksum.state.clone(),
            known_actions: Arc::default(),
            sealed: BTreeMap::new(),
            recent: BTreeMap::new(),
            recent_blocks: 64,
            max_sealed_ahead: MAX_SEALED_AHEAD,
            checksum,
            cloning: None,
        }
    }

    /// Minimum number of committed blocks kept regardless of checksum.
    pub fn with_recent_blocks(mut self, recent_blocks: usize) -> Self {
        self.recent_blocks = recent_blocks;
        self
    }

    /// How far past the last commit sealed blocks are accepted.
    pub fn with_max_sealed_ahead(mut self, max_sealed_ahead: Epoch) -> Self {
        self.max_sealed_ahead = max_sealed_ahead.max(1);
        self
    }

    fn check_horizon(&self, epoch: Epoch) -> Result<(), ChainError> {
        let limit = self.last_commit_epoch.saturating_add(self.max_sealed_ahead);
        if epoch > limit {
            return Err(ChainError::TooFarAhead { epoch, limit });
        }
        Ok(())
    }

    pub fn network_hash(&self) -> Hash {
        self.network_hash
    }

    pub fn credentials(&self) -> &KeyPair {
        &self.credentials
    }

    pub fn last_commit_epoch(&self) -> Epoch {
        self.last_commit_epoch
    }

    pub fn last_commit_hash(&self) -> Hash {
        self.last_commit_hash
    }

    pub fn commit_state(&self) -> Arc<Wallet> {
        self.commit_state.clone()
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn is_sealed(&self, epoch: Epoch) -> bool {
        self.sealed.contains_key(&epoch)
    }

    pub fn sealed_block(&self, epoch: Epoch) -> Option<&SealedBlock> {
        self.sealed.get(&epoch).map(|entry| &entry.block)
    }

    pub fn committed_block(&self, epoch: Epoch) -> Option<&CommitBlock> {
        self.recent.get(&epoch).map(|entry| &entry.block)
    }

    pub fn sealed_blocks(&self) -> Vec<SealedBlock> {
        self.sealed.values().map(|entry| entry.block.clone()).collect()
    }

    /// Sealed or recently committed block with the given seal hash.
    pub fn block_by_hash(&self, epoch: Epoch, hash: &Hash) -> Option<SealedBlock> {
        if let Some(entry) = self.sealed.get(&epoch) {
            if entry.block.hash() == *hash {
                return Some(entry.block.clone());
            }
        }
        self.recent
            .get(&epoch)
            .filter(|entry| entry.block.hash() == *hash)
            .map(|entry| entry.block.sealed.clone())
    }

    /// Every retained committed block after `epoch`, or `None` when blocks
    /// that old are no longer retained.
    pub fn committed_after(&self, epoch: Epoch) -> Option<Vec<CommitBlock>> {
        if epoch >= self.last_commit_epoch {
            return Some(Vec::new());
        }
        let oldest = self
            .recent
            .keys()
            .next()
            .copied()
            .unwrap_or(self.last_commit_epoch + 1);
        if epoch + 1 < oldest {
            return None;
        }
        Some(
            self.recent
                .range(epoch + 1..)
                .map(|(_, entry)| entry.block.clone())
                .collect(),
        )
    }

    /// Header for a new block at `epoch`, referencing the current commit.
    pub fn next_block(&self, epoch: Epoch) -> Result<BlockHeader, ChainError> {
        if epoch <= self.last_commit_epoch {
            return Err(ChainError::StaleEpoch {
                epoch,
                last_commit: self.last_commit_epoch,
            });
        }
        if self.sealed.contains_key(&epoch) {
            return Err(ChainError::AlreadySealed { epoch });
        }
        Ok(BlockHeader {
            network_hash: self.network_hash,
            epoch,
            checkpoint: self.last_commit_epoch,
            checkpoint_hash: self.last_commit_hash,
            proposer: self.credentials.token(),
            proposed_at: block::unix_millis(),
        })
    }

    /// Validation context for a block with `header`.
    ///
    /// When the header's checkpoint is at or past the local commit, the base
    /// is the commit state; when it predates the commit, the base is the
    /// checksum snapshot. Either way the mutations of every retained block
    /// between the base and the header's epoch are merged on top, so a block
    /// validates the same way regardless of how far commits have moved since
    /// it was proposed.
    pub fn checkpoint_validator(&self, header: &BlockHeader) -> Result<MutatingState, ChainError> {
        if header.network_hash != self.network_hash {
            return Err(ChainError::WrongNetwork {
                epoch: header.epoch,
            });
        }
        if header.epoch <= self.last_commit_epoch {
            return Err(ChainError::StaleEpoch {
                epoch: header.epoch,
                last_commit: self.last_commit_epoch,
            });
        }
        self.check_horizon(header.epoch)?;
        let (base, base_epoch) = if header.checkpoint >= self.last_commit_epoch {
            (self.commit_state.clone(), self.last_commit_epoch)
        } else {
            if header.checkpoint < self.checksum.epoch {
                return Err(ChainError::CheckpointUnavailable {
                    checkpoint: header.checkpoint,
                    checksum: self.checksum.epoch,
                });
            }
            (self.checksum.state.clone(), self.checksum.epoch)
        };
        let mut mutations = Mutations::new();
        for epoch in base_epoch + 1..header.epoch {
            if let Some(entry) = self.recent.get(&epoch) {
                mutations.merge(&entry.mutations);
            } else if let Some(entry) = self.sealed.get(&epoch) {
                mutations.merge(&entry.validated.mutations);
            } else if epoch <= header.checkpoint {
                // The proposer had this block committed; we must know it too.
                return Err(ChainError::MissingBlock { epoch });
            }
        }
        Ok(MutatingState::new(
            base,
            self.known_actions.clone(),
            mutations,
            header.epoch,
        ))
    }

    fn validate_block(block: &SealedBlock, mut validator: MutatingState) -> Validated {
        let mut validated = Validated::default();
        for data in &block.actions {
            let hash = Hash::of(data);
            let Ok(entry) = Entry::parse(data) else {
                validated.invalidated.push(hash);
                continue;
            };
            if !validator.validate_entry(&entry, hash) {
                validated.invalidated.push(hash);
                validated.invalid_fees = validated.invalid_fees.saturating_add(entry.fee());
            }
        }
        validated.mutations = validator.into_mutations();
        validated
    }

    fn precheck_sealed(&self, block: &SealedBlock) -> Result<(), ChainError> {
        let epoch = block.epoch();
        if epoch <= self.last_commit_epoch {
            return Err(ChainError::StaleEpoch {
                epoch,
                last_commit: self.last_commit_epoch,
            });
        }
        self.check_horizon(epoch)?;
        if self.sealed.contains_key(&epoch) {
            return Err(ChainError::AlreadySealed { epoch });
        }
        if block.header.network_hash != self.network_hash {
            return Err(ChainError::WrongNetwork { epoch });
        }
        Ok(())
    }

    /// Adds a sealed block. If it closes the gap to the next commit epoch it is
    /// committed together with every contiguous sealed block after it.
    ///
    /// Returns the epochs committed as a result.
    pub fn add_sealed_block(&mut self, block: SealedBlock) -> Result<Vec<Epoch>, ChainError> {
        self.precheck_sealed(&block)?;
        let epoch = block.epoch();
        let exact_base = block.header.checkpoint == self.last_commit_epoch
            && epoch == self.last_commit_epoch + 1;
        let validated = match self.checkpoint_validator(&block.header) {
            Ok(validator) => {
                let mut validated = Self::validate_block(&block, validator);
                if exact_base {
                    validated.base_epoch = Some(self.last_commit_epoch);
                }
                validated
            }
            Err(err) => {
                // Still accepted: consensus finalized it. Commit re-validates.
                debug!(epoch, error = %err, "Sealed block added without checkpoint validation");
                Validated::default()
            }
        };
        debug!(epoch, hash = %block.hash(), actions = block.actions.len(), "Sealed block added");
        self.sealed.insert(epoch, SealedEntry { block, validated });
        if epoch == self.last_commit_epoch + 1 {
            return self.commit_all();
        }
        Ok(Vec::new())
    }

    /// Like [`Chain::add_sealed_block`] with mutations already computed by the
    /// builder or stream replay that produced the block.
    pub fn add_validated_block(
        &mut self,
        block: SealedBlock,
        mutations: Mutations,
    ) -> Result<Vec<Epoch>, ChainError> {
        self.precheck_sealed(&block)?;
        let epoch = block.epoch();
        self.sealed.insert(
            epoch,
            SealedEntry {
                block,
                validated: Validated {
                    mutations,
                    ..Validated::default()
                },
            },
        );
        if epoch == self.last_commit_epoch + 1 {
            return self.commit_all();
        }
        Ok(Vec::new())
    }

    /// Commits every contiguous sealed block after the last commit.
    pub fn commit_all(&mut self) -> Result<Vec<Epoch>, ChainError> {
        let mut committed = Vec::new();
        while self.sealed.contains_key(&(self.last_commit_epoch + 1)) {
            let epoch = self.last_commit_epoch + 1;
            self.commit_block(epoch)?;
            committed.push(epoch);
        }
        Ok(committed)
    }

    /// Commits the sealed block at `epoch`, which must be the next epoch.
    ///
    /// Every action is re-validated against the commit state unless the block
    /// was already validated against exactly this state. Actions that fail are
    /// recorded as invalidated and their fees withheld; the remaining fees are
    /// credited to the proposer. On error nothing is changed.
    pub fn commit_block(&mut self, epoch: Epoch) -> Result<Hash, ChainError> {
        let expected = self.last_commit_epoch + 1;
        if epoch != expected {
            return Err(ChainError::OutOfOrderCommit { epoch, expected });
        }
        let entry = self
            .sealed
            .get(&epoch)
            .ok_or(ChainError::NotSealed { epoch })?;
        let pass_through = entry.block.header.checkpoint == self.last_commit_epoch
            && entry.validated.base_epoch == Some(self.last_commit_epoch);
        let validated = if pass_through {
            entry.validated.clone()
        } else {
            let validator = MutatingState::new(
                self.commit_state.clone(),
                self.known_actions.clone(),
                Mutations::new(),
                epoch,
            );
            Self::validate_block(&entry.block, validator)
        };

        let Some(entry) = self.sealed.remove(&epoch) else {
            return Err(ChainError::NotSealed { epoch });
        };
        let block = entry.block;
        let fees = block.seal.fees.saturating_sub(validated.invalid_fees);
        let mut mutations = validated.mutations;
        mutations.credit(block.header.proposer, fees);

        let state = Arc::make_mut(&mut self.commit_state);
        state.apply(&mutations);
        state.retire(epoch);
        let known = Arc::make_mut(&mut self.known_actions);
        for data in &block.actions {
            let hash = Hash::of(data);
            if mutations.contains_action(&hash) {
                known.insert(hash, epoch);
            }
        }
        known.retain(|_, included| *included + ACTION_VALIDITY > epoch);

        if !validated.invalidated.is_empty() {
            warn!(
                epoch,
                invalidated = validated.invalidated.len(),
                "Actions invalidated at commit"
            );
        }
        let hash = block.hash();
        let committed = block.commit(validated.invalidated, fees, &self.credentials);
        self.recent.insert(
            epoch,
            CommittedEntry {
                block: committed,
                mutations,
            },
        );
        self.last_commit_epoch = epoch;
        self.last_commit_hash = hash;
        self.prune_recent();
        info!(epoch, hash = %hash, fees, "Block committed");
        Ok(hash)
    }

    fn prune_recent(&mut self) {
        let keep_from = self
            .checksum
            .epoch
            .min(self.last_commit_epoch.saturating_sub(self.recent_blocks as Epoch));
        self.recent = self.recent.split_off(&(keep_from + 1));
    }

    /// Discards sealed blocks after `epoch`.
    pub fn rollover(&mut self, epoch: Epoch) -> Result<(), ChainError> {
        if epoch < self.last_commit_epoch {
            return Err(ChainError::RolloverBeforeCommit {
                epoch,
                last_commit: self.last_commit_epoch,
            });
        }
        let dropped = self.sealed.split_off(&(epoch + 1));
        if !dropped.is_empty() {
            info!(epoch, dropped = dropped.len(), "Rolled over sealed blocks");
        }
        Ok(())
    }

    /// Disaster recovery: rebuilds the commit state from the checksum plus
    /// retained committed blocks up to `epoch`, dropping everything after it.
    pub fn recovery(&mut self, epoch: Epoch) -> Result<(), ChainError> {
        let from = self.checksum.epoch;
        let to = self.last_commit_epoch;
        if epoch < from || epoch > to {
            return Err(ChainError::RecoveryOutOfRange { epoch, from, to });
        }
        let mut state = (*self.checksum.state).clone();
        let mut known = KnownActions::new();
        let mut last_hash = self.checksum.last_block_hash;
        for replay in from + 1..=epoch {
            let entry = self
                .recent
                .get(&replay)
                .ok_or(ChainError::MissingBlock { epoch: replay })?;
            state.apply(&entry.mutations);
            state.retire(replay);
            for data in &entry.block.sealed.actions {
                let hash = Hash::of(data);
                if entry.mutations.contains_action(&hash) {
                    known.insert(hash, replay);
                }
            }
            last_hash = entry.block.hash();
        }
        known.retain(|_, included| *included + ACTION_VALIDITY > epoch);

        self.recent.retain(|e, _| *e <= epoch);
        self.sealed.clear();
        self.commit_state = Arc::new(state);
        self.known_actions = Arc::new(known);
        self.last_commit_epoch = epoch;
        self.last_commit_hash = last_hash;
        info!(epoch, checksum = from, "Recovered chain state");
        Ok(())
    }

    /// Starts a checksum of the commit state as of `epoch`, which must lie
    /// after the current checksum and at or before the last commit.
    ///
    /// The job shares the wallet copy-on-write, so later commits do not affect
    /// it. For an epoch behind the last commit, the retained blocks up to it
    /// are merged on top of the current checksum state.
    pub fn begin_checksum(&mut self, epoch: Epoch) -> Result<ChecksumJob, ChainError> {
        if let Some(epoch) = self.cloning {
            return Err(ChainError::ChecksumInFlight { epoch });
        }
        let from = self.checksum.epoch;
        let to = self.last_commit_epoch;
        if epoch <= from || epoch > to {
            return Err(ChainError::ChecksumOutOfRange { epoch, from, to });
        }
        let job = if epoch == to {
            ChecksumJob {
                epoch,
                base: self.commit_state.clone(),
                mutations: Mutations::new(),
                last_block_hash: self.last_commit_hash,
            }
        } else {
            let mut mutations = Mutations::new();
            let mut last_block_hash = self.checksum.last_block_hash;
            for replay in from + 1..=epoch {
                let entry = self
                    .recent
                    .get(&replay)
                    .ok_or(ChainError::MissingBlock { epoch: replay })?;
                mutations.merge(&entry.mutations);
                last_block_hash = entry.block.hash();
            }
            ChecksumJob {
                epoch,
                base: self.checksum.state.clone(),
                mutations,
                last_block_hash,
            }
        };
        self.cloning = Some(epoch);
        Ok(job)
    }

    /// Replaces the whole ledger with a snapshot received over sync. Snapshots
    /// at or behind the last commit are ignored.
    pub fn restore(&mut self, checksum: Checksum) -> bool {
        if checksum.epoch <= self.last_commit_epoch {
            return false;
        }
        info!(
            epoch = checksum.epoch,
            last_commit = self.last_commit_epoch,
            "Restoring chain from checksum"
        );
        let restored = Self::from_checksum(self.network_hash, checksum, self.credentials.clone())
            .with_recent_blocks(self.recent_blocks)
            .with_max_sealed_ahead(self.max_sealed_ahead);
        *self = restored;
        true
    }

    pub fn abort_checksum(&mut self) {
        self.cloning = None;
    }

    pub fn finish_checksum(&mut self, checksum: Checksum) -> Result<(), ChainError> {
        if self.cloning != Some(checksum.epoch) || checksum.epoch > self.last_commit_epoch {
            return Err(ChainError::UnexpectedChecksum {
                epoch: checksum.epoch,
            });
        }
        self.cloning = None;
        self.checksum = checksum;
        self.prune_recent();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        chain: Chain,
        leader: KeyPair,
        alice: KeyPair,
        bob: KeyPair,
    }

    fn fixture() -> Fixture {
        let leader = KeyPair::from_seed(&[1; 32]);
        let alice = KeyPair::from_seed(&[2; 32]);
        let bob = KeyPair::from_seed(&[3; 32]);
        let wallet = Wallet::new(vec![(alice.token(), 1_000), (bob.token(), 10)]);
        let chain = Chain::genesis(Hash::of(b"testnet"), wallet, leader.clone());
        Fixture {
            chain,
            leader,
            alice,
            bob,
        }
    }

    fn build(chain: &Chain, leader: &KeyPair, epoch: Epoch, actions: &[Action]) -> SealedBlock {
        let mut header = chain.next_block(epoch).unwrap();
        header.proposer = leader.token();
        let validator = chain.checkpoint_validator(&header).unwrap();
        let mut builder = BlockBuilder::new(header, validator);
        for action in actions {
            builder.push(&action.serialize());
        }
        builder.seal(leader).0
    }

    #[test]
    fn test_next_block_rejects_stale_and_sealed_epochs() {
        let mut f = fixture();
        assert_eq!(
            f.chain.next_block(0),
            Err(ChainError::StaleEpoch {
                epoch: 0,
                last_commit: 0
            })
        );
        let block = build(&f.chain, &f.leader, 2, &[]);
        f.chain.add_sealed_block(block).unwrap();
        assert_eq!(
            f.chain.next_block(2),
            Err(ChainError::AlreadySealed { epoch: 2 })
        );
        let header = f.chain.next_block(3).unwrap();
        assert_eq!(header.checkpoint, 0);
    }

    #[test]
    fn test_commit_sequencing() {
        let mut f = fixture();
        let block = build(&f.chain, &f.leader, 1, &[]);
        let hash = block.hash();
        f.chain.sealed.insert(
            1,
            SealedEntry {
                block,
                validated: Validated::default(),
            },
        );

        assert_eq!(
            f.chain.commit_block(2),
            Err(ChainError::OutOfOrderCommit {
                epoch: 2,
                expected: 1
            })
        );
        assert_eq!(f.chain.last_commit_epoch(), 0);

        assert_eq!(f.chain.commit_block(1), Ok(hash));
        assert_eq!(f.chain.last_commit_epoch(), 1);
        assert_eq!(f.chain.last_commit_hash(), hash);
        assert_eq!(
            f.chain.commit_block(1),
            Err(ChainError::OutOfOrderCommit {
                epoch: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn test_add_sealed_commits_contiguous_run() {
        let mut f = fixture();
        let third = build(&f.chain, &f.leader, 3, &[]);
        let second = build(&f.chain, &f.leader, 2, &[]);
        let first = build(&f.chain, &f.leader, 1, &[]);

        assert!(f.chain.add_sealed_block(third).unwrap().is_empty());
        assert!(f.chain.add_sealed_block(second).unwrap().is_empty());
        assert_eq!(f.chain.add_sealed_block(first).unwrap(), vec![1, 2, 3]);
        assert_eq!(f.chain.last_commit_epoch(), 3);
        assert!(f.chain.sealed_blocks().is_empty());
    }

    #[test]
    fn test_commit_credits_fees_to_proposer() {
        let mut f = fixture();
        let pay = Action::transfer(&f.alice, 1, f.bob.token(), 100, 5, "");
        let block = build(&f.chain, &f.leader, 1, &[pay]);
        f.chain.add_sealed_block(block).unwrap();

        let state = f.chain.commit_state();
        assert_eq!(state.balance(&f.alice.token()), 895);
        assert_eq!(state.balance(&f.bob.token()), 110);
        assert_eq!(state.balance(&f.leader.token()), 5);
        let committed = f.chain.committed_block(1).unwrap();
        assert_eq!(committed.commit.fees, 5);
        assert!(committed.commit.invalidated.is_empty());
    }

    #[test]
    fn test_commit_invalidates_double_spend_across_lagging_blocks() {
        let mut f = fixture();
        // Both blocks are built against genesis, so each sees Alice's full
        // balance; the second spend must be invalidated at commit.
        let spend_one = Action::transfer(&f.alice, 1, f.bob.token(), 900, 10, "one");
        let spend_two = Action::transfer(&f.alice, 1, f.bob.token(), 900, 20, "two");
        let first = build(&f.chain, &f.leader, 1, &[spend_one]);
        let second = build(&f.chain, &f.leader, 2, &[spend_two.clone()]);

        f.chain.add_sealed_block(first).unwrap();
        f.chain.add_sealed_block(second).unwrap();

        assert_eq!(f.chain.last_commit_epoch(), 2);
        let committed = f.chain.committed_block(2).unwrap();
        assert_eq!(committed.commit.invalidated, vec![spend_two.hash()]);
        assert_eq!(committed.commit.fees, 0);
        let state = f.chain.commit_state();
        assert_eq!(state.balance(&f.alice.token()), 90);
        assert_eq!(state.balance(&f.leader.token()), 10);
    }

    #[test]
    fn test_checkpoint_validator_matches_direct_validation() {
        let f = fixture();
        let actions = vec![
            Action::transfer(&f.alice, 1, f.bob.token(), 300, 3, "a"),
            Action::transfer(&f.bob, 1, f.alice.token(), 5, 1, "b"),
            Action::transfer(&f.alice, 1, f.bob.token(), 800, 3, "overdraft"),
        ];
        let header = f.chain.next_block(1).unwrap();
        let mut via_checkpoint = f.chain.checkpoint_validator(&header).unwrap();
        let mut direct = MutatingState::new(
            f.chain.commit_state(),
            Arc::default(),
            Mutations::new(),
            1,
        );
        for action in &actions {
            assert_eq!(via_checkpoint.validate(action), direct.validate(action));
        }
        assert_eq!(via_checkpoint.wallet(), direct.wallet());
    }

    #[test]
    fn test_checkpoint_validator_merges_sealed_blocks() {
        let mut f = fixture();
        let pay = Action::transfer(&f.alice, 2, f.bob.token(), 600, 0, "");
        let block = build(&f.chain, &f.leader, 2, &[pay]);
        f.chain.add_sealed_block(block).unwrap();

        let header = f.chain.next_block(3).unwrap();
        let validator = f.chain.checkpoint_validator(&header).unwrap();
        assert_eq!(validator.balance(&f.alice.token()), 400);
        assert_eq!(validator.balance(&f.bob.token()), 610);
    }

    #[test]
    fn test_checkpoint_validator_uses_checksum_for_lagging_checkpoint() {
        let mut f = fixture();
        let header_at_genesis = f.chain.next_block(3).unwrap();
        let pay = Action::transfer(&f.alice, 1, f.bob.token(), 100, 0, "");
        let block = build(&f.chain, &f.leader, 1, &[pay]);
        f.chain.add_sealed_block(block).unwrap();
        let block = build(&f.chain, &f.leader, 2, &[]);
        f.chain.add_sealed_block(block).unwrap();
        assert_eq!(f.chain.last_commit_epoch(), 2);

        // Checkpoint 0 predates the commit: replay from the genesis checksum.
        let validator = f.chain.checkpoint_validator(&header_at_genesis).unwrap();
        assert_eq!(validator.balance(&f.alice.token()), 900);
    }

    #[test]
    fn test_rollover_only_drops_sealed_blocks() {
        let mut f = fixture();
        let block = build(&f.chain, &f.leader, 1, &[]);
        f.chain.add_sealed_block(block).unwrap();
        for epoch in [3, 4] {
            let block = build(&f.chain, &f.leader, epoch, &[]);
            f.chain.add_sealed_block(block).unwrap();
        }
        assert_eq!(
            f.chain.rollover(0),
            Err(ChainError::RolloverBeforeCommit {
                epoch: 0,
                last_commit: 1
            })
        );
        f.chain.rollover(3).unwrap();
        assert!(f.chain.is_sealed(3));
        assert!(!f.chain.is_sealed(4));
        assert_eq!(f.chain.last_commit_epoch(), 1);
    }

    #[test]
    fn test_sealed_blocks_beyond_horizon_are_refused() {
        let f = fixture();
        let far = build(&f.chain, &f.leader, 5, &[]);
        let near = build(&f.chain, &f.leader, 4, &[]);
        let mut bounded = fixture().chain.with_max_sealed_ahead(4);
        assert_eq!(
            bounded.add_sealed_block(far.clone()),
            Err(ChainError::TooFarAhead { epoch: 5, limit: 4 })
        );
        assert!(matches!(
            bounded.checkpoint_validator(&far.header),
            Err(ChainError::TooFarAhead { .. })
        ));
        assert_eq!(bounded.add_sealed_block(near), Ok(Vec::new()));
        assert!(!bounded.is_sealed(5));
    }

    #[test]
    fn test_recovery_rebuilds_from_checksum() {
        let mut f = fixture();
        for epoch in 1..=3 {
            let pay = Action::transfer(&f.alice, epoch, f.bob.token(), 10, 0, "");
            let block = build(&f.chain, &f.leader, epoch, &[pay]);
            f.chain.add_sealed_block(block).unwrap();
        }
        let hash_two = f.chain.committed_block(2).unwrap().hash();
        assert_eq!(f.chain.commit_state().balance(&f.alice.token()), 970);

        f.chain.recovery(2).unwrap();
        assert_eq!(f.chain.last_commit_epoch(), 2);
        assert_eq!(f.chain.last_commit_hash(), hash_two);
        assert_eq!(f.chain.commit_state().balance(&f.alice.token()), 980);
        assert!(f.chain.committed_block(3).is_none());

        assert_eq!(
            f.chain.recovery(5),
            Err(ChainError::RecoveryOutOfRange {
                epoch: 5,
                from: 0,
                to: 2
            })
        );
    }

    #[tokio::test]
    async fn test_checksum_clone_is_isolated_from_later_commits() {
        let f = fixture();
        let leader = f.leader.clone();
        let alice = f.alice.clone();
        let bob = f.bob.token();
        let chain = Arc::new(parking_lot::Mutex::new(f.chain));

        let block = build(&chain.lock(), &leader, 1, &[]);
        chain.lock().add_sealed_block(block).unwrap();

        let job = chain.lock().begin_checksum(1).unwrap();
        assert_eq!(
            chain.lock().begin_checksum(1).map(|job| job.epoch),
            Err(ChainError::ChecksumInFlight { epoch: 1 })
        );
        // A commit while the clone is in flight must not leak into it.
        let pay = Action::transfer(&alice, 2, bob, 500, 0, "");
        let block = build(&chain.lock(), &leader, 2, &[pay]);
        chain.lock().add_sealed_block(block).unwrap();
        assert_eq!(job.base.balance(&alice.token()), 1_000);

        let checksum = job.compute();
        chain.lock().finish_checksum(checksum.clone()).unwrap();
        assert_eq!(chain.lock().checksum().epoch, 1);

        let installed = clone_checksum(chain.clone(), 2).await.unwrap();
        assert_eq!(installed.epoch, 2);
        assert_eq!(installed.state.balance(&alice.token()), 500);
    }

    #[test]
    fn test_committed_after_reports_retention() {
        let mut f = fixture();
        f.chain = f.chain.with_recent_blocks(2);
        for epoch in 1..=5 {
            let block = build(&f.chain, &f.leader, epoch, &[]);
            f.chain.add_sealed_block(block).unwrap();
        }
        // Checksum still at genesis keeps everything.
        assert_eq!(f.chain.committed_after(0).map(|b| b.len()), Some(5));

        let job = f.chain.begin_checksum(5).unwrap();
        f.chain.finish_checksum(job.compute()).unwrap();
        assert!(f.chain.committed_after(0).is_none());
        assert_eq!(f.chain.committed_after(3).map(|b| b.len()), Some(2));
        assert_eq!(f.chain.committed_after(5).map(|b| b.len()), Some(0));
    }

    #[test]
    fn test_checksum_behind_commit_replays_retained_blocks() {
        let mut f = fixture();
        let pay = Action::transfer(&f.alice, 1, f.bob.token(), 100, 1, "");
        let block = build(&f.chain, &f.leader, 1, &[pay]);
        f.chain.add_sealed_block(block).unwrap();
        let at_one = Checksum::compute(1, f.chain.commit_state(), f.chain.last_commit_hash());

        let pay = Action::transfer(&f.alice, 2, f.bob.token(), 200, 0, "");
        let block = build(&f.chain, &f.leader, 2, &[pay]);
        f.chain.add_sealed_block(block).unwrap();

        assert_eq!(
            f.chain.begin_checksum(3).map(|job| job.epoch),
            Err(ChainError::ChecksumOutOfRange { epoch: 3, from: 0, to: 2 })
        );
        let job = f.chain.begin_checksum(1).unwrap();
        assert_eq!(job.compute(), at_one);
    }
}
