use parking_lot::Mutex;
use std::sync::Arc;
use swell::chain::{clone_checksum, Action, BlockBuilder, Chain, Checksum, SealedBlock, Wallet};
use swell::crypto::{Hash, KeyPair};
use swell::permission::{Permission, Permissionless};
use swell::pooling::{Candidate, Duplicate, RoundMessage, RoundVote};
use swell::types::Epoch;
use swell::wire::{Reader, Writer};

struct Ledger {
    network: Hash,
    proposers: Vec<KeyPair>,
    alice: KeyPair,
    bob: KeyPair,
    wallet: Wallet,
}

impl Ledger {
    fn new() -> Self {
        let alice = KeyPair::from_seed(&[10; 32]);
        let bob = KeyPair::from_seed(&[11; 32]);
        Self {
            network: Hash::of(b"ledger-net"),
            proposers: (0..3).map(|i| KeyPair::from_seed(&[20 + i; 32])).collect(),
            wallet: Wallet::new(vec![(alice.token(), 10_000), (bob.token(), 500)]),
            alice,
            bob,
        }
    }

    fn replica(&self, seed: u8) -> Chain {
        Chain::genesis(self.network, self.wallet.clone(), KeyPair::from_seed(&[seed; 32]))
    }

    fn block(&self, chain: &Chain, epoch: Epoch, actions: &[Action]) -> SealedBlock {
        let entries: Vec<Vec<u8>> = actions.iter().map(Action::serialize).collect();
        self.block_with(chain, epoch, &entries)
    }

    fn block_with(&self, chain: &Chain, epoch: Epoch, entries: &[Vec<u8>]) -> SealedBlock {
        let proposer = &self.proposers[epoch as usize % self.proposers.len()];
        let mut header = chain.next_block(epoch).unwrap();
        header.proposer = proposer.token();
        let mut builder = BlockBuilder::new(header.clone(), chain.checkpoint_validator(&header).unwrap());
        for entry in entries {
            builder.push(entry);
        }
        builder.seal(proposer).0
    }

    fn payment(&self, epoch: Epoch, value: u64, fee: u64) -> Action {
        Action::transfer(&self.alice, epoch, self.bob.token(), value, fee, &format!("pay {epoch}"))
    }
}

#[test]
fn test_replicas_converge_regardless_of_arrival_order() {
    let ledger = Ledger::new();
    let mut source = ledger.replica(1);
    let mut blocks = Vec::new();
    for epoch in 1..=5 {
        let block = ledger.block(&source, epoch, &[ledger.payment(epoch, 100 * epoch, epoch)]);
        blocks.push(block.clone());
        source.add_sealed_block(block).unwrap();
    }

    let mut reversed = ledger.replica(2);
    for block in blocks.iter().rev() {
        reversed.add_sealed_block(block.clone()).unwrap();
    }
    let mut forward = ledger.replica(3);
    for block in &blocks {
        forward.add_sealed_block(block.clone()).unwrap();
    }

    for replica in [&reversed, &forward] {
        assert_eq!(replica.last_commit_epoch(), 5);
        assert_eq!(replica.last_commit_hash(), source.last_commit_hash());
        assert_eq!(replica.commit_state(), source.commit_state());
        for epoch in 1..=5 {
            let local = replica.committed_block(epoch).unwrap();
            let remote = source.committed_block(epoch).unwrap();
            assert_eq!(local.commit.fees, remote.commit.fees);
            assert_eq!(local.commit.invalidated, remote.commit.invalidated);
            assert_ne!(local.commit.publisher, remote.commit.publisher);
            assert!(local.verify());
        }
    }

    let state = source.commit_state();
    let paid: u64 = (1..=5).map(|e| 100 * e).sum();
    let fees: u64 = (1..=5).sum();
    assert_eq!(state.balance(&ledger.bob.token()), 500 + paid);
    assert_eq!(state.balance(&ledger.alice.token()), 10_000 - paid - fees);
    assert_eq!(state.total(), ledger.wallet.total());
}

#[test]
fn test_replayed_action_is_invalidated_and_fee_withheld() {
    let ledger = Ledger::new();
    let mut chain = ledger.replica(1);
    let payment = ledger.payment(1, 50, 7);
    // Both blocks are built before either commits, so neither sees the other.
    let first = ledger.block(&chain, 1, &[payment.clone()]);
    let second = ledger.block(&chain, 2, &[payment.clone()]);
    chain.add_sealed_block(second).unwrap();
    assert_eq!(chain.add_sealed_block(first).unwrap(), vec![1, 2]);

    let committed = chain.committed_block(2).unwrap();
    assert_eq!(committed.commit.invalidated, vec![payment.hash()]);
    assert_eq!(committed.commit.fees, 0);
    assert_eq!(chain.commit_state().balance(&ledger.bob.token()), 550);
}

#[tokio::test]
async fn test_snapshot_bootstraps_new_replica() {
    let ledger = Ledger::new();
    let source = Arc::new(Mutex::new(ledger.replica(1)));
    for epoch in 1..=6 {
        let mut chain = source.lock();
        let block = ledger.block(&chain, epoch, &[ledger.payment(epoch, 10, 1)]);
        chain.add_sealed_block(block).unwrap();
    }
    let checksum = clone_checksum(source.clone(), 4).await.unwrap();
    assert_eq!(source.lock().checksum().epoch, 4);

    let mut writer = Writer::new();
    checksum.write(&mut writer);
    let bytes = writer.into_bytes();
    let mut reader = Reader::new(&bytes);
    let received = Checksum::read(&mut reader).unwrap();
    assert_eq!(received.hash, checksum.hash);

    let mut replica = Chain::from_checksum(ledger.network, received, KeyPair::from_seed(&[9; 32]));
    assert_eq!(replica.last_commit_epoch(), 4);
    for block in source.lock().committed_after(4).unwrap() {
        replica.add_sealed_block(block.sealed).unwrap();
    }
    let source = source.lock();
    assert_eq!(replica.last_commit_epoch(), 6);
    assert_eq!(replica.last_commit_hash(), source.last_commit_hash());
    assert_eq!(replica.commit_state(), source.commit_state());
}

#[tokio::test]
async fn test_committee_follows_committed_entries_not_local_views() {
    let ledger = Ledger::new();
    let validators: Vec<KeyPair> = (0..4).map(|i| KeyPair::from_seed(&[30 + i; 32])).collect();
    let offender = &validators[3];
    let window = 11;
    let candidacies: Vec<Vec<u8>> = validators
        .iter()
        .enumerate()
        .map(|(i, key)| Candidate::new(key, window, &format!("validator-{i}")).serialize())
        .collect();
    let evidence = Duplicate {
        one: RoundMessage::Vote(RoundVote::new(offender, 1, 0, false, Hash::of(b"left"), false)),
        two: RoundMessage::Vote(RoundVote::new(offender, 1, 0, false, Hash::of(b"right"), false)),
    }
    .serialize();

    // The first leader heard three applicants, the second heard a repeat, the
    // last applicant and the equivocation. The replica heard none of them.
    let source = Arc::new(Mutex::new(ledger.replica(1)));
    let mut blocks = Vec::new();
    {
        let mut chain = source.lock();
        let first = ledger.block_with(&chain, 1, &candidacies[..3]);
        chain.add_sealed_block(first.clone()).unwrap();
        let second_entries = vec![candidacies[0].clone(), candidacies[3].clone(), evidence];
        let second = ledger.block_with(&chain, 2, &second_entries);
        assert_eq!(second.actions.len(), 2);
        chain.add_sealed_block(second.clone()).unwrap();
        blocks.extend([first, second]);
    }
    let replica = Arc::new(Mutex::new(ledger.replica(2)));
    for block in blocks.into_iter().rev() {
        replica.lock().add_sealed_block(block).unwrap();
    }

    let ours = clone_checksum(source, 2).await.unwrap();
    let theirs = clone_checksum(replica, 2).await.unwrap();
    assert_eq!(ours.hash, theirs.hash);
    assert_eq!(ours.state.offenses(&offender.token()), 1);

    let policy = Permissionless::new();
    let committee = |checksum: &Checksum| policy.validators(&checksum.state.candidates(window), &checksum.state);
    let formed = committee(&ours);
    assert_eq!(formed, committee(&theirs));
    assert_eq!(formed.len(), 3);
    assert!(formed.iter().all(|v| v.token != offender.token()));
}
