use crate::chain::action::{Action, Entry, ACTION_VALIDITY};
use crate::crypto::{Hash, Token};
use crate::pooling::{Candidate, Duplicate};
use crate::types::{CandidateInfo, Epoch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Committed ledger state: balances, committee applications per window and
/// equivocation records. Every entry kind is validated against it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    balances: BTreeMap<Token, u64>,
    /// Window start -> applicant -> announced address.
    candidates: BTreeMap<Epoch, BTreeMap<Token, String>>,
    /// Committed equivocations per validator, never retired.
    offenses: BTreeMap<Token, u64>,
    /// (offender, epoch) of evidence still inside its validity span.
    evidence: BTreeSet<(Token, Epoch)>,
}

impl Wallet {
    pub fn new(balances: impl IntoIterator<Item = (Token, u64)>) -> Self {
        Self {
            balances: balances.into_iter().filter(|(_, b)| *b > 0).collect(),
            ..Self::default()
        }
    }

    pub fn balance(&self, token: &Token) -> u64 {
        self.balances.get(token).copied().unwrap_or(0)
    }

    pub fn credit(&mut self, token: Token, amount: u64) {
        if amount > 0 {
            let entry = self.balances.entry(token).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }

    pub fn apply(&mut self, mutations: &Mutations) {
        for (token, delta) in &mutations.deltas {
            let updated = (self.balance(token) as i128 + delta).clamp(0, u64::MAX as i128) as u64;
            if updated == 0 {
                self.balances.remove(token);
            } else {
                self.balances.insert(*token, updated);
            }
        }
        for ((window, token), address) in &mutations.candidacies {
            self.candidates
                .entry(*window)
                .or_default()
                .entry(*token)
                .or_insert_with(|| address.clone());
        }
        for key in &mutations.evidence {
            if self.evidence.insert(*key) {
                *self.offenses.entry(key.0).or_insert(0) += 1;
            }
        }
    }

    /// Drops applications for windows that have started and evidence keys
    /// that can no longer be included at `epoch`.
    pub fn retire(&mut self, epoch: Epoch) {
        self.candidates = self.candidates.split_off(&epoch.saturating_add(1));
        self.evidence
            .retain(|(_, at)| at.saturating_add(ACTION_VALIDITY) > epoch);
    }

    /// Whether `retire(epoch)` would drop anything.
    pub fn stale_at(&self, epoch: Epoch) -> bool {
        self.candidates.keys().next().is_some_and(|window| *window <= epoch)
            || self
                .evidence
                .iter()
                .any(|(_, at)| at.saturating_add(ACTION_VALIDITY) <= epoch)
    }

    /// Applicants for the window starting at `window`, ordered by token.
    pub fn candidates(&self, window: Epoch) -> Vec<CandidateInfo> {
        self.candidates
            .get(&window)
            .map(|applicants| {
                applicants
                    .iter()
                    .map(|(token, address)| CandidateInfo {
                        token: *token,
                        address: address.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_candidate(&self, window: Epoch, token: &Token) -> bool {
        self.candidates
            .get(&window)
            .is_some_and(|applicants| applicants.contains_key(token))
    }

    /// Committed equivocations by `token`.
    pub fn offenses(&self, token: &Token) -> u64 {
        self.offenses.get(token).copied().unwrap_or(0)
    }

    pub fn has_evidence(&self, offender: &Token, epoch: Epoch) -> bool {
        self.evidence.contains(&(*offender, epoch))
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Token, &u64)> {
        self.balances.iter()
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    pub fn total(&self) -> u128 {
        self.balances.values().map(|b| *b as u128).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }

    /// Digest of the canonical (sorted) serialization.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.to_bytes())
    }
}

/// Net changes produced by validating a sequence of entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mutations {
    deltas: BTreeMap<Token, i128>,
    actions: HashSet<Hash>,
    candidacies: BTreeMap<(Epoch, Token), String>,
    evidence: BTreeSet<(Token, Epoch)>,
}

impl Mutations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta(&self, token: &Token) -> i128 {
        self.deltas.get(token).copied().unwrap_or(0)
    }

    fn add(&mut self, token: Token, amount: i128) {
        let entry = self.deltas.entry(token).or_insert(0);
        *entry += amount;
        if *entry == 0 {
            self.deltas.remove(&token);
        }
    }

    /// Fee is burned here; the commit credits collected fees to the proposer.
    fn transfer(&mut self, action: &Action, hash: Hash) {
        self.add(action.from, -((action.value + action.fee) as i128));
        self.add(action.to, action.value as i128);
        self.actions.insert(hash);
    }

    pub fn credit(&mut self, token: Token, amount: u64) {
        self.add(token, amount as i128);
    }

    pub fn merge(&mut self, other: &Mutations) {
        for (token, delta) in &other.deltas {
            self.add(*token, *delta);
        }
        self.actions.extend(other.actions.iter().copied());
        for (key, address) in &other.candidacies {
            self.candidacies.entry(*key).or_insert_with(|| address.clone());
        }
        self.evidence.extend(other.evidence.iter().copied());
    }

    pub fn contains_action(&self, hash: &Hash) -> bool {
        self.actions.contains(hash)
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
            && self.actions.is_empty()
            && self.candidacies.is_empty()
            && self.evidence.is_empty()
    }
}

/// Action hashes already committed, with the epoch of the including block.
pub type KnownActions = HashMap<Hash, Epoch>;

/// Validation context: a base wallet plus pending mutations.
///
/// The base is shared copy-on-write with the chain, so building a validator
/// never clones the wallet.
#[derive(Clone, Debug)]
pub struct MutatingState {
    base: Arc<Wallet>,
    known: Arc<KnownActions>,
    mutations: Mutations,
    epoch: Epoch,
}

impl MutatingState {
    pub fn new(base: Arc<Wallet>, known: Arc<KnownActions>, mutations: Mutations, epoch: Epoch) -> Self {
        Self {
            base,
            known,
            mutations,
            epoch,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn balance(&self, token: &Token) -> u64 {
        (self.base.balance(token) as i128 + self.mutations.delta(token)).clamp(0, u64::MAX as i128)
            as u64
    }

    /// Validates `action` and records its effect when valid.
    pub fn validate(&mut self, action: &Action) -> bool {
        self.validate_hashed(action, action.hash())
    }

    pub fn validate_hashed(&mut self, action: &Action, hash: Hash) -> bool {
        if !action.valid_at(self.epoch) {
            return false;
        }
        if self.mutations.contains_action(&hash) || self.known.contains_key(&hash) {
            return false;
        }
        let Some(total) = action.value.checked_add(action.fee) else {
            return false;
        };
        if self.balance(&action.from) < total {
            return false;
        }
        self.mutations.transfer(action, hash);
        true
    }

    /// Validates any block entry and records its effect when valid.
    pub fn validate_entry(&mut self, entry: &Entry, hash: Hash) -> bool {
        match entry {
            Entry::Transfer(action) => self.validate_hashed(action, hash),
            Entry::Candidacy(candidate) => self.validate_candidacy(entry, candidate, hash),
            Entry::Evidence(duplicate) => self.validate_evidence(entry, duplicate, hash),
        }
    }

    fn validate_candidacy(&mut self, entry: &Entry, candidate: &Candidate, hash: Hash) -> bool {
        if !entry.valid_at(self.epoch) {
            return false;
        }
        let key = (candidate.epoch, candidate.token);
        if self.base.has_candidate(candidate.epoch, &candidate.token)
            || self.mutations.candidacies.contains_key(&key)
        {
            return false;
        }
        self.mutations.candidacies.insert(key, candidate.address.clone());
        self.mutations.actions.insert(hash);
        true
    }

    fn validate_evidence(&mut self, entry: &Entry, duplicate: &Duplicate, hash: Hash) -> bool {
        if !entry.valid_at(self.epoch) {
            return false;
        }
        let key = (duplicate.offender(), duplicate.epoch());
        if self.base.has_evidence(&key.0, key.1) || self.mutations.evidence.contains(&key) {
            return false;
        }
        self.mutations.evidence.insert(key);
        self.mutations.actions.insert(hash);
        true
    }

    pub fn mutations(&self) -> &Mutations {
        &self.mutations
    }

    pub fn into_mutations(self) -> Mutations {
        self.mutations
    }

    /// Balances after applying the pending mutations.
    pub fn wallet(&self) -> Wallet {
        let mut wallet = (*self.base).clone();
        wallet.apply(&self.mutations);
        wallet
    }
}
