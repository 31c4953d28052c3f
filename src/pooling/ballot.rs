use crate::crypto::{Hash, Token};
use crate::pooling::messages::{RoundCommit, RoundPropose, RoundVote};
use crate::types::{Round, Weight};
use crate::wire::{Reader, WireError, Writer};
use std::collections::HashMap;

/// `weight` is strictly more than two thirds of `total`.
pub fn exceeds_two_thirds(weight: Weight, total: Weight) -> bool {
    weight as u128 * 3 > total as u128 * 2
}

/// Vote and commit tally for one round of one epoch.
///
/// Entries keep insertion order. A signer that sends two conflicting votes
/// (or commits) has both entries zeroed, and any further message from it in
/// this round is ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ballot {
    round: Round,
    total_weight: Weight,
    proposal: Option<RoundPropose>,
    votes: Vec<RoundVote>,
    commits: Vec<RoundCommit>,
}

trait Entry: Clone {
    fn token(&self) -> Token;
    fn weight_mut(&mut self) -> &mut Weight;
    fn conflicts(&self, other: &Self) -> bool;
}

impl Entry for RoundVote {
    fn token(&self) -> Token {
        self.token
    }
    fn weight_mut(&mut self) -> &mut Weight {
        &mut self.weight
    }
    fn conflicts(&self, other: &Self) -> bool {
        self.conflicts_with(other)
    }
}

impl Entry for RoundCommit {
    fn token(&self) -> Token {
        self.token
    }
    fn weight_mut(&mut self) -> &mut Weight {
        &mut self.weight
    }
    fn conflicts(&self, other: &Self) -> bool {
        self.conflicts_with(other)
    }
}

/// Appends `entry` unless its signer already has one. Returns the earlier
/// entry on conflict, and the weight that was accepted.
fn incorporate<T: Entry>(entries: &mut Vec<T>, mut entry: T) -> (Option<T>, Weight) {
    let token = entry.token();
    let mut previous = entries.iter_mut().filter(|e| e.token() == token);
    let Some(first) = previous.next() else {
        let weight = *entry.weight_mut();
        entries.push(entry);
        return (None, weight);
    };
    if previous.next().is_some() || !first.conflicts(&entry) {
        // Already an equivocator, or a harmless repeat.
        return (None, 0);
    }
    *first.weight_mut() = 0;
    let conflict = first.clone();
    *entry.weight_mut() = 0;
    entries.push(entry);
    (Some(conflict), 0)
}

impl Ballot {
    pub fn new(round: Round, total_weight: Weight) -> Self {
        Self {
            round,
            total_weight,
            proposal: None,
            votes: Vec::new(),
            commits: Vec::new(),
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn total_weight(&self) -> Weight {
        self.total_weight
    }

    pub fn proposal(&self) -> Option<&RoundPropose> {
        self.proposal.as_ref()
    }

    /// Records the round's proposal. Returns the earlier proposal if a
    /// different one was already recorded; the first one is kept.
    pub fn set_proposal(&mut self, proposal: RoundPropose) -> Option<RoundPropose> {
        match &self.proposal {
            None => {
                self.proposal = Some(proposal);
                None
            }
            Some(existing) if *existing == proposal => None,
            Some(existing) => Some(existing.clone()),
        }
    }

    pub fn votes(&self) -> &[RoundVote] {
        &self.votes
    }

    pub fn commits(&self) -> &[RoundCommit] {
        &self.commits
    }

    pub fn incorporate_vote(&mut self, vote: RoundVote) -> (Option<RoundVote>, Weight) {
        incorporate(&mut self.votes, vote)
    }

    pub fn incorporate_commit(&mut self, commit: RoundCommit) -> (Option<RoundCommit>, Weight) {
        incorporate(&mut self.commits, commit)
    }

    pub fn has_vote_from(&self, token: &Token) -> bool {
        self.votes.iter().any(|v| v.token == *token)
    }

    pub fn has_commit_from(&self, token: &Token) -> bool {
        self.commits.iter().any(|c| c.token == *token)
    }

    fn value_vote_weight(&self, value: &Hash) -> Weight {
        self.votes
            .iter()
            .filter(|v| !v.blank && v.value == *value)
            .map(|v| v.weight)
            .sum()
    }

    pub fn has_majority_for_value(&self, value: &Hash) -> bool {
        exceeds_two_thirds(self.value_vote_weight(value), self.total_weight)
    }

    /// Non-blank value backed by more than two thirds of the vote weight.
    pub fn consensus(&self) -> Option<Hash> {
        let mut tally: HashMap<Hash, Weight> = HashMap::new();
        for vote in self.votes.iter().filter(|v| !v.blank) {
            let weight = tally.entry(vote.value).or_insert(0);
            *weight += vote.weight;
            if exceeds_two_thirds(*weight, self.total_weight) {
                return Some(vote.value);
            }
        }
        None
    }

    pub fn has_consensus(&self) -> bool {
        self.consensus().is_some()
    }

    pub fn has_blank_consensus(&self) -> bool {
        let blank: Weight = self.votes.iter().filter(|v| v.blank).map(|v| v.weight).sum();
        exceeds_two_thirds(blank, self.total_weight)
    }

    pub fn has_blank_commit_consensus(&self) -> bool {
        let blank: Weight = self.commits.iter().filter(|c| c.blank).map(|c| c.weight).sum();
        exceeds_two_thirds(blank, self.total_weight)
    }

    /// At least `2f + 1` vote weight, whatever the values.
    pub fn has_quorum(&self, f: Weight) -> bool {
        self.votes.iter().map(|v| v.weight).sum::<Weight>() > 2 * f
    }

    /// At least `2f + 1` commit weight, whatever the values.
    pub fn has_commit_quorum(&self, f: Weight) -> bool {
        self.commits.iter().map(|c| c.weight).sum::<Weight>() > 2 * f
    }

    /// Weight of distinct signers with any vote or commit in this round.
    pub fn activity_weight(&self) -> Weight {
        let mut seen: HashMap<Token, Weight> = HashMap::new();
        for (token, weight) in self
            .votes
            .iter()
            .map(|v| (v.token, v.weight))
            .chain(self.commits.iter().map(|c| (c.token, c.weight)))
        {
            let entry = seen.entry(token).or_insert(weight);
            *entry = (*entry).min(weight);
        }
        seen.values().sum()
    }

    /// First non-blank value whose commit weight, accumulated in insertion
    /// order, exceeds two thirds of the total.
    pub fn finalized(&self) -> Option<Hash> {
        let mut tally: HashMap<Hash, Weight> = HashMap::new();
        for commit in self.commits.iter().filter(|c| !c.blank) {
            let weight = tally.entry(commit.value).or_insert(0);
            *weight += commit.weight;
            if exceeds_two_thirds(*weight, self.total_weight) {
                return Some(commit.value);
            }
        }
        None
    }

    /// Signers whose vote for `value` reported holding its block.
    pub fn data_holders(&self, value: &Hash) -> Vec<Token> {
        self.votes
            .iter()
            .filter(|v| !v.blank && v.has_data && v.value == *value)
            .map(|v| v.token)
            .collect()
    }

    /// Fails if a stored message exceeds its short length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = Writer::new();
        writer.put_u32(self.round);
        writer.put_u64(self.total_weight);
        writer.put_bool(self.proposal.is_some());
        if let Some(proposal) = &self.proposal {
            writer.put_short_byte_array(&proposal.serialize())?;
        }
        writer.put_u32(self.votes.len() as u32);
        for vote in &self.votes {
            writer.put_short_byte_array(&vote.serialize())?;
            writer.put_u64(vote.weight);
        }
        writer.put_u32(self.commits.len() as u32);
        for commit in &self.commits {
            writer.put_short_byte_array(&commit.serialize())?;
            writer.put_u64(commit.weight);
        }
        Ok(writer.into_bytes())
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let round = reader.read_u32()?;
        let total_weight = reader.read_u64()?;
        let proposal = if reader.read_bool()? {
            Some(RoundPropose::parse(reader.read_short_byte_array()?)?)
        } else {
            None
        };
        let count = reader.read_u32()? as usize;
        let mut votes = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            let mut vote = RoundVote::parse(reader.read_short_byte_array()?)?;
            vote.weight = reader.read_u64()?;
            votes.push(vote);
        }
        let count = reader.read_u32()? as usize;
        let mut commits = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            let mut commit = RoundCommit::parse(reader.read_short_byte_array()?)?;
            commit.weight = reader.read_u64()?;
            commits.push(commit);
        }
        reader.finish()?;
        Ok(Self {
            round,
            total_weight,
            proposal,
            votes,
            commits,
        })
    }
}
