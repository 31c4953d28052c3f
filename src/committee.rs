use crate::crypto::{Hash, Token};
use crate::types::{Epoch, Round, Validator, Weight};
use std::collections::HashMap;

/// Weighted validator set for one checksum window.
///
/// The leader rotation is a seeded circular order in which a validator of
/// weight `w` appears `w` times, so leadership frequency is proportional to
/// weight without per-round recomputation.
#[derive(Clone, Debug)]
pub struct Committee {
    validators: Vec<Validator>,
    validator_map: HashMap<Token, usize>,
    order: Vec<Token>,
    seed: Hash,
}

/// Active sub-pool of a committee for a single epoch.
#[derive(Clone, Debug)]
pub struct Pool {
    epoch: Epoch,
    order: Vec<Token>,
    weights: HashMap<Token, Weight>,
    total_weight: Weight,
}

impl Committee {
    pub fn new(validators: Vec<Validator>, seed: Hash) -> Self {
        let validators: Vec<Validator> = validators.into_iter().filter(|v| v.weight > 0).collect();
        let validator_map = validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.token, i))
            .collect();
        let order = Self::derive_order(&validators, &seed);
        Self {
            validators,
            validator_map,
            order,
            seed,
        }
    }

    fn derive_order(validators: &[Validator], seed: &Hash) -> Vec<Token> {
        let mut keyed: Vec<(Hash, Token)> = Vec::new();
        for validator in validators {
            for replica in 0..validator.weight {
                let key = Hash::of_parts(&[&replica.to_le_bytes(), &seed.0, &validator.token.0]);
                keyed.push((key, validator.token));
            }
        }
        keyed.sort();
        keyed.into_iter().map(|(_, token)| token).collect()
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, token: &Token) -> Option<&Validator> {
        self.validator_map.get(token).map(|&i| &self.validators[i])
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.validator_map.contains_key(token)
    }

    pub fn weight(&self, token: &Token) -> Weight {
        self.get(token).map(|v| v.weight).unwrap_or(0)
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn order(&self) -> &[Token] {
        &self.order
    }

    pub fn seed(&self) -> Hash {
        self.seed
    }

    pub fn total_weight(&self) -> Weight {
        self.validators.iter().map(|v| v.weight).sum()
    }

    /// Smallest weight strictly above two thirds of the total.
    pub fn quorum_threshold(&self) -> Weight {
        2 * self.total_weight() / 3 + 1
    }

    pub fn fault_tolerance(&self) -> Weight {
        self.total_weight().saturating_sub(1) / 3
    }

    /// Block proposer for `epoch` (round 0 leader of the epoch's pool).
    pub fn elect_leader(&self, epoch: Epoch) -> Option<Token> {
        if self.order.is_empty() {
            return None;
        }
        let index = (epoch % self.order.len() as u64) as usize;
        Some(self.order[index])
    }

    /// Sub-pool for `epoch`: the epoch leader and the next `max_pool_size - 1`
    /// entries of the circular order. Tokens appearing more than once have
    /// their weight merged.
    pub fn pool(&self, epoch: Epoch, max_pool_size: usize) -> Pool {
        let len = self.order.len();
        let size = max_pool_size.min(len);
        let start = if len == 0 {
            0
        } else {
            (epoch % len as u64) as usize
        };
        let order: Vec<Token> = (0..size).map(|i| self.order[(start + i) % len]).collect();
        let mut weights: HashMap<Token, Weight> = HashMap::new();
        for token in &order {
            *weights.entry(*token).or_insert(0) += 1;
        }
        Pool {
            epoch,
            total_weight: order.len() as Weight,
            order,
            weights,
        }
    }
}

impl Pool {
    /// Pool with explicit per-token weights, ordered as given.
    pub fn from_weights(epoch: Epoch, members: &[(Token, Weight)]) -> Self {
        let order: Vec<Token> = members.iter().map(|(t, _)| *t).collect();
        let mut weights = HashMap::new();
        for (token, weight) in members {
            *weights.entry(*token).or_insert(0) += *weight;
        }
        let total_weight = weights.values().sum();
        Self {
            epoch,
            order,
            weights,
            total_weight,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn leader(&self, round: Round) -> Option<Token> {
        if self.order.is_empty() {
            return None;
        }
        Some(self.order[round as usize % self.order.len()])
    }

    pub fn weight(&self, token: &Token) -> Weight {
        self.weights.get(token).copied().unwrap_or(0)
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.weights.contains_key(token)
    }

    pub fn total_weight(&self) -> Weight {
        self.total_weight
    }

    /// Default fault tolerance for the pool's weight.
    pub fn fault_tolerance(&self) -> Weight {
        self.total_weight.saturating_sub(1) / 3
    }

    pub fn order(&self) -> &[Token] {
        &self.order
    }

    /// Distinct members in first-appearance order.
    pub fn members(&self) -> Vec<Token> {
        let mut seen = std::collections::HashSet::new();
        self.order
            .iter()
            .filter(|t| seen.insert(**t))
            .copied()
            .collect()
    }
}
