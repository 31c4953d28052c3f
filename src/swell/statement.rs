//! Two-phase disclosure of checksum hashes.
//!
//! A node first publishes a dressed statement, `hash(token ++ checksum)`,
//! which commits to its checksum without revealing it, and later the naked
//! checksum itself. A naked statement counts only when it matches the same
//! node's dressed one, so nobody can copy a hash revealed by others.

use crate::crypto::{Hash, Token};
use crate::pooling::ballot::exceeds_two_thirds;
use crate::swell::messages::{dress, ChecksumStatement};
use crate::types::{Epoch, Weight};
use std::collections::HashMap;
use tracing::debug;

pub struct StatementTally {
    window: Epoch,
    weights: HashMap<Token, Weight>,
    total_weight: Weight,
    dressed: HashMap<Token, Hash>,
    naked: HashMap<Token, Hash>,
}

impl StatementTally {
    pub fn new(window: Epoch, weights: HashMap<Token, Weight>) -> Self {
        let total_weight = weights.values().sum();
        Self {
            window,
            weights,
            total_weight,
            dressed: HashMap::new(),
            naked: HashMap::new(),
        }
    }

    /// Records a dressed statement. The first one per member wins.
    pub fn add_dressed(&mut self, statement: &ChecksumStatement) -> bool {
        if !self.admits(statement) || self.dressed.contains_key(&statement.token) {
            return false;
        }
        self.dressed.insert(statement.token, statement.hash);
        true
    }

    /// Records a naked statement if it opens the member's dressed one.
    pub fn add_naked(&mut self, statement: &ChecksumStatement) -> bool {
        if !self.admits(statement) || self.naked.contains_key(&statement.token) {
            return false;
        }
        match self.dressed.get(&statement.token) {
            Some(dressed) if *dressed == dress(&statement.token, &statement.hash) => {
                self.naked.insert(statement.token, statement.hash);
                true
            }
            _ => {
                debug!(window = self.window, from = %statement.token, "Naked statement without matching dressed one");
                false
            }
        }
    }

    fn admits(&self, statement: &ChecksumStatement) -> bool {
        statement.window == self.window && self.weights.contains_key(&statement.token)
    }

    /// Checksum hash revealed by more than two thirds of the committee weight.
    pub fn consensus(&self) -> Option<Hash> {
        let mut totals: HashMap<Hash, Weight> = HashMap::new();
        for (token, hash) in &self.naked {
            let weight = self.weights.get(token).copied().unwrap_or(0);
            *totals.entry(*hash).or_insert(0) += weight;
        }
        totals
            .into_iter()
            .find(|(_, weight)| exceeds_two_thirds(*weight, self.total_weight))
            .map(|(hash, _)| hash)
    }

    pub fn revealed(&self) -> usize {
        self.naked.len()
    }
}
