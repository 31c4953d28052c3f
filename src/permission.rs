//! Committee admission and punishment policies.
//!
//! Policies are pure functions of a committed state snapshot: applications
//! and equivocations reach them only through the ledger, so every node that
//! agrees on a checksum derives the same committee from it.

use crate::chain::state::Wallet;
use crate::crypto::Token;
use crate::types::{CandidateInfo, Validator, Weight};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Decides who sits on the next committee and with what weight, and how
/// committed equivocations are punished.
pub trait Permission: Send + Sync {
    /// Validators admitted from the applicants before punishment.
    fn admit(&self, candidates: &[CandidateInfo], state: &Wallet) -> Vec<Validator>;

    /// Applies `offenses` committed equivocations to `validator`. `None`
    /// removes it from the committee.
    fn punish(&self, validator: Validator, offenses: u64, state: &Wallet) -> Option<Validator>;

    /// Validators for the next window, from the applicants and the state
    /// snapshot the window is seeded from.
    fn validators(&self, candidates: &[CandidateInfo], state: &Wallet) -> Vec<Validator> {
        self.admit(candidates, state)
            .into_iter()
            .filter_map(|validator| match state.offenses(&validator.token) {
                0 => Some(validator),
                offenses => {
                    let token = validator.token;
                    let punished = self.punish(validator, offenses, state);
                    if punished.is_none() {
                        warn!(offender = %token, offenses, "Validator removed from committee");
                    }
                    punished
                }
            })
            .collect()
    }
}

/// Weight proportional to balance, in units of `stake_unit`.
pub struct ProofOfStake {
    stake_unit: u64,
    max_weight: Weight,
    /// Share of full stake removed per offense, in percent.
    slash_percent: u64,
}

impl ProofOfStake {
    pub fn new(stake_unit: u64, max_weight: Weight, slash_percent: u64) -> Self {
        Self {
            stake_unit: stake_unit.max(1),
            max_weight,
            slash_percent: slash_percent.min(100),
        }
    }

    fn penalty(&self) -> u64 {
        ((self.stake_unit * self.max_weight).saturating_mul(self.slash_percent) / 100).max(1)
    }

    fn weight(&self, stake: u64) -> Weight {
        (stake / self.stake_unit).min(self.max_weight)
    }

    /// Stake of `token` after slashing for its committed offenses.
    pub fn stake(&self, token: &Token, state: &Wallet) -> u64 {
        let slashed = self.penalty().saturating_mul(state.offenses(token));
        state.balance(token).saturating_sub(slashed)
    }
}

impl Permission for ProofOfStake {
    fn admit(&self, candidates: &[CandidateInfo], state: &Wallet) -> Vec<Validator> {
        candidates
            .iter()
            .filter_map(|candidate| {
                let weight = self.weight(state.balance(&candidate.token));
                (weight > 0).then(|| Validator {
                    token: candidate.token,
                    address: candidate.address.clone(),
                    weight,
                })
            })
            .collect()
    }

    fn punish(&self, mut validator: Validator, _offenses: u64, state: &Wallet) -> Option<Validator> {
        validator.weight = self.weight(self.stake(&validator.token, state));
        (validator.weight > 0).then_some(validator)
    }
}

/// Fixed authority list, weight 1 each.
pub struct ProofOfAuthority {
    authorities: BTreeMap<Token, String>,
}

impl ProofOfAuthority {
    pub fn new(authorities: impl IntoIterator<Item = (Token, String)>) -> Self {
        Self {
            authorities: authorities.into_iter().collect(),
        }
    }
}

impl Permission for ProofOfAuthority {
    fn admit(&self, candidates: &[CandidateInfo], _state: &Wallet) -> Vec<Validator> {
        self.authorities
            .iter()
            .map(|(token, address)| Validator {
                token: *token,
                // Prefer a freshly announced address.
                address: candidates
                    .iter()
                    .find(|c| c.token == *token)
                    .map_or_else(|| address.clone(), |c| c.address.clone()),
                weight: 1,
            })
            .collect()
    }

    /// Any committed equivocation revokes the authority.
    fn punish(&self, _validator: Validator, _offenses: u64, _state: &Wallet) -> Option<Validator> {
        None
    }
}

/// Every candidate sits with weight 1; offenders are excluded for good.
#[derive(Default)]
pub struct Permissionless;

impl Permissionless {
    pub fn new() -> Self {
        Self
    }
}

impl Permission for Permissionless {
    fn admit(&self, candidates: &[CandidateInfo], _state: &Wallet) -> Vec<Validator> {
        let mut seen = HashSet::new();
        candidates
            .iter()
            .filter(|c| seen.insert(c.token))
            .map(|c| Validator {
                token: c.token,
                address: c.address.clone(),
                weight: 1,
            })
            .collect()
    }

    fn punish(&self, _validator: Validator, _offenses: u64, _state: &Wallet) -> Option<Validator> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::action::Entry;
    use crate::chain::state::{MutatingState, Mutations};
    use crate::crypto::{Hash, KeyPair};
    use crate::pooling::{Duplicate, RoundMessage, RoundVote};
    use std::sync::Arc;

    fn candidate(key: &KeyPair) -> CandidateInfo {
        CandidateInfo {
            token: key.token(),
            address: format!("node-{}", key.token()),
        }
    }

    /// `state` with an equivocation by `key` committed at epoch 1.
    fn with_offense(state: Wallet, key: &KeyPair) -> Wallet {
        let duplicate = Duplicate {
            one: RoundMessage::Vote(RoundVote::new(key, 1, 0, false, Hash::of(b"a"), false)),
            two: RoundMessage::Vote(RoundVote::new(key, 1, 0, false, Hash::of(b"b"), false)),
        };
        let mut validator = MutatingState::new(Arc::new(state), Arc::default(), Mutations::new(), 2);
        assert!(validator.validate_entry(&Entry::Evidence(duplicate.clone()), Hash::of(&duplicate.serialize())));
        validator.wallet()
    }

    #[test]
    fn test_stake_weights_and_slashing() {
        let rich = KeyPair::from_seed(&[1; 32]);
        let poor = KeyPair::from_seed(&[2; 32]);
        let state = Wallet::new(vec![(rich.token(), 5_000), (poor.token(), 50)]);
        let policy = ProofOfStake::new(100, 10, 50);

        let validators = policy.validators(&[candidate(&rich), candidate(&poor)], &state);
        assert_eq!(validators.len(), 1);
        assert_eq!(validators[0].weight, 10);

        let state = with_offense(state, &rich);
        assert_eq!(policy.stake(&rich.token(), &state), 4_500);
        assert_eq!(policy.validators(&[candidate(&rich)], &state)[0].weight, 10);

        let heavy = ProofOfStake::new(100, 10, 100);
        assert_eq!(heavy.stake(&rich.token(), &state), 4_000);
        let drained = ProofOfStake::new(1_000, 5, 100);
        assert!(drained.validators(&[candidate(&rich)], &state).is_empty());
    }

    #[test]
    fn test_authority_revoked_on_duplicate() {
        let a = KeyPair::from_seed(&[1; 32]);
        let b = KeyPair::from_seed(&[2; 32]);
        let policy = ProofOfAuthority::new(vec![
            (a.token(), "a".to_string()),
            (b.token(), "b".to_string()),
        ]);
        assert_eq!(policy.validators(&[], &Wallet::default()).len(), 2);
        let state = with_offense(Wallet::default(), &a);
        let validators = policy.validators(&[candidate(&a)], &state);
        assert_eq!(validators.len(), 1);
        assert_eq!(validators[0].token, b.token());
    }

    #[test]
    fn test_permissionless_excludes_offenders() {
        let a = KeyPair::from_seed(&[1; 32]);
        let b = KeyPair::from_seed(&[2; 32]);
        let policy = Permissionless::new();
        let candidates = vec![candidate(&a), candidate(&b), candidate(&a)];
        assert_eq!(policy.validators(&candidates, &Wallet::default()).len(), 2);
        let state = with_offense(Wallet::default(), &b);
        let validators = policy.validators(&candidates, &state);
        assert_eq!(validators.len(), 1);
        assert_eq!(validators[0].token, a.token());
    }
}
