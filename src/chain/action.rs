use crate::crypto::{Hash, KeyPair, Signature, Token};
use crate::pooling::messages::{CANDIDATE, DUPLICATE};
use crate::pooling::{Candidate, Duplicate};
use crate::types::Epoch;
use crate::wire::{clamp_short, kind_of, Reader, WireError, Writer};

/// Number of epochs after its own epoch during which an action may be
/// included in a block.
pub const ACTION_VALIDITY: Epoch = 100;

/// How many epochs ahead of the window it applies for a candidacy may be
/// recorded.
pub const CANDIDACY_LEAD: Epoch = 1_000;

const TRANSFER: u8 = 0;

/// Signed payment between two wallets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub epoch: Epoch,
    pub from: Token,
    pub to: Token,
    pub value: u64,
    pub fee: u64,
    pub reason: String,
    pub signature: Signature,
}

impl Action {
    pub fn transfer(
        credentials: &KeyPair,
        epoch: Epoch,
        to: Token,
        value: u64,
        fee: u64,
        reason: &str,
    ) -> Self {
        let mut action = Self {
            epoch,
            from: credentials.token(),
            to,
            value,
            fee,
            reason: clamp_short(reason).to_string(),
            signature: Signature::ZERO,
        };
        action.signature = credentials.sign(&action.serialize_to_sign());
        action
    }

    fn serialize_to_sign(&self) -> Vec<u8> {
        let mut writer = Writer::with_kind(TRANSFER);
        writer.put_u64(self.epoch);
        writer.put_token(&self.from);
        writer.put_token(&self.to);
        writer.put_u64(self.value);
        writer.put_u64(self.fee);
        writer.put_short_str(&self.reason);
        writer.into_bytes()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = self.serialize_to_sign();
        bytes.extend_from_slice(&self.signature.0);
        bytes
    }

    /// Parses and verifies the payer's signature.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        reader.expect_kind(TRANSFER)?;
        let epoch = reader.read_u64()?;
        let from = reader.read_token()?;
        let to = reader.read_token()?;
        let value = reader.read_u64()?;
        let fee = reader.read_u64()?;
        let reason = String::from_utf8(reader.read_short_byte_array()?.to_vec())
            .map_err(|_| WireError::Invalid("reason"))?;
        let signature = reader.read_verified_signature(&from)?;
        reader.finish()?;
        Ok(Self {
            epoch,
            from,
            to,
            value,
            fee,
            reason,
            signature,
        })
    }

    pub fn hash(&self) -> Hash {
        Hash::of(&self.serialize())
    }

    /// Whether the action may be included in a block at `epoch`.
    pub fn valid_at(&self, epoch: Epoch) -> bool {
        self.epoch <= epoch && epoch - self.epoch < ACTION_VALIDITY
    }
}

/// Anything a block may carry: payments, committee applications and
/// equivocation evidence. Applications and evidence go through the chain so
/// every node forms the next committee from the same committed inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    Transfer(Action),
    Candidacy(Candidate),
    Evidence(Duplicate),
}

impl Entry {
    /// Parses by kind, verifying every signature involved.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        match kind_of(data) {
            Some(TRANSFER) => Action::parse(data).map(Entry::Transfer),
            Some(CANDIDATE) => Candidate::parse(data).map(Entry::Candidacy),
            Some(DUPLICATE) => Duplicate::parse(data).map(Entry::Evidence),
            Some(kind) => Err(WireError::UnknownKind(kind)),
            None => Err(WireError::Truncated {
                offset: 0,
                needed: 1,
            }),
        }
    }

    pub fn fee(&self) -> u64 {
        match self {
            Entry::Transfer(action) => action.fee,
            Entry::Candidacy(_) | Entry::Evidence(_) => 0,
        }
    }

    /// Whether the entry may be included in a block at `epoch`.
    pub fn valid_at(&self, epoch: Epoch) -> bool {
        match self {
            Entry::Transfer(action) => action.valid_at(epoch),
            Entry::Candidacy(candidate) => {
                epoch < candidate.epoch && candidate.epoch - epoch <= CANDIDACY_LEAD
            }
            Entry::Evidence(duplicate) => {
                duplicate.epoch() <= epoch && epoch - duplicate.epoch() < ACTION_VALIDITY
            }
        }
    }

    /// First epoch at which the entry can no longer be included.
    pub fn expires(&self) -> Epoch {
        match self {
            Entry::Transfer(action) => action.epoch.saturating_add(ACTION_VALIDITY),
            Entry::Candidacy(candidate) => candidate.epoch,
            Entry::Evidence(duplicate) => duplicate.epoch().saturating_add(ACTION_VALIDITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verifies_signature() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let action = Action::transfer(&alice, 3, bob.token(), 50, 1, "rent");

        let bytes = action.serialize();
        let parsed = Action::parse(&bytes).unwrap();
        assert_eq!(parsed, action);
        assert_eq!(parsed.hash(), action.hash());

        let mut tampered = bytes.clone();
        tampered[1 + 8 + 32 + 32] ^= 0xff; // first byte of value
        assert_eq!(Action::parse(&tampered), Err(WireError::InvalidSignature));
    }

    #[test]
    fn test_validity_window() {
        let alice = KeyPair::generate();
        let action = Action::transfer(&alice, 10, alice.token(), 1, 0, "");
        assert!(!action.valid_at(9));
        assert!(action.valid_at(10));
        assert!(action.valid_at(10 + ACTION_VALIDITY - 1));
        assert!(!action.valid_at(10 + ACTION_VALIDITY));
    }

    #[test]
    fn test_entries_parse_by_kind() {
        let alice = KeyPair::generate();
        let transfer = Action::transfer(&alice, 3, alice.token(), 1, 2, "");
        let candidacy = Candidate::new(&alice, 20, "10.0.0.1:7000");
        assert_eq!(Entry::parse(&transfer.serialize()), Ok(Entry::Transfer(transfer.clone())));
        assert_eq!(Entry::parse(&candidacy.serialize()), Ok(Entry::Candidacy(candidacy.clone())));
        assert_eq!(Entry::Transfer(transfer).fee(), 2);

        let entry = Entry::Candidacy(candidacy);
        assert!(entry.valid_at(19));
        assert!(!entry.valid_at(20));
        let distant = Entry::Candidacy(Candidate::new(&alice, 2 + CANDIDACY_LEAD, "10.0.0.1:7000"));
        assert!(!distant.valid_at(1));
        assert!(distant.valid_at(2));
        assert_eq!(entry.expires(), 20);
        assert!(Entry::parse(&[9, 0, 0]).is_err());
    }
}
