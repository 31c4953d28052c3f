//! Signed consensus messages.
//!
//! Each message starts with its kind byte and ends with a signature over all
//! preceding bytes. Parsing verifies the signature against the embedded
//! signer token, so a parsed message is always authentic.

use crate::crypto::{Hash, KeyPair, Signature, Token};
use crate::types::{Epoch, Round, Weight};
use crate::wire::{clamp_short, kind_of, Reader, WireError, Writer};

pub const PROPOSE: u8 = 0;
pub const VOTE: u8 = 1;
pub const COMMIT: u8 = 2;
pub const DUPLICATE: u8 = 3;
pub const DONE: u8 = 4;
pub const CANDIDATE: u8 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundPropose {
    pub epoch: Epoch,
    pub round: Round,
    pub token: Token,
    pub value: Hash,
    /// Earlier round in which `value` gathered a vote majority, if any.
    pub last_valid_round: Option<Round>,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundVote {
    pub epoch: Epoch,
    pub round: Round,
    pub blank: bool,
    pub token: Token,
    pub value: Hash,
    /// The voter already holds the block for `value`.
    pub has_data: bool,
    /// Pool weight of the voter; local bookkeeping, not on the wire.
    pub weight: Weight,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundCommit {
    pub epoch: Epoch,
    pub round: Round,
    pub blank: bool,
    pub token: Token,
    pub value: Hash,
    /// Pool weight of the committer; local bookkeeping, not on the wire.
    pub weight: Weight,
    pub signature: Signature,
}

/// Announcement that an epoch finalized locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Done {
    pub epoch: Epoch,
    pub round: Round,
    pub value: Hash,
    pub token: Token,
    pub signature: Signature,
}

/// Application to sit on the committee of the window starting at `epoch`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub epoch: Epoch,
    pub token: Token,
    pub address: String,
    pub signature: Signature,
}

/// A propose, vote or commit, as carried inside duplicate evidence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundMessage {
    Propose(RoundPropose),
    Vote(RoundVote),
    Commit(RoundCommit),
}

/// Two conflicting signed messages from the same signer in the same round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Duplicate {
    pub one: RoundMessage,
    pub two: RoundMessage,
}

/// Any message handled by the voting engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolingMessage {
    Propose(RoundPropose),
    Vote(RoundVote),
    Commit(RoundCommit),
    Duplicate(Duplicate),
    Done(Done),
    Candidate(Candidate),
}

fn sign_into(mut writer: Writer, credentials: &KeyPair) -> Signature {
    let signature = credentials.sign(writer.as_bytes());
    writer.put_signature(&signature);
    signature
}

impl RoundPropose {
    pub fn new(
        credentials: &KeyPair,
        epoch: Epoch,
        round: Round,
        value: Hash,
        last_valid_round: Option<Round>,
    ) -> Self {
        let mut propose = Self {
            epoch,
            round,
            token: credentials.token(),
            value,
            last_valid_round,
            signature: Signature::ZERO,
        };
        propose.signature = sign_into(propose.unsigned(), credentials);
        propose
    }

    fn unsigned(&self) -> Writer {
        let mut writer = Writer::with_kind(PROPOSE);
        writer.put_u64(self.epoch);
        writer.put_u32(self.round);
        writer.put_token(&self.token);
        writer.put_hash(&self.value);
        writer.put_bool(self.last_valid_round.is_some());
        writer.put_u32(self.last_valid_round.unwrap_or(0));
        writer
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = self.unsigned();
        writer.put_signature(&self.signature);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        reader.expect_kind(PROPOSE)?;
        let epoch = reader.read_u64()?;
        let round = reader.read_u32()?;
        let token = reader.read_token()?;
        let value = reader.read_hash()?;
        let has_last = reader.read_bool()?;
        let last = reader.read_u32()?;
        let signature = reader.read_verified_signature(&token)?;
        reader.finish()?;
        Ok(Self {
            epoch,
            round,
            token,
            value,
            last_valid_round: has_last.then_some(last),
            signature,
        })
    }
}

impl RoundVote {
    pub fn new(
        credentials: &KeyPair,
        epoch: Epoch,
        round: Round,
        blank: bool,
        value: Hash,
        has_data: bool,
    ) -> Self {
        let mut vote = Self {
            epoch,
            round,
            blank,
            token: credentials.token(),
            value: if blank { Hash::ZERO } else { value },
            has_data,
            weight: 0,
            signature: Signature::ZERO,
        };
        vote.signature = sign_into(vote.unsigned(), credentials);
        vote
    }

    fn unsigned(&self) -> Writer {
        let mut writer = Writer::with_kind(VOTE);
        writer.put_u64(self.epoch);
        writer.put_u32(self.round);
        writer.put_bool(self.blank);
        writer.put_token(&self.token);
        writer.put_hash(&self.value);
        writer.put_bool(self.has_data);
        writer
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = self.unsigned();
        writer.put_signature(&self.signature);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        reader.expect_kind(VOTE)?;
        let epoch = reader.read_u64()?;
        let round = reader.read_u32()?;
        let blank = reader.read_bool()?;
        let token = reader.read_token()?;
        let value = reader.read_hash()?;
        let has_data = reader.read_bool()?;
        let signature = reader.read_verified_signature(&token)?;
        reader.finish()?;
        Ok(Self {
            epoch,
            round,
            blank,
            token,
            value,
            has_data,
            weight: 0,
            signature,
        })
    }

    /// Votes from one signer disagree on what they support. The has-data flag
    /// is informational and does not count.
    pub fn conflicts_with(&self, other: &RoundVote) -> bool {
        self.blank != other.blank || (!self.blank && self.value != other.value)
    }
}

impl RoundCommit {
    pub fn new(
        credentials: &KeyPair,
        epoch: Epoch,
        round: Round,
        blank: bool,
        value: Hash,
    ) -> Self {
        let mut commit = Self {
            epoch,
            round,
            blank,
            token: credentials.token(),
            value: if blank { Hash::ZERO } else { value },
            weight: 0,
            signature: Signature::ZERO,
        };
        commit.signature = sign_into(commit.unsigned(), credentials);
        commit
    }

    fn unsigned(&self) -> Writer {
        let mut writer = Writer::with_kind(COMMIT);
        writer.put_u64(self.epoch);
        writer.put_u32(self.round);
        writer.put_bool(self.blank);
        writer.put_token(&self.token);
        writer.put_hash(&self.value);
        writer
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = self.unsigned();
        writer.put_signature(&self.signature);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        reader.expect_kind(COMMIT)?;
        let epoch = reader.read_u64()?;
        let round = reader.read_u32()?;
        let blank = reader.read_bool()?;
        let token = reader.read_token()?;
        let value = reader.read_hash()?;
        let signature = reader.read_verified_signature(&token)?;
        reader.finish()?;
        Ok(Self {
            epoch,
            round,
            blank,
            token,
            value,
            weight: 0,
            signature,
        })
    }

    pub fn conflicts_with(&self, other: &RoundCommit) -> bool {
        self.blank != other.blank || (!self.blank && self.value != other.value)
    }
}

impl Done {
    pub fn new(credentials: &KeyPair, epoch: Epoch, round: Round, value: Hash) -> Self {
        let mut done = Self {
            epoch,
            round,
            value,
            token: credentials.token(),
            signature: Signature::ZERO,
        };
        done.signature = sign_into(done.unsigned(), credentials);
        done
    }

    fn unsigned(&self) -> Writer {
        let mut writer = Writer::with_kind(DONE);
        writer.put_u64(self.epoch);
        writer.put_u32(self.round);
        writer.put_hash(&self.value);
        writer.put_token(&self.token);
        writer
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = self.unsigned();
        writer.put_signature(&self.signature);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        reader.expect_kind(DONE)?;
        let epoch = reader.read_u64()?;
        let round = reader.read_u32()?;
        let value = reader.read_hash()?;
        let token = reader.read_token()?;
        let signature = reader.read_verified_signature(&token)?;
        reader.finish()?;
        Ok(Self {
            epoch,
            round,
            value,
            token,
            signature,
        })
    }
}

impl Candidate {
    pub fn new(credentials: &KeyPair, epoch: Epoch, address: &str) -> Self {
        let mut candidate = Self {
            epoch,
            token: credentials.token(),
            address: clamp_short(address).to_string(),
            signature: Signature::ZERO,
        };
        candidate.signature = sign_into(candidate.unsigned(), credentials);
        candidate
    }

    fn unsigned(&self) -> Writer {
        let mut writer = Writer::with_kind(CANDIDATE);
        writer.put_u64(self.epoch);
        writer.put_token(&self.token);
        writer.put_short_str(&self.address);
        writer
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = self.unsigned();
        writer.put_signature(&self.signature);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        reader.expect_kind(CANDIDATE)?;
        let epoch = reader.read_u64()?;
        let token = reader.read_token()?;
        let address = String::from_utf8(reader.read_short_byte_array()?.to_vec())
            .map_err(|_| WireError::Invalid("address"))?;
        let signature = reader.read_verified_signature(&token)?;
        reader.finish()?;
        Ok(Self {
            epoch,
            token,
            address,
            signature,
        })
    }
}

impl RoundMessage {
    pub fn token(&self) -> Token {
        match self {
            RoundMessage::Propose(p) => p.token,
            RoundMessage::Vote(v) => v.token,
            RoundMessage::Commit(c) => c.token,
        }
    }

    pub fn epoch(&self) -> Epoch {
        match self {
            RoundMessage::Propose(p) => p.epoch,
            RoundMessage::Vote(v) => v.epoch,
            RoundMessage::Commit(c) => c.epoch,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            RoundMessage::Propose(p) => p.round,
            RoundMessage::Vote(v) => v.round,
            RoundMessage::Commit(c) => c.round,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            RoundMessage::Propose(p) => p.serialize(),
            RoundMessage::Vote(v) => v.serialize(),
            RoundMessage::Commit(c) => c.serialize(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        match kind_of(data) {
            Some(PROPOSE) => RoundPropose::parse(data).map(RoundMessage::Propose),
            Some(VOTE) => RoundVote::parse(data).map(RoundMessage::Vote),
            Some(COMMIT) => RoundCommit::parse(data).map(RoundMessage::Commit),
            Some(kind) => Err(WireError::UnknownKind(kind)),
            None => Err(WireError::Truncated {
                offset: 0,
                needed: 1,
            }),
        }
    }

    /// Same kind, signer, epoch and round, but different content.
    fn conflicts_with(&self, other: &RoundMessage) -> bool {
        if self.token() != other.token()
            || self.epoch() != other.epoch()
            || self.round() != other.round()
        {
            return false;
        }
        match (self, other) {
            (RoundMessage::Propose(a), RoundMessage::Propose(b)) => {
                a.value != b.value || a.last_valid_round != b.last_valid_round
            }
            (RoundMessage::Vote(a), RoundMessage::Vote(b)) => a.conflicts_with(b),
            (RoundMessage::Commit(a), RoundMessage::Commit(b)) => a.conflicts_with(b),
            _ => false,
        }
    }
}

impl Duplicate {
    pub fn offender(&self) -> Token {
        self.one.token()
    }

    pub fn epoch(&self) -> Epoch {
        self.one.epoch()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_kind(DUPLICATE);
        // Round messages are far below the u16 limit.
        let _ = writer.put_short_byte_array(&self.one.serialize());
        let _ = writer.put_short_byte_array(&self.two.serialize());
        writer.into_bytes()
    }

    /// Parses both messages and checks that they really conflict.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        reader.expect_kind(DUPLICATE)?;
        let one = RoundMessage::parse(reader.read_short_byte_array()?)?;
        let two = RoundMessage::parse(reader.read_short_byte_array()?)?;
        reader.finish()?;
        if !one.conflicts_with(&two) {
            return Err(WireError::Invalid("duplicate messages do not conflict"));
        }
        Ok(Self { one, two })
    }
}

impl PoolingMessage {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        match kind_of(data) {
            Some(PROPOSE) => RoundPropose::parse(data).map(PoolingMessage::Propose),
            Some(VOTE) => RoundVote::parse(data).map(PoolingMessage::Vote),
            Some(COMMIT) => RoundCommit::parse(data).map(PoolingMessage::Commit),
            Some(DUPLICATE) => Duplicate::parse(data).map(PoolingMessage::Duplicate),
            Some(DONE) => Done::parse(data).map(PoolingMessage::Done),
            Some(CANDIDATE) => Candidate::parse(data).map(PoolingMessage::Candidate),
            Some(kind) => Err(WireError::UnknownKind(kind)),
            None => Err(WireError::Truncated {
                offset: 0,
                needed: 1,
            }),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            PoolingMessage::Propose(m) => m.serialize(),
            PoolingMessage::Vote(m) => m.serialize(),
            PoolingMessage::Commit(m) => m.serialize(),
            PoolingMessage::Duplicate(m) => m.serialize(),
            PoolingMessage::Done(m) => m.serialize(),
            PoolingMessage::Candidate(m) => m.serialize(),
        }
    }

    /// Epoch the message belongs to, used to route it to an engine instance.
    pub fn epoch(&self) -> Epoch {
        match self {
            PoolingMessage::Propose(m) => m.epoch,
            PoolingMessage::Vote(m) => m.epoch,
            PoolingMessage::Commit(m) => m.epoch,
            PoolingMessage::Duplicate(m) => m.epoch(),
            PoolingMessage::Done(m) => m.epoch,
            PoolingMessage::Candidate(m) => m.epoch,
        }
    }
}

/// Whether `kind` is handled by the voting engine.
pub fn is_pooling_kind(kind: u8) -> bool {
    kind <= CANDIDATE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserialized(data: &[u8]) -> Vec<u8> {
        PoolingMessage::parse(data).unwrap().serialize()
    }

    #[test]
    fn test_messages_reserialize_identically() {
        let keypair = KeyPair::generate();
        let value = Hash::of(b"block");
        let messages = vec![
            RoundPropose::new(&keypair, 4, 0, value, None).serialize(),
            RoundPropose::new(&keypair, 4, 2, value, Some(1)).serialize(),
            RoundVote::new(&keypair, 4, 1, false, value, true).serialize(),
            RoundVote::new(&keypair, 4, 1, true, value, false).serialize(),
            RoundCommit::new(&keypair, 4, 1, false, value).serialize(),
            Done::new(&keypair, 4, 1, value).serialize(),
            Candidate::new(&keypair, 11, "10.0.0.1:7000").serialize(),
        ];
        for bytes in messages {
            assert_eq!(reserialized(&bytes), bytes);
        }
    }

    #[test]
    fn test_oversized_address_still_reserializes() {
        let keypair = KeyPair::generate();
        let candidate = Candidate::new(&keypair, 11, &"a".repeat(70_000));
        assert_eq!(candidate.address.len(), u16::MAX as usize);
        let bytes = candidate.serialize();
        assert_eq!(Candidate::parse(&bytes), Ok(candidate));
    }

    #[test]
    fn test_blank_vote_zeroes_value() {
        let keypair = KeyPair::generate();
        let vote = RoundVote::new(&keypair, 1, 0, true, Hash::of(b"x"), false);
        assert_eq!(vote.value, Hash::ZERO);
    }

    #[test]
    fn test_tampered_vote_is_rejected() {
        let keypair = KeyPair::generate();
        let mut bytes = RoundVote::new(&keypair, 1, 0, false, Hash::of(b"x"), false).serialize();
        bytes[1] ^= 1;
        assert_eq!(RoundVote::parse(&bytes), Err(WireError::InvalidSignature));
        assert!(matches!(
            RoundCommit::parse(&bytes),
            Err(WireError::UnexpectedKind { expected: COMMIT, found: VOTE })
        ));
    }

    #[test]
    fn test_duplicate_requires_conflict() {
        let keypair = KeyPair::generate();
        let one = RoundVote::new(&keypair, 3, 0, false, Hash::of(b"a"), false);
        let two = RoundVote::new(&keypair, 3, 0, false, Hash::of(b"b"), false);
        let duplicate = Duplicate {
            one: RoundMessage::Vote(one.clone()),
            two: RoundMessage::Vote(two),
        };
        let bytes = duplicate.serialize();
        let parsed = Duplicate::parse(&bytes).unwrap();
        assert_eq!(parsed.offender(), keypair.token());
        assert_eq!(parsed.serialize(), bytes);

        let same = Duplicate {
            one: RoundMessage::Vote(one.clone()),
            two: RoundMessage::Vote(one),
        };
        assert!(Duplicate::parse(&same.serialize()).is_err());

        let other = KeyPair::generate();
        let cross = Duplicate {
            one: RoundMessage::Vote(RoundVote::new(&keypair, 3, 0, false, Hash::of(b"a"), false)),
            two: RoundMessage::Vote(RoundVote::new(&other, 3, 0, false, Hash::of(b"b"), false)),
        };
        assert!(Duplicate::parse(&cross.serialize()).is_err());
    }

    #[test]
    fn test_has_data_flag_is_not_a_conflict() {
        let keypair = KeyPair::generate();
        let a = RoundVote::new(&keypair, 3, 0, false, Hash::of(b"a"), false);
        let b = RoundVote::new(&keypair, 3, 0, false, Hash::of(b"a"), true);
        assert!(!a.conflicts_with(&b));
    }
}
