use crate::chain::action::Entry;
use crate::chain::state::{MutatingState, Mutations};
use crate::chain::ChainError;
use crate::crypto::{Hash, KeyPair, Signature, Token};
use crate::types::{ActionBytes, Epoch};
use crate::wire::{Reader, WireError, Writer};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub network_hash: Hash,
    pub epoch: Epoch,
    pub checkpoint: Epoch,
    pub checkpoint_hash: Hash,
    pub proposer: Token,
    pub proposed_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSeal {
    pub hash: Hash,
    pub fees: u64,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCommit {
    pub invalidated: Vec<Hash>,
    pub fees: u64,
    pub publisher: Token,
    pub signature: Signature,
}

/// Block whose hash is fixed and signed, pending commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedBlock {
    pub header: BlockHeader,
    pub actions: Vec<ActionBytes>,
    pub seal: BlockSeal,
}

/// Terminal form of a block: re-validated and merged into the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitBlock {
    pub sealed: SealedBlock,
    pub commit: BlockCommit,
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl BlockHeader {
    pub fn write(&self, writer: &mut Writer) {
        writer.put_hash(&self.network_hash);
        writer.put_u64(self.epoch);
        writer.put_u64(self.checkpoint);
        writer.put_hash(&self.checkpoint_hash);
        writer.put_token(&self.proposer);
        writer.put_u64(self.proposed_at);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            network_hash: reader.read_hash()?,
            epoch: reader.read_u64()?,
            checkpoint: reader.read_u64()?,
            checkpoint_hash: reader.read_hash()?,
            proposer: reader.read_token()?,
            proposed_at: reader.read_u64()?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let header = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(header)
    }
}

fn block_hash(header: &BlockHeader, actions: &[ActionBytes]) -> Hash {
    let mut writer = Writer::new();
    header.write(&mut writer);
    writer.put_array(actions);
    Hash::of(writer.as_bytes())
}

impl SealedBlock {
    fn write_unsigned(&self, writer: &mut Writer) {
        self.header.write(writer);
        writer.put_array(&self.actions);
        writer.put_hash(&self.seal.hash);
        writer.put_u64(self.seal.fees);
    }

    pub fn write(&self, writer: &mut Writer) {
        self.write_unsigned(writer);
        writer.put_signature(&self.seal.signature);
    }

    /// Reads a sealed block, checking that the seal hash matches the content
    /// and that the proposer signed it.
    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let start = reader.position();
        let header = BlockHeader::read(reader)?;
        let actions: Vec<ActionBytes> = reader.read_array()?.into_iter().map(|a| a.to_vec()).collect();
        let hash = reader.read_hash()?;
        let fees = reader.read_u64()?;
        let signed = &reader.consumed()[start..];
        let signature = reader.read_signature()?;
        if !header.proposer.verify(signed, &signature) {
            return Err(WireError::InvalidSignature);
        }
        if block_hash(&header, &actions) != hash {
            return Err(WireError::Invalid("seal hash"));
        }
        Ok(Self {
            header,
            actions,
            seal: BlockSeal {
                hash,
                fees,
                signature,
            },
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let block = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(block)
    }

    pub fn epoch(&self) -> Epoch {
        self.header.epoch
    }

    pub fn hash(&self) -> Hash {
        self.seal.hash
    }

    /// Signs a commit record for this block.
    pub fn commit(self, invalidated: Vec<Hash>, fees: u64, publisher: &KeyPair) -> CommitBlock {
        let mut commit = CommitBlock {
            sealed: self,
            commit: BlockCommit {
                invalidated,
                fees,
                publisher: publisher.token(),
                signature: Signature::ZERO,
            },
        };
        let mut writer = Writer::new();
        commit.write_unsigned(&mut writer);
        commit.commit.signature = publisher.sign(writer.as_bytes());
        commit
    }
}

impl CommitBlock {
    fn write_unsigned(&self, writer: &mut Writer) {
        self.sealed.write(writer);
        writer.put_hashes(&self.commit.invalidated);
        writer.put_u64(self.commit.fees);
        writer.put_token(&self.commit.publisher);
    }

    pub fn write(&self, writer: &mut Writer) {
        self.write_unsigned(writer);
        writer.put_signature(&self.commit.signature);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let start = reader.position();
        let sealed = SealedBlock::read(reader)?;
        let invalidated = reader.read_hashes()?;
        let fees = reader.read_u64()?;
        let publisher = reader.read_token()?;
        let signed = &reader.consumed()[start..];
        let signature = reader.read_signature()?;
        if !publisher.verify(signed, &signature) {
            return Err(WireError::InvalidSignature);
        }
        Ok(Self {
            sealed,
            commit: BlockCommit {
                invalidated,
                fees,
                publisher,
                signature,
            },
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let block = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(block)
    }

    pub fn epoch(&self) -> Epoch {
        self.sealed.header.epoch
    }

    /// Checks the publisher's signature over the block and commit record.
    pub fn verify(&self) -> bool {
        let mut writer = Writer::new();
        self.write_unsigned(&mut writer);
        self.commit
            .publisher
            .verify(writer.as_bytes(), &self.commit.signature)
    }

    pub fn hash(&self) -> Hash {
        self.sealed.seal.hash
    }
}

/// A live block being filled with validated actions.
///
/// Leaders use [`BlockBuilder::push`] and [`BlockBuilder::seal`]; followers
/// replay the leader's stream with [`BlockBuilder::replay`] and close it with
/// [`BlockBuilder::accept_seal`].
#[derive(Debug)]
pub struct BlockBuilder {
    header: BlockHeader,
    actions: Vec<ActionBytes>,
    validator: MutatingState,
    fees: u64,
}

impl BlockBuilder {
    pub fn new(header: BlockHeader, validator: MutatingState) -> Self {
        Self {
            header,
            actions: Vec::new(),
            validator,
            fees: 0,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Appends `data` if it parses and validates. Returns the parsed entry.
    pub fn push(&mut self, data: &[u8]) -> Option<Entry> {
        let entry = Entry::parse(data).ok()?;
        if !self.validator.validate_entry(&entry, Hash::of(data)) {
            return None;
        }
        self.fees = self.fees.saturating_add(entry.fee());
        self.actions.push(data.to_vec());
        Some(entry)
    }

    /// Appends `data` unconditionally, as the leader included it. Its effect
    /// is only recorded if it validates locally; commit re-validation settles
    /// any disagreement.
    pub fn replay(&mut self, data: &[u8]) {
        if let Ok(entry) = Entry::parse(data) {
            if self.validator.validate_entry(&entry, Hash::of(data)) {
                self.fees = self.fees.saturating_add(entry.fee());
            }
        }
        self.actions.push(data.to_vec());
    }

    pub fn hash(&self) -> Hash {
        block_hash(&self.header, &self.actions)
    }

    pub fn seal(self, credentials: &KeyPair) -> (SealedBlock, Mutations) {
        let mut block = SealedBlock {
            seal: BlockSeal {
                hash: block_hash(&self.header, &self.actions),
                fees: self.fees,
                signature: Signature::ZERO,
            },
            header: self.header,
            actions: self.actions,
        };
        let mut writer = Writer::new();
        block.write_unsigned(&mut writer);
        block.seal.signature = credentials.sign(writer.as_bytes());
        (block, self.validator.into_mutations())
    }

    /// Closes a replayed block with the leader's seal.
    pub fn accept_seal(self, seal: BlockSeal) -> Result<(SealedBlock, Mutations), ChainError> {
        let hash = block_hash(&self.header, &self.actions);
        if hash != seal.hash {
            return Err(ChainError::SealMismatch {
                epoch: self.header.epoch,
            });
        }
        let block = SealedBlock {
            header: self.header,
            actions: self.actions,
            seal,
        };
        let mut writer = Writer::new();
        block.write_unsigned(&mut writer);
        if !block
            .header
            .proposer
            .verify(writer.as_bytes(), &block.seal.signature)
        {
            return Err(ChainError::InvalidSignature {
                epoch: block.header.epoch,
            });
        }
        Ok((block, self.validator.into_mutations()))
    }
}
