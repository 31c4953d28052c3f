//! Chain lifecycle messages: the leader's block stream, block retrieval,
//! sync, checksum statements and topology.

use crate::chain::{BlockCommit, BlockHeader, BlockSeal, Checksum, CommitBlock, SealedBlock};
use crate::crypto::{Hash, KeyPair, Signature, Token};
use crate::types::{Epoch, Validator};
use crate::wire::{kind_of, Reader, WireError, Writer};

pub const BLOCK_HEADER: u8 = 16;
pub const BLOCK_ACTION: u8 = 17;
pub const BLOCK_SEAL: u8 = 18;
pub const BLOCK_COMMIT: u8 = 19;
pub const SEALED_BLOCK: u8 = 20;
pub const COMMITTED_BLOCK: u8 = 21;
pub const SYNC_REQUEST: u8 = 22;
pub const SYNC_ERROR: u8 = 23;
pub const SYNC_READY: u8 = 24;
pub const SYNC_STATE: u8 = 25;
pub const NAKED_CHECKSUM: u8 = 26;
pub const DRESSED_CHECKSUM: u8 = 27;
pub const TOPOLOGY_REQUEST: u8 = 28;
pub const TOPOLOGY_RESPONSE: u8 = 29;
pub const BLOCK_REQUEST: u8 = 30;
pub const BLOCK_RESPONSE: u8 = 31;

/// Sync error status: the requested epoch is no longer retained.
pub const SYNC_TOO_OLD: u8 = 1;

/// Signed disclosure of a checksum hash for the window starting at `window`.
///
/// The dressed form carries `hash(token ++ checksum hash)` and the naked form
/// the checksum hash itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumStatement {
    pub window: Epoch,
    pub epoch: Epoch,
    pub token: Token,
    pub hash: Hash,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwellMessage {
    Header(BlockHeader),
    Action {
        epoch: Epoch,
        proposer: Token,
        data: Vec<u8>,
    },
    Seal {
        epoch: Epoch,
        proposer: Token,
        seal: BlockSeal,
    },
    /// Commit record for a block the receiver is expected to hold.
    Commit {
        epoch: Epoch,
        hash: Hash,
        commit: BlockCommit,
    },
    Sealed(SealedBlock),
    Committed(CommitBlock),
    SyncRequest {
        epoch: Epoch,
        state: bool,
    },
    SyncError {
        epoch: Epoch,
        code: u8,
    },
    SyncReady {
        epoch: Epoch,
    },
    SyncState(Checksum),
    Naked(ChecksumStatement),
    Dressed(ChecksumStatement),
    TopologyRequest {
        epoch: Epoch,
    },
    TopologyResponse {
        window: Epoch,
        validators: Vec<Validator>,
    },
    BlockRequest {
        epoch: Epoch,
        hash: Hash,
    },
    BlockResponse {
        epoch: Epoch,
        hash: Hash,
        block: Option<SealedBlock>,
    },
}

/// Combined dressed hash for `token` disclosing `hash`.
pub fn dress(token: &Token, hash: &Hash) -> Hash {
    Hash::of_parts(&[&token.0, &hash.0])
}

impl ChecksumStatement {
    pub fn naked(credentials: &KeyPair, window: Epoch, epoch: Epoch, hash: Hash) -> Self {
        Self::signed(NAKED_CHECKSUM, credentials, window, epoch, hash)
    }

    pub fn dressed(credentials: &KeyPair, window: Epoch, epoch: Epoch, checksum: Hash) -> Self {
        let hash = dress(&credentials.token(), &checksum);
        Self::signed(DRESSED_CHECKSUM, credentials, window, epoch, hash)
    }

    fn signed(kind: u8, credentials: &KeyPair, window: Epoch, epoch: Epoch, hash: Hash) -> Self {
        let mut statement = Self {
            window,
            epoch,
            token: credentials.token(),
            hash,
            signature: Signature::ZERO,
        };
        statement.signature = credentials.sign(statement.unsigned(kind).as_bytes());
        statement
    }

    fn unsigned(&self, kind: u8) -> Writer {
        let mut writer = Writer::with_kind(kind);
        writer.put_u64(self.window);
        writer.put_u64(self.epoch);
        writer.put_token(&self.token);
        writer.put_hash(&self.hash);
        writer
    }

    fn serialize(&self, kind: u8) -> Vec<u8> {
        let mut writer = self.unsigned(kind);
        writer.put_signature(&self.signature);
        writer.into_bytes()
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let window = reader.read_u64()?;
        let epoch = reader.read_u64()?;
        let token = reader.read_token()?;
        let hash = reader.read_hash()?;
        let signature = reader.read_verified_signature(&token)?;
        Ok(Self {
            window,
            epoch,
            token,
            hash,
            signature,
        })
    }
}

fn write_validators(writer: &mut Writer, validators: &[Validator]) -> Result<(), WireError> {
    writer.put_u32(validators.len() as u32);
    for validator in validators {
        writer.put_token(&validator.token);
        writer.put_short_byte_array(validator.address.as_bytes())?;
        writer.put_u64(validator.weight);
    }
    Ok(())
}

fn read_validators(reader: &mut Reader<'_>) -> Result<Vec<Validator>, WireError> {
    let count = reader.read_u32()? as usize;
    let mut validators = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        let token = reader.read_token()?;
        let address = String::from_utf8(reader.read_short_byte_array()?.to_vec())
            .map_err(|_| WireError::Invalid("address"))?;
        let weight = reader.read_u64()?;
        validators.push(Validator {
            token,
            address,
            weight,
        });
    }
    Ok(validators)
}

impl SwellMessage {
    pub fn kind(&self) -> u8 {
        match self {
            SwellMessage::Header(_) => BLOCK_HEADER,
            SwellMessage::Action { .. } => BLOCK_ACTION,
            SwellMessage::Seal { .. } => BLOCK_SEAL,
            SwellMessage::Commit { .. } => BLOCK_COMMIT,
            SwellMessage::Sealed(_) => SEALED_BLOCK,
            SwellMessage::Committed(_) => COMMITTED_BLOCK,
            SwellMessage::SyncRequest { .. } => SYNC_REQUEST,
            SwellMessage::SyncError { .. } => SYNC_ERROR,
            SwellMessage::SyncReady { .. } => SYNC_READY,
            SwellMessage::SyncState(_) => SYNC_STATE,
            SwellMessage::Naked(_) => NAKED_CHECKSUM,
            SwellMessage::Dressed(_) => DRESSED_CHECKSUM,
            SwellMessage::TopologyRequest { .. } => TOPOLOGY_REQUEST,
            SwellMessage::TopologyResponse { .. } => TOPOLOGY_RESPONSE,
            SwellMessage::BlockRequest { .. } => BLOCK_REQUEST,
            SwellMessage::BlockResponse { .. } => BLOCK_RESPONSE,
        }
    }

    /// Epoch used to route the message to a window, for window-scoped kinds.
    pub fn routing_epoch(&self) -> Option<Epoch> {
        match self {
            SwellMessage::Header(header) => Some(header.epoch),
            SwellMessage::Action { epoch, .. }
            | SwellMessage::Seal { epoch, .. }
            | SwellMessage::Commit { epoch, .. }
            | SwellMessage::BlockRequest { epoch, .. }
            | SwellMessage::BlockResponse { epoch, .. } => Some(*epoch),
            SwellMessage::Naked(statement) | SwellMessage::Dressed(statement) => {
                Some(statement.window)
            }
            _ => None,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = Writer::with_kind(self.kind());
        match self {
            SwellMessage::Header(header) => header.write(&mut writer),
            SwellMessage::Action {
                epoch,
                proposer,
                data,
            } => {
                writer.put_u64(*epoch);
                writer.put_token(proposer);
                writer.put_byte_array(data);
            }
            SwellMessage::Seal {
                epoch,
                proposer,
                seal,
            } => {
                writer.put_u64(*epoch);
                writer.put_token(proposer);
                writer.put_hash(&seal.hash);
                writer.put_u64(seal.fees);
                writer.put_signature(&seal.signature);
            }
            SwellMessage::Commit {
                epoch,
                hash,
                commit,
            } => {
                writer.put_u64(*epoch);
                writer.put_hash(hash);
                writer.put_hashes(&commit.invalidated);
                writer.put_u64(commit.fees);
                writer.put_token(&commit.publisher);
                writer.put_signature(&commit.signature);
            }
            SwellMessage::Sealed(block) => block.write(&mut writer),
            SwellMessage::Committed(block) => block.write(&mut writer),
            SwellMessage::SyncRequest { epoch, state } => {
                writer.put_u64(*epoch);
                writer.put_bool(*state);
            }
            SwellMessage::SyncError { epoch, code } => {
                writer.put_u64(*epoch);
                writer.put_u8(*code);
            }
            SwellMessage::SyncReady { epoch } | SwellMessage::TopologyRequest { epoch } => {
                writer.put_u64(*epoch)
            }
            SwellMessage::SyncState(checksum) => checksum.write(&mut writer),
            SwellMessage::Naked(statement) => return Ok(statement.serialize(NAKED_CHECKSUM)),
            SwellMessage::Dressed(statement) => return Ok(statement.serialize(DRESSED_CHECKSUM)),
            SwellMessage::TopologyResponse { window, validators } => {
                writer.put_u64(*window);
                write_validators(&mut writer, validators)?;
            }
            SwellMessage::BlockRequest { epoch, hash } => {
                writer.put_u64(*epoch);
                writer.put_hash(hash);
            }
            SwellMessage::BlockResponse { epoch, hash, block } => {
                writer.put_u64(*epoch);
                writer.put_hash(hash);
                writer.put_bool(block.is_some());
                if let Some(block) = block {
                    block.write(&mut writer);
                }
            }
        }
        Ok(writer.into_bytes())
    }

    /// Parses any lifecycle message. Blocks, snapshots and statements are
    /// verified while reading.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let kind = kind_of(data).ok_or(WireError::Truncated {
            offset: 0,
            needed: 1,
        })?;
        let mut reader = Reader::new(data);
        reader.expect_kind(kind)?;
        let message = match kind {
            BLOCK_HEADER => SwellMessage::Header(BlockHeader::read(&mut reader)?),
            BLOCK_ACTION => SwellMessage::Action {
                epoch: reader.read_u64()?,
                proposer: reader.read_token()?,
                data: reader.read_byte_array()?.to_vec(),
            },
            BLOCK_SEAL => SwellMessage::Seal {
                epoch: reader.read_u64()?,
                proposer: reader.read_token()?,
                seal: BlockSeal {
                    hash: reader.read_hash()?,
                    fees: reader.read_u64()?,
                    signature: reader.read_signature()?,
                },
            },
            BLOCK_COMMIT => SwellMessage::Commit {
                epoch: reader.read_u64()?,
                hash: reader.read_hash()?,
                commit: BlockCommit {
                    invalidated: reader.read_hashes()?,
                    fees: reader.read_u64()?,
                    publisher: reader.read_token()?,
                    signature: reader.read_signature()?,
                },
            },
            SEALED_BLOCK => SwellMessage::Sealed(SealedBlock::read(&mut reader)?),
            COMMITTED_BLOCK => SwellMessage::Committed(CommitBlock::read(&mut reader)?),
            SYNC_REQUEST => SwellMessage::SyncRequest {
                epoch: reader.read_u64()?,
                state: reader.read_bool()?,
            },
            SYNC_ERROR => SwellMessage::SyncError {
                epoch: reader.read_u64()?,
                code: reader.read_u8()?,
            },
            SYNC_READY => SwellMessage::SyncReady {
                epoch: reader.read_u64()?,
            },
            SYNC_STATE => SwellMessage::SyncState(Checksum::read(&mut reader)?),
            NAKED_CHECKSUM => SwellMessage::Naked(ChecksumStatement::read(&mut reader)?),
            DRESSED_CHECKSUM => SwellMessage::Dressed(ChecksumStatement::read(&mut reader)?),
            TOPOLOGY_REQUEST => SwellMessage::TopologyRequest {
                epoch: reader.read_u64()?,
            },
            TOPOLOGY_RESPONSE => SwellMessage::TopologyResponse {
                window: reader.read_u64()?,
                validators: read_validators(&mut reader)?,
            },
            BLOCK_REQUEST => SwellMessage::BlockRequest {
                epoch: reader.read_u64()?,
                hash: reader.read_hash()?,
            },
            BLOCK_RESPONSE => {
                let epoch = reader.read_u64()?;
                let hash = reader.read_hash()?;
                let block = if reader.read_bool()? {
                    Some(SealedBlock::read(&mut reader)?)
                } else {
                    None
                };
                SwellMessage::BlockResponse { epoch, hash, block }
            }
            other => return Err(WireError::UnknownKind(other)),
        };
        reader.finish()?;
        Ok(message)
    }
}

/// Whether `kind` is a lifecycle message.
pub fn is_swell_kind(kind: u8) -> bool {
    (BLOCK_HEADER..=BLOCK_RESPONSE).contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockBuilder, Chain, Wallet};

    fn sealed() -> (SealedBlock, KeyPair) {
        let leader = KeyPair::from_seed(&[1; 32]);
        let chain = Chain::genesis(Hash::of(b"net"), Wallet::default(), leader.clone());
        let header = chain.next_block(1).unwrap();
        let builder = BlockBuilder::new(header.clone(), chain.checkpoint_validator(&header).unwrap());
        (builder.seal(&leader).0, leader)
    }

    fn reserialized(message: &SwellMessage) -> SwellMessage {
        SwellMessage::parse(&message.serialize().unwrap()).unwrap()
    }

    #[test]
    fn test_block_stream_messages_parse_back() {
        let (block, leader) = sealed();
        let messages = vec![
            SwellMessage::Header(block.header.clone()),
            SwellMessage::Action {
                epoch: 1,
                proposer: leader.token(),
                data: vec![1, 2, 3],
            },
            SwellMessage::Seal {
                epoch: 1,
                proposer: leader.token(),
                seal: block.seal.clone(),
            },
            SwellMessage::Sealed(block.clone()),
            SwellMessage::BlockResponse {
                epoch: 1,
                hash: block.hash(),
                block: Some(block.clone()),
            },
            SwellMessage::BlockResponse {
                epoch: 1,
                hash: block.hash(),
                block: None,
            },
        ];
        for message in messages {
            assert_eq!(reserialized(&message), message);
        }
    }

    #[test]
    fn test_statements_are_verified() {
        let key = KeyPair::from_seed(&[4; 32]);
        let checksum = Hash::of(b"state");
        let dressed = ChecksumStatement::dressed(&key, 11, 15, checksum);
        assert_eq!(dressed.hash, dress(&key.token(), &checksum));

        let message = SwellMessage::Dressed(dressed);
        assert_eq!(reserialized(&message), message);

        // A dressed statement does not verify as naked.
        let mut bytes = message.serialize().unwrap();
        bytes[0] = NAKED_CHECKSUM;
        assert_eq!(SwellMessage::parse(&bytes), Err(WireError::InvalidSignature));
    }

    #[test]
    fn test_topology_and_sync_messages() {
        let key = KeyPair::from_seed(&[4; 32]);
        let messages = vec![
            SwellMessage::TopologyResponse {
                window: 21,
                validators: vec![Validator {
                    token: key.token(),
                    address: "127.0.0.1:7000".to_string(),
                    weight: 3,
                }],
            },
            SwellMessage::SyncRequest {
                epoch: 9,
                state: true,
            },
            SwellMessage::SyncError {
                epoch: 9,
                code: SYNC_TOO_OLD,
            },
        ];
        for message in messages {
            assert_eq!(reserialized(&message), message);
        }
        assert_eq!(SwellMessage::parse(&[99]), Err(WireError::UnknownKind(99)));
    }
}
