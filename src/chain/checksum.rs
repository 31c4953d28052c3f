use crate::chain::state::{Mutations, Wallet};
use crate::chain::{Chain, ChainError};
use crate::crypto::Hash;
use crate::types::Epoch;
use crate::wire::{Reader, WireError, Writer};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// State snapshot anchoring recovery, rollback and the next committee seed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    pub epoch: Epoch,
    pub state: Arc<Wallet>,
    pub last_block_hash: Hash,
    pub hash: Hash,
}

impl Checksum {
    pub fn compute(epoch: Epoch, state: Arc<Wallet>, last_block_hash: Hash) -> Self {
        let hash = Self::digest(epoch, &state, &last_block_hash);
        Self {
            epoch,
            state,
            last_block_hash,
            hash,
        }
    }

    fn digest(epoch: Epoch, state: &Wallet, last_block_hash: &Hash) -> Hash {
        Hash::of_parts(&[
            &epoch.to_le_bytes(),
            &last_block_hash.0,
            &state.hash().0,
        ])
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u64(self.epoch);
        writer.put_hash(&self.last_block_hash);
        writer.put_hash(&self.hash);
        writer.put_byte_array(&self.state.to_bytes());
    }

    /// Reads a snapshot and checks its hash against the content.
    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let epoch = reader.read_u64()?;
        let last_block_hash = reader.read_hash()?;
        let hash = reader.read_hash()?;
        let state =
            Wallet::from_bytes(reader.read_byte_array()?).ok_or(WireError::Invalid("state"))?;
        if Self::digest(epoch, &state, &last_block_hash) != hash {
            return Err(WireError::Invalid("checksum hash"));
        }
        Ok(Self {
            epoch,
            state: Arc::new(state),
            last_block_hash,
            hash,
        })
    }
}

/// Snapshot taken under the chain lock, to be hashed outside it.
#[derive(Clone, Debug)]
pub struct ChecksumJob {
    pub epoch: Epoch,
    pub base: Arc<Wallet>,
    pub mutations: Mutations,
    pub last_block_hash: Hash,
}

impl ChecksumJob {
    pub fn compute(self) -> Checksum {
        let state = if self.mutations.is_empty() && !self.base.stale_at(self.epoch) {
            self.base
        } else {
            let mut state = (*self.base).clone();
            state.apply(&self.mutations);
            state.retire(self.epoch);
            Arc::new(state)
        };
        Checksum::compute(self.epoch, state, self.last_block_hash)
    }
}

/// Snapshots the state at `epoch` under the chain lock, hashes it on a
/// blocking thread, and installs the result as the new checksum.
pub async fn clone_checksum(chain: Arc<Mutex<Chain>>, epoch: Epoch) -> Result<Checksum, ChainError> {
    let job = chain.lock().begin_checksum(epoch)?;
    let computed = tokio::task::spawn_blocking(move || job.compute()).await;
    let checksum = match computed {
        Ok(checksum) => checksum,
        Err(_) => {
            chain.lock().abort_checksum();
            return Err(ChainError::ChecksumAborted { epoch });
        }
    };
    chain.lock().finish_checksum(checksum.clone())?;
    debug!(epoch, hash = %checksum.hash, "Checksum installed");
    Ok(checksum)
}
