use crate::chain::action::{Action, Entry};
use crate::crypto::Hash;
use crate::types::Epoch;
use crate::wire::WireError;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("mempool full ({0} entries)")]
    Full(usize),
    #[error("entry {0} already queued")]
    Duplicate(Hash),
    #[error("invalid entry: {0}")]
    Invalid(#[from] WireError),
}

struct Queued {
    hash: Hash,
    expires: Epoch,
    data: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Queued>,
    hashes: HashSet<Hash>,
}

/// Bounded FIFO of signed block entries waiting for a block: transfers,
/// candidacies and equivocation evidence.
///
/// Only signature-checked entries are admitted; balance and duplicate checks
/// against the ledger happen when the leader pushes them into its block.
pub struct Mempool {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn submit(&self, data: Vec<u8>) -> Result<Hash, MempoolError> {
        let entry = Entry::parse(&data)?;
        let hash = Hash::of(&data);
        {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= self.capacity {
                return Err(MempoolError::Full(self.capacity));
            }
            if !inner.hashes.insert(hash) {
                return Err(MempoolError::Duplicate(hash));
            }
            inner.queue.push_back(Queued {
                hash,
                expires: entry.expires(),
                data,
            });
        }
        self.notify.notify_one();
        Ok(hash)
    }

    pub fn submit_action(&self, action: &Action) -> Result<Hash, MempoolError> {
        self.submit(action.serialize())
    }

    /// Next entry not yet expired at `epoch`; expired ones are discarded.
    pub fn pop(&self, epoch: Epoch) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        while let Some(queued) = inner.queue.pop_front() {
            inner.hashes.remove(&queued.hash);
            if epoch < queued.expires {
                return Some(queued.data);
            }
        }
        None
    }

    /// Waits until an entry is submitted.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
