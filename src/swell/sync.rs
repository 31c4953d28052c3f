//! Catch-up protocol for nodes that fell behind.
//!
//! The requester names the last epoch it has and whether it wants the state
//! snapshot. The responder streams the snapshot, then every retained
//! committed block after that epoch, then its sealed blocks, and finally a
//! ready marker.

use crate::chain::{Chain, ChainError};
use crate::swell::messages::{SwellMessage, SYNC_TOO_OLD};
use crate::types::Epoch;
use tracing::{debug, warn};

/// Response stream for a sync request.
pub fn serve(chain: &Chain, epoch: Epoch, state: bool) -> Vec<SwellMessage> {
    let mut messages = Vec::new();
    let from = if state {
        messages.push(SwellMessage::SyncState(chain.checksum().clone()));
        chain.checksum().epoch
    } else {
        epoch
    };
    let Some(committed) = chain.committed_after(from) else {
        debug!(epoch, "Sync request predates retained blocks");
        return vec![SwellMessage::SyncError {
            epoch,
            code: SYNC_TOO_OLD,
        }];
    };
    messages.extend(committed.into_iter().map(SwellMessage::Committed));
    messages.extend(chain.sealed_blocks().into_iter().map(SwellMessage::Sealed));
    messages.push(SwellMessage::SyncReady {
        epoch: chain.last_commit_epoch(),
    });
    messages
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncProgress {
    Continue,
    /// Responder finished; its last commit was at this epoch.
    Ready(Epoch),
    Failed(u8),
}

/// Applies one message of a sync response.
pub fn apply(chain: &mut Chain, message: SwellMessage) -> Result<SyncProgress, ChainError> {
    match message {
        SwellMessage::SyncState(checksum) => {
            chain.restore(checksum);
        }
        SwellMessage::Committed(block) => {
            let epoch = block.epoch();
            let last = chain.last_commit_epoch();
            if epoch <= last {
                return Ok(SyncProgress::Continue);
            }
            if epoch > last + 1 {
                return Err(ChainError::MissingBlock { epoch: last + 1 });
            }
            // Sealed blocks ahead of it are finalized too, so committing them
            // greedily is safe.
            let expected_fees = block.commit.fees;
            chain.add_sealed_block(block.sealed)?;
            if let Some(committed) = chain.committed_block(epoch) {
                if committed.commit.fees != expected_fees {
                    warn!(
                        epoch,
                        local = committed.commit.fees,
                        remote = expected_fees,
                        "Commit fees diverge from peer"
                    );
                }
            }
        }
        SwellMessage::Sealed(block) => {
            if block.epoch() > chain.last_commit_epoch() && !chain.is_sealed(block.epoch()) {
                chain.add_sealed_block(block)?;
            }
        }
        SwellMessage::SyncReady { epoch } => return Ok(SyncProgress::Ready(epoch)),
        SwellMessage::SyncError { code, .. } => return Ok(SyncProgress::Failed(code)),
        _ => {}
    }
    Ok(SyncProgress::Continue)
}
