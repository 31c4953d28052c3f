//! Block streaming: the proposer broadcasts its header, every action it
//! accepts, and finally its seal; listeners replay the same sequence into a
//! builder of their own and end up with the identical sealed block.

use crate::chain::{
    BlockBuilder, BlockHeader, BlockSeal, Chain, ChainError, MutatingState, Mutations, SealedBlock,
};
use crate::crypto::{KeyPair, Token};
use crate::mempool::Mempool;
use crate::swell::messages::SwellMessage;
use crate::types::{ActionBytes, Epoch};
use crate::wire::WireError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("block stream for epoch {0} ended before its seal")]
    Closed(Epoch),
    #[error("block stream cancelled")]
    Cancelled,
}

/// One element of a proposer's stream, as routed to a listener.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Header(BlockHeader),
    Action(ActionBytes),
    Seal(BlockSeal),
}

/// A sealed block with the mutations its builder computed.
#[derive(Clone, Debug)]
pub struct BuiltBlock {
    pub block: SealedBlock,
    pub mutations: Mutations,
}

pub struct BuildParams {
    pub epoch: Epoch,
    /// Actions are accepted until this instant; the block is then sealed.
    pub deadline: Instant,
    pub max_actions: usize,
}

fn send(outbound: &mpsc::UnboundedSender<Vec<u8>>, message: &SwellMessage) -> Result<(), StreamError> {
    // The window may already be gone; the block is still returned.
    let _ = outbound.send(message.serialize()?);
    Ok(())
}

/// Builds, streams and seals this node's block for `params.epoch`.
pub async fn build(
    chain: Arc<Mutex<Chain>>,
    credentials: Arc<KeyPair>,
    mempool: Arc<Mempool>,
    params: BuildParams,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<BuiltBlock, StreamError> {
    let BuildParams {
        epoch,
        deadline,
        max_actions,
    } = params;
    let mut builder = {
        let chain = chain.lock();
        let mut header = chain.next_block(epoch)?;
        header.proposer = credentials.token();
        let validator = chain.checkpoint_validator(&header)?;
        BlockBuilder::new(header, validator)
    };
    send(&outbound, &SwellMessage::Header(builder.header().clone()))?;
    let proposer = credentials.token();

    'fill: loop {
        while builder.len() < max_actions {
            let Some(data) = mempool.pop(epoch) else {
                break;
            };
            if builder.push(&data).is_some() {
                send(
                    &outbound,
                    &SwellMessage::Action {
                        epoch,
                        proposer,
                        data,
                    },
                )?;
            }
        }
        if builder.len() >= max_actions || Instant::now() >= deadline {
            break 'fill;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => break 'fill,
            _ = mempool.notified() => {}
        }
    }

    let actions = builder.len();
    let (block, mutations) = builder.seal(&credentials);
    send(
        &outbound,
        &SwellMessage::Seal {
            epoch,
            proposer,
            seal: block.seal.clone(),
        },
    )?;
    info!(epoch, hash = %block.hash(), actions, "Block sealed");
    Ok(BuiltBlock { block, mutations })
}

/// Validation context for a streamed header. When the checkpoint cannot be
/// reconstructed locally the commit state is used instead; commit
/// re-validation settles the difference.
fn listener_validator(chain: &Chain, header: &BlockHeader) -> MutatingState {
    chain.checkpoint_validator(header).unwrap_or_else(|err| {
        debug!(epoch = header.epoch, error = %err, "Replaying stream against the commit state");
        MutatingState::new(
            chain.commit_state(),
            Arc::default(),
            Mutations::new(),
            header.epoch,
        )
    })
}

/// Replays `proposer`'s stream for `epoch` and returns the sealed block.
pub async fn listen(
    chain: Arc<Mutex<Chain>>,
    epoch: Epoch,
    proposer: Token,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
) -> Result<BuiltBlock, StreamError> {
    let mut early: Vec<ActionBytes> = Vec::new();
    let mut builder: Option<BlockBuilder> = None;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            event = events.recv() => event.ok_or(StreamError::Closed(epoch))?,
        };
        match event {
            StreamEvent::Header(header) => {
                if builder.is_some() {
                    debug!(epoch, proposer = %proposer, "Duplicate header in stream");
                    continue;
                }
                if header.epoch != epoch || header.proposer != proposer {
                    debug!(epoch, "Ignoring header for another stream");
                    continue;
                }
                let validator = listener_validator(&chain.lock(), &header);
                let mut replay = BlockBuilder::new(header, validator);
                for data in early.drain(..) {
                    replay.replay(&data);
                }
                builder = Some(replay);
            }
            StreamEvent::Action(data) => match builder.as_mut() {
                Some(replay) => replay.replay(&data),
                None => early.push(data),
            },
            StreamEvent::Seal(seal) => {
                let Some(replay) = builder.take() else {
                    debug!(epoch, proposer = %proposer, "Seal before header");
                    continue;
                };
                let (block, mutations) = replay.accept_seal(seal)?;
                debug!(epoch, proposer = %proposer, hash = %block.hash(), "Replayed streamed block");
                return Ok(BuiltBlock { block, mutations });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Action, Wallet};
    use crate::crypto::Hash;
    use std::time::Duration;

    fn chain(credentials: &KeyPair, funded: &KeyPair) -> Arc<Mutex<Chain>> {
        Arc::new(Mutex::new(Chain::genesis(
            Hash::of(b"stream-net"),
            Wallet::new(vec![(funded.token(), 1_000)]),
            credentials.clone(),
        )))
    }

    fn to_event(data: &[u8]) -> StreamEvent {
        match SwellMessage::parse(data).unwrap() {
            SwellMessage::Header(header) => StreamEvent::Header(header),
            SwellMessage::Action { data, .. } => StreamEvent::Action(data),
            SwellMessage::Seal { seal, .. } => StreamEvent::Seal(seal),
            other => panic!("unexpected stream message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_listener_reproduces_leader_block() {
        let leader = Arc::new(KeyPair::from_seed(&[1; 32]));
        let follower = KeyPair::from_seed(&[2; 32]);
        let alice = KeyPair::from_seed(&[3; 32]);
        let mempool = Arc::new(Mempool::new(16));
        mempool
            .submit_action(&Action::transfer(&alice, 1, follower.token(), 10, 1, "a"))
            .unwrap();
        mempool
            .submit_action(&Action::transfer(&alice, 1, follower.token(), 20, 1, "b"))
            .unwrap();

        let (outbound, mut stream) = mpsc::unbounded_channel();
        let params = BuildParams {
            epoch: 1,
            deadline: Instant::now() + Duration::from_millis(30),
            max_actions: 100,
        };
        let built = build(
            chain(&leader, &alice),
            leader.clone(),
            mempool,
            params,
            outbound,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(built.block.actions.len(), 2);

        let (events, rx) = mpsc::unbounded_channel();
        while let Ok(data) = stream.try_recv() {
            events.send(to_event(&data)).unwrap();
        }
        let replayed = listen(
            chain(&follower, &alice),
            1,
            leader.token(),
            rx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(replayed.block, built.block);
        assert_eq!(replayed.mutations, built.mutations);
    }

    #[tokio::test]
    async fn test_build_stops_at_action_limit() {
        let leader = Arc::new(KeyPair::from_seed(&[1; 32]));
        let alice = KeyPair::from_seed(&[3; 32]);
        let mempool = Arc::new(Mempool::new(16));
        for i in 0..5 {
            mempool
                .submit_action(&Action::transfer(&alice, 1, leader.token(), i + 1, 0, ""))
                .unwrap();
        }
        let (outbound, _stream) = mpsc::unbounded_channel();
        let params = BuildParams {
            epoch: 1,
            deadline: Instant::now() + Duration::from_secs(60),
            max_actions: 3,
        };
        let built = build(
            chain(&leader, &alice),
            leader,
            mempool.clone(),
            params,
            outbound,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(built.block.actions.len(), 3);
        assert_eq!(mempool.len(), 2);
    }

    #[tokio::test]
    async fn test_listener_rejects_altered_stream() {
        let leader = Arc::new(KeyPair::from_seed(&[1; 32]));
        let alice = KeyPair::from_seed(&[3; 32]);
        let (outbound, mut stream) = mpsc::unbounded_channel();
        let params = BuildParams {
            epoch: 1,
            deadline: Instant::now(),
            max_actions: 10,
        };
        let built = build(
            chain(&leader, &alice),
            leader.clone(),
            Arc::new(Mempool::new(1)),
            params,
            outbound,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (events, rx) = mpsc::unbounded_channel();
        let header = to_event(&stream.try_recv().unwrap());
        events.send(header).unwrap();
        events.send(StreamEvent::Action(b"injected".to_vec())).unwrap();
        events.send(StreamEvent::Seal(built.block.seal.clone())).unwrap();
        let result = listen(chain(&alice, &alice), 1, leader.token(), rx, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(StreamError::Chain(ChainError::SealMismatch { epoch: 1 }))
        ));
    }
}
