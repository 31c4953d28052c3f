use crate::chain::SealedBlock;
use crate::crypto::{Hash, Token};
use crate::network::Transport;
use crate::swell::messages::SwellMessage;
use crate::types::Epoch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pull settings for one finalized block the node does not hold.
#[derive(Clone, Debug)]
pub struct Retrieval {
    pub epoch: Epoch,
    pub hash: Hash,
    /// Peers believed to hold the block, asked in this order.
    pub holders: Vec<Token>,
    /// Delay between consecutive peers.
    pub stagger: Duration,
    pub timeout: Duration,
}

/// Asks each holder in turn, `stagger` apart, and keeps re-asking until a
/// block with the finalized hash arrives on `responses` or `timeout` runs out.
pub async fn retrieve(
    retrieval: Retrieval,
    transport: Arc<dyn Transport>,
    mut responses: mpsc::UnboundedReceiver<SealedBlock>,
    cancel: CancellationToken,
) -> Option<SealedBlock> {
    let Retrieval {
        epoch,
        hash,
        holders,
        stagger,
        timeout,
    } = retrieval;
    if holders.is_empty() {
        warn!(epoch, hash = %hash, "No peer to retrieve finalized block from");
        return None;
    }

    let request = match (SwellMessage::BlockRequest { epoch, hash }).serialize() {
        Ok(request) => request,
        Err(e) => {
            warn!(epoch, error = %e, "Cannot encode block request");
            return None;
        }
    };
    let cycle = stagger * holders.len() as u32;
    let tasks: Vec<JoinHandle<()>> = holders
        .iter()
        .enumerate()
        .map(|(i, holder)| {
            let transport = transport.clone();
            let request = request.clone();
            let holder = *holder;
            tokio::spawn(async move {
                tokio::time::sleep(stagger * i as u32).await;
                loop {
                    debug!(epoch, peer = %holder, "Requesting finalized block");
                    if transport.send(&holder, request.clone()).is_err() {
                        debug!(epoch, peer = %holder, "Block request failed");
                    }
                    tokio::time::sleep(cycle.max(Duration::from_millis(1))).await;
                }
            })
        })
        .collect();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let found = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            _ = &mut deadline => {
                warn!(epoch, hash = %hash, "Block retrieval timed out");
                break None;
            }
            response = responses.recv() => match response {
                Some(block) if block.epoch() == epoch && block.hash() == hash => {
                    info!(epoch, hash = %hash, "Retrieved finalized block");
                    break Some(block);
                }
                Some(block) => {
                    debug!(epoch, got = %block.hash(), "Ignoring mismatched block response");
                }
                None => break None,
            },
        }
    };

    for task in tasks {
        task.abort();
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockBuilder, Chain, Wallet};
    use crate::crypto::KeyPair;
    use crate::network::InMemoryNetwork;

    fn block(seed: u8) -> SealedBlock {
        let key = KeyPair::from_seed(&[seed; 32]);
        let chain = Chain::genesis(Hash::of(b"net"), Wallet::default(), key.clone());
        let header = chain.next_block(3).unwrap();
        let validator = chain.checkpoint_validator(&header).unwrap();
        BlockBuilder::new(header, validator).seal(&key).0
    }

    #[tokio::test]
    async fn test_staggered_requests_until_match() {
        let network = InMemoryNetwork::new();
        let me = network.join(KeyPair::from_seed(&[1; 32]).token());
        let silent = network.join(KeyPair::from_seed(&[2; 32]).token());
        let holder = network.join(KeyPair::from_seed(&[3; 32]).token());
        let mut silent_inbox = silent.subscribe();
        let mut holder_inbox = holder.subscribe();

        let wanted = block(9);
        let (tx, rx) = mpsc::unbounded_channel();
        let retrieval = Retrieval {
            epoch: 3,
            hash: wanted.hash(),
            holders: vec![silent.token(), holder.token()],
            stagger: Duration::from_millis(20),
            timeout: Duration::from_secs(2),
        };
        let task = tokio::spawn(retrieve(retrieval, me, rx, CancellationToken::new()));

        // The first peer is asked first.
        let first = silent_inbox.recv().await.unwrap();
        assert!(matches!(
            SwellMessage::parse(&first.data).unwrap(),
            SwellMessage::BlockRequest { epoch: 3, .. }
        ));
        holder_inbox.recv().await.unwrap();
        tx.send(block(8)).unwrap();
        tx.send(wanted.clone()).unwrap();
        assert_eq!(task.await.unwrap(), Some(wanted));
    }

    #[tokio::test]
    async fn test_gives_up_after_timeout() {
        let network = InMemoryNetwork::new();
        let me = network.join(KeyPair::from_seed(&[1; 32]).token());
        let peer = network.join(KeyPair::from_seed(&[2; 32]).token());
        let _inbox = peer.subscribe();
        let (_tx, rx) = mpsc::unbounded_channel();
        let retrieval = Retrieval {
            epoch: 3,
            hash: Hash::of(b"missing"),
            holders: vec![peer.token()],
            stagger: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(retrieve(retrieval, me, rx, CancellationToken::new()).await, None);
    }
}
