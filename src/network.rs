use crate::crypto::{Token, TOKEN_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest frame accepted from a TCP peer.
pub const MAX_FRAME: usize = 64 << 20;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("unknown peer {0}")]
    UnknownPeer(Token),
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound message with the sender's token.
///
/// `from` is only a routing hint; signed messages carry and verify their own
/// signer.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: Token,
    pub data: Vec<u8>,
}

/// Point-to-point byte transport between committee members.
pub trait Transport: Send + Sync {
    fn token(&self) -> Token;

    fn send(&self, to: &Token, data: Vec<u8>) -> Result<(), NetworkError>;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope>;

    /// Stops all connection tasks; pending reads return.
    fn shutdown(&self);

    /// Sends to every peer in `to` except ourselves, skipping unreachable ones.
    fn broadcast(&self, to: &[Token], data: &[u8]) {
        let me = self.token();
        for peer in to.iter().filter(|peer| **peer != me) {
            if let Err(e) = self.send(peer, data.to_vec()) {
                debug!(peer = %peer, error = %e, "Broadcast send failed");
            }
        }
    }
}

type Subscribers = Vec<mpsc::UnboundedSender<Envelope>>;

fn deliver(subscribers: &mut Subscribers, envelope: Envelope) -> bool {
    subscribers.retain(|s| s.send(envelope.clone()).is_ok());
    !subscribers.is_empty()
}

/// Shared in-process hub connecting nodes in tests and simulations.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    nodes: Arc<Mutex<HashMap<Token, Subscribers>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, token: Token) -> Arc<InMemoryTransport> {
        self.nodes.lock().entry(token).or_default();
        Arc::new(InMemoryTransport {
            token,
            network: self.clone(),
        })
    }

    /// Drops a node from the hub; messages to it fail until it rejoins.
    pub fn disconnect(&self, token: &Token) {
        self.nodes.lock().remove(token);
    }

    pub fn is_connected(&self, token: &Token) -> bool {
        self.nodes.lock().contains_key(token)
    }
}

pub struct InMemoryTransport {
    token: Token,
    network: InMemoryNetwork,
}

impl Transport for InMemoryTransport {
    fn token(&self) -> Token {
        self.token
    }

    fn send(&self, to: &Token, data: Vec<u8>) -> Result<(), NetworkError> {
        if !self.network.is_connected(&self.token) {
            return Err(NetworkError::Closed);
        }
        let mut nodes = self.network.nodes.lock();
        let subscribers = nodes.get_mut(to).ok_or(NetworkError::UnknownPeer(*to))?;
        let envelope = Envelope {
            from: self.token,
            data,
        };
        if deliver(subscribers, envelope) {
            Ok(())
        } else {
            Err(NetworkError::Closed)
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.nodes.lock().entry(self.token).or_default().push(tx);
        rx
    }

    fn shutdown(&self) {
        self.network.disconnect(&self.token);
    }
}

/// TCP transport for multi-process deployments.
///
/// Each connection starts with the sender's 32-byte token, followed by
/// frames of a 4-byte big-endian length prefix and the payload bytes.
/// Outbound connections are opened on first send and retried until the
/// peer is reachable.
pub struct TcpTransport {
    token: Token,
    local_addr: SocketAddr,
    peers: Mutex<HashMap<Token, String>>,
    writers: Arc<Mutex<HashMap<Token, mpsc::UnboundedSender<Vec<u8>>>>>,
    subscribers: Arc<Mutex<Subscribers>>,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Binds `listen_addr` and starts accepting peers.
    pub async fn bind(
        token: Token,
        listen_addr: &str,
        peers: HashMap<Token, String>,
    ) -> Result<Arc<Self>, NetworkError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let transport = Arc::new(Self {
            token,
            local_addr: listener.local_addr()?,
            peers: Mutex::new(peers),
            writers: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        });

        let subscribers = transport.subscribers.clone();
        let cancel = transport.cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((socket, _)) => {
                        tokio::spawn(read_loop(socket, subscribers.clone(), cancel.clone()));
                    }
                    Err(e) => {
                        debug!(error = %e, "Accept failed");
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn add_peer(&self, token: Token, address: String) {
        self.peers.lock().insert(token, address);
    }

    fn writer(&self, to: &Token) -> Result<mpsc::UnboundedSender<Vec<u8>>, NetworkError> {
        if let Some(writer) = self.writers.lock().get(to) {
            if !writer.is_closed() {
                return Ok(writer.clone());
            }
        }
        let address = self
            .peers
            .lock()
            .get(to)
            .cloned()
            .ok_or(NetworkError::UnknownPeer(*to))?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.writers.lock().insert(*to, tx.clone());
        tokio::spawn(write_loop(self.token, address, rx, self.cancel.clone()));
        Ok(tx)
    }
}

async fn read_loop(
    mut socket: TcpStream,
    subscribers: Arc<Mutex<Subscribers>>,
    cancel: CancellationToken,
) {
    let mut token = [0u8; TOKEN_SIZE];
    let hello = tokio::select! {
        _ = cancel.cancelled() => return,
        hello = socket.read_exact(&mut token) => hello,
    };
    if hello.is_err() {
        return;
    }
    let from = Token(token);
    let mut len_buf = [0u8; 4];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = socket.read_exact(&mut len_buf) => read,
        };
        if read.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME {
            warn!(peer = %from, len, "Oversized frame, closing connection");
            break;
        }
        let mut data = vec![0u8; len];
        if socket.read_exact(&mut data).await.is_err() {
            break;
        }
        deliver(&mut subscribers.lock(), Envelope { from, data });
    }
    let _ = socket.shutdown().await;
}

async fn write_loop(
    token: Token,
    address: String,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    'connect: loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            stream = TcpStream::connect(&address) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(_) => {
                // Retry periodically until the peer is up.
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        if stream.write_all(&token.0).await.is_err() {
            sleep(Duration::from_secs(1)).await;
            continue;
        }
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break 'connect,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break 'connect,
                },
            };
            let len = (message.len() as u32).to_le_bytes();
            if stream.write_all(&len).await.is_err() || stream.write_all(&message).await.is_err() {
                debug!(address = %address, "Write failed, reconnecting");
                continue 'connect;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn token(&self) -> Token {
        self.token
    }

    fn send(&self, to: &Token, data: Vec<u8>) -> Result<(), NetworkError> {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Closed);
        }
        self.writer(to)?.send(data).map_err(|_| NetworkError::Closed)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.writers.lock().clear();
    }
}
