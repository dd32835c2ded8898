// Peer connection: framing, handshake and request helpers

use crate::core::{Address, Block, Transaction, UnspentOutput};
use crate::network::message::HEADER_SIZE;
use crate::network::{Message, NetworkError, TxStatus, VersionMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// One short-lived connection to a peer. Every read and write is bounded
/// by the connection's timeout.
pub struct PeerConnection {
    addr: String,
    stream: TcpStream,
    timeout: Duration,
}

impl PeerConnection {
    /// Connect to a peer
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(NetworkError::PeerUnreachable {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => return Err(NetworkError::Timeout(format!("connecting to {}", addr))),
        };

        Ok(Self {
            addr: addr.to_string(),
            stream,
            timeout,
        })
    }

    /// Connect and complete the handshake, returning the peer's version
    pub async fn open(
        addr: &str,
        ours: VersionMessage,
        timeout: Duration,
    ) -> Result<(Self, VersionMessage), NetworkError> {
        let mut conn = Self::connect(addr, timeout).await?;
        let theirs = conn.handshake(ours).await?;
        Ok((conn, theirs))
    }

    /// Wrap an accepted connection
    pub fn from_stream(stream: TcpStream, addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr: addr.to_string(),
            stream,
            timeout,
        }
    }

    /// Get peer address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a message to the peer
    pub async fn send(&mut self, message: &Message) -> Result<(), NetworkError> {
        let data = message.serialize().map_err(NetworkError::Protocol)?;
        let what = format!("sending {} to {}", message.message_type().as_str(), self.addr);
        let timeout = self.timeout;
        let stream = &mut self.stream;

        with_timeout(timeout, what, async {
            stream.write_all(&data).await?;
            stream.flush().await
        })
        .await
    }

    /// Receive a message from the peer
    pub async fn receive(&mut self) -> Result<Message, NetworkError> {
        let what = format!("reading from {}", self.addr);
        let timeout = self.timeout;
        let stream = &mut self.stream;

        // Header: 12 bytes command + 4 bytes payload length
        let mut header = [0u8; HEADER_SIZE];
        with_timeout(timeout, what.clone(), stream.read_exact(&mut header)).await?;

        let (msg_type, payload_len) = Message::parse_header(&header).map_err(NetworkError::Protocol)?;

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            with_timeout(timeout, what, stream.read_exact(&mut payload)).await?;
        }

        let message = Message::decode_payload(msg_type, &payload).map_err(NetworkError::Protocol)?;
        log::debug!("Received {} from {}", msg_type.as_str(), self.addr);
        Ok(message)
    }

    /// Exchange version and verack messages. Both sides run the same steps.
    pub async fn handshake(&mut self, ours: VersionMessage) -> Result<VersionMessage, NetworkError> {
        self.send(&Message::Version(ours)).await?;

        let theirs = match self.receive().await? {
            Message::Version(v) => v,
            other => return Err(unexpected("version", &other)),
        };

        self.send(&Message::Verack).await?;
        match self.receive().await? {
            Message::Verack => Ok(theirs),
            other => Err(unexpected("verack", &other)),
        }
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, message: &Message) -> Result<Message, NetworkError> {
        self.send(message).await?;
        self.receive().await
    }

    pub async fn ping(&mut self) -> Result<(), NetworkError> {
        let nonce = rand::random();
        match self.request(&Message::Ping(nonce)).await? {
            Message::Pong(n) if n == nonce => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Ask for the peer's latest block
    pub async fn get_latest(&mut self) -> Result<Block, NetworkError> {
        match self.request(&Message::GetLatest).await? {
            Message::Block(block) => Ok(block),
            other => Err(unexpected("block", &other)),
        }
    }

    /// Fetch the peer's full chain one segment at a time, until the peer
    /// answers with an empty segment
    pub async fn get_chain(&mut self) -> Result<Vec<Block>, NetworkError> {
        let mut chain: Vec<Block> = Vec::new();
        loop {
            let from = chain.len() as u64;
            let segment = match self.request(&Message::GetChain { from }).await? {
                Message::Chain(blocks) => blocks,
                other => return Err(unexpected("chain", &other)),
            };

            let Some(first) = segment.first() else {
                return Ok(chain);
            };
            if first.index() != from {
                return Err(NetworkError::Protocol(format!(
                    "Chain segment from {} starts at block {}",
                    from,
                    first.index()
                )));
            }
            chain.extend(segment);
        }
    }

    /// Submit a transaction and wait for the peer's verdict
    pub async fn submit_transaction(&mut self, tx: &Transaction) -> Result<TxStatus, NetworkError> {
        match self.request(&Message::Tx(tx.clone())).await? {
            Message::TxStatus { txid, status } if txid == tx.id => Ok(status),
            other => Err(unexpected("txstatus", &other)),
        }
    }

    /// Ask for the unspent outputs paying `address`
    pub async fn get_utxos(&mut self, address: &Address) -> Result<Vec<UnspentOutput>, NetworkError> {
        match self.request(&Message::GetUtxos(*address)).await? {
            Message::Utxos(utxos) => Ok(utxos),
            other => Err(unexpected("utxos", &other)),
        }
    }
}

async fn with_timeout<T, F>(timeout: Duration, what: String, fut: F) -> Result<T, NetworkError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NetworkError::Timeout(what)),
    }
}

fn unexpected(expected: &str, got: &Message) -> NetworkError {
    NetworkError::Protocol(format!("Expected {}, got {}", expected, got.message_type().as_str()))
}
