// Peer-to-peer networking: wire messages, connections, sync and the listener

pub mod message;
mod peer;
pub mod server;
pub mod sync;

pub use message::{Message, MessageType, TxStatus, VersionMessage};
pub use peer::PeerConnection;
pub use sync::{PeerEvent, PeerInfo, PeerManager, PeerState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Peer {addr} unreachable: {source}")]
    PeerUnreachable { addr: String, source: std::io::Error },
    #[error("Timed out {0}")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
