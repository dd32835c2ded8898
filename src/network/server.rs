// Listener for inbound peer connections

use crate::network::{Message, NetworkError, PeerConnection, PeerEvent};
use crate::node::Node;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Accept connections until shutdown
pub async fn serve(node: Node, listener: TcpListener) {
    let mut shutdown = node.shutdown_signal();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("New connection from {}", addr);
                    let node = node.clone();

                    // Handle peer in separate task
                    tokio::spawn(async move {
                        if let Err(e) = handle_peer(node, stream, addr).await {
                            log::debug!("Connection from {} closed: {}", addr, e);
                        }
                    });
                }
                Err(e) => log::error!("Failed to accept connection: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }

    log::info!("Listener stopped");
}

/// Handle a peer connection
async fn handle_peer(node: Node, stream: TcpStream, addr: SocketAddr) -> Result<(), NetworkError> {
    let mut conn = PeerConnection::from_stream(stream, addr, node.config().request_timeout);

    let theirs = conn.handshake(node.version_message().await).await?;
    if theirs.nonce == node.nonce() {
        log::debug!("Dropping connection to self");
        return Ok(());
    }

    // Peers that listen become our peers too
    let from = dialable_addr(&theirs.listen_addr, addr);
    if let Some(peer) = &from {
        node.add_peer(peer).await;
    }

    // Message loop
    loop {
        let message = match conn.receive().await {
            Ok(message) => message,
            Err(NetworkError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        match message {
            Message::Ping(nonce) => conn.send(&Message::Pong(nonce)).await?,
            Message::GetLatest => conn.send(&Message::Block(node.latest_block().await)).await?,
            Message::GetChain { from } => conn.send(&Message::Chain(node.chain_segment(from).await)).await?,
            Message::GetUtxos(address) => {
                conn.send(&Message::Utxos(node.unspent_outputs(&address).await)).await?
            }
            Message::Block(block) => {
                node.queue_event(PeerEvent::Block {
                    from: from.clone(),
                    block,
                })
                .await
            }
            Message::Tx(tx) => {
                let txid = tx.id;
                let status = node.relay_transaction(from.clone(), tx).await;
                conn.send(&Message::TxStatus { txid, status }).await?
            }
            other => {
                return Err(NetworkError::Protocol(format!(
                    "Unexpected {} from {}",
                    other.message_type().as_str(),
                    addr
                )));
            }
        }
    }
}

/// Where a peer can be reached: its advertised listen address, with an
/// unspecified IP (`0.0.0.0`, `::`) replaced by the one it connected from
fn dialable_addr(advertised: &str, remote: SocketAddr) -> Option<String> {
    if advertised.is_empty() {
        return None;
    }
    match advertised.parse::<SocketAddr>() {
        Ok(listen) if listen.ip().is_unspecified() => {
            Some(SocketAddr::new(remote.ip(), listen.port()).to_string())
        }
        _ => Some(advertised.to_string()),
    }
}
