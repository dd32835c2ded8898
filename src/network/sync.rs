// Peer synchronization: per-peer state, sync loops, the coordinator and broadcast

use crate::core::{Block, Transaction};
use crate::network::{Message, NetworkError, PeerConnection, TxStatus, VersionMessage};
use crate::node::{BlockOutcome, Node};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Connection state of a known peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Peer information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Listen address, `host:port`
    pub addr: String,
    pub state: PeerState,
    /// Consecutive failed interactions
    pub failures: u32,
    /// Height reported in the last handshake
    pub best_height: u64,
    pub user_agent: String,
}

impl PeerInfo {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            state: PeerState::Disconnected,
            failures: 0,
            best_height: 0,
            user_agent: String::new(),
        }
    }
}

/// Objects discovered from peers, consumed one at a time by the coordinator
#[derive(Debug)]
pub enum PeerEvent {
    Block {
        from: Option<String>,
        block: Block,
    },
    Transaction {
        from: Option<String>,
        tx: Transaction,
        reply: Option<oneshot::Sender<TxStatus>>,
    },
}

/// Known peers and their connection states
#[derive(Debug, Default)]
pub struct PeerManager {
    peers: RwLock<BTreeMap<String, PeerInfo>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer; false if it was already known
    pub async fn insert(&self, addr: &str) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(addr) {
            return false;
        }
        peers.insert(addr.to_string(), PeerInfo::new(addr.to_string()));
        true
    }

    pub async fn remove(&self, addr: &str) {
        self.peers.write().await.remove(addr);
    }

    pub async fn get(&self, addr: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(addr).cloned()
    }

    pub async fn list(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn addrs(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Disconnected peers move to Connecting; Connected ones stay
    pub async fn mark_connecting(&self, addr: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            if peer.state == PeerState::Disconnected {
                peer.state = PeerState::Connecting;
            }
        }
    }

    /// Record a completed handshake; true if the peer was not already Connected
    pub async fn mark_connected(&self, addr: &str, version: &VersionMessage) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(addr) else {
            return false;
        };
        let newly = peer.state != PeerState::Connected;
        peer.state = PeerState::Connected;
        peer.failures = 0;
        peer.best_height = version.best_height;
        peer.user_agent = version.user_agent.clone();
        newly
    }

    /// Record a failed interaction, returning the consecutive failure count
    pub async fn mark_failed(&self, addr: &str) -> u32 {
        let mut peers = self.peers.write().await;
        match peers.get_mut(addr) {
            Some(peer) => {
                peer.state = PeerState::Disconnected;
                peer.failures = peer.failures.saturating_add(1);
                peer.failures
            }
            None => 0,
        }
    }
}

/// Failed peers are retried after `sync_interval * 2^failures`, capped here
const MAX_BACKOFF_SHIFT: u32 = 4;

/// Wait before the next attempt on a peer with `failures` consecutive failures
pub fn retry_delay(interval: Duration, failures: u32) -> Duration {
    interval.saturating_mul(1 << failures.min(MAX_BACKOFF_SHIFT))
}

enum SyncStep {
    Continue,
    SelfConnection,
}

/// Start the periodic sync loop for one peer
pub fn spawn_peer_sync(node: Node, addr: String) -> JoinHandle<()> {
    tokio::spawn(run_peer_sync(node, addr))
}

async fn run_peer_sync(node: Node, addr: String) {
    let mut shutdown = node.shutdown_signal();
    let mut ticker = tokio::time::interval(node.config().sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // The first tick completes immediately
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match sync_once(&node, &addr).await {
            Ok(SyncStep::Continue) => {}
            Ok(SyncStep::SelfConnection) => {
                log::info!("Peer {} is this node, forgetting it", addr);
                node.peer_manager().remove(&addr).await;
                break;
            }
            Err(e) => {
                let failures = node.peer_manager().mark_failed(&addr).await;
                let delay = retry_delay(node.config().sync_interval, failures);
                log::warn!(
                    "Sync with {} failed ({} in a row), retrying in {:?}: {}",
                    addr,
                    failures,
                    delay,
                    e
                );
                ticker.reset_after(delay);
            }
        }
    }

    log::debug!("Sync loop for {} stopped", addr);
}

/// One interaction: handshake, announce our tip if newly connected, then
/// fetch the peer's latest block for reconciliation
async fn sync_once(node: &Node, addr: &str) -> Result<SyncStep, NetworkError> {
    let peers = node.peer_manager();
    peers.mark_connecting(addr).await;

    let (mut conn, theirs) =
        PeerConnection::open(addr, node.version_message().await, node.config().request_timeout).await?;
    if theirs.nonce == node.nonce() {
        return Ok(SyncStep::SelfConnection);
    }

    if peers.mark_connected(addr, &theirs).await {
        log::info!("Connected to peer {} (height {}, {})", addr, theirs.best_height, theirs.user_agent);
        conn.send(&Message::Block(node.latest_block().await)).await?;
    }

    let block = conn.get_latest().await?;
    node.queue_event(PeerEvent::Block {
        from: Some(addr.to_string()),
        block,
    })
    .await;

    Ok(SyncStep::Continue)
}

/// Apply peer events one at a time until shutdown
pub async fn run_coordinator(node: Node, mut events: mpsc::Receiver<PeerEvent>) {
    let mut shutdown = node.shutdown_signal();

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        match event {
            PeerEvent::Block { from, block } => {
                let index = block.header.index;
                let origin = from.as_deref().unwrap_or("unknown peer");
                match node.receive_latest_block(from.as_deref(), block).await {
                    Ok(BlockOutcome::Ignored) => {
                        log::debug!("Block {} from {} is not ahead of our tip", index, origin)
                    }
                    Ok(outcome) => log::debug!("Block {} from {}: {:?}", index, origin, outcome),
                    Err(e) => log::warn!("Rejected block {} from {}: {}", index, origin, e),
                }
            }
            PeerEvent::Transaction { from, tx, reply } => {
                let txid = tx.id;
                let status = match node.receive_transaction(from.as_deref(), tx).await {
                    Ok(true) => TxStatus::Accepted,
                    Ok(false) => TxStatus::AlreadyKnown,
                    Err(e) => {
                        log::warn!("Rejected transaction {}: {}", txid, e);
                        TxStatus::Rejected(e.to_string())
                    }
                };
                if let Some(reply) = reply {
                    // The requester may have gone away
                    let _ = reply.send(status);
                }
            }
        }
    }

    log::debug!("Sync coordinator stopped");
}

/// Send `message` to every known peer, each on its own task. A failed
/// send marks the peer Disconnected.
pub async fn broadcast(node: &Node, message: Message) {
    let addrs = node.peer_manager().addrs().await;
    if addrs.is_empty() {
        return;
    }
    log::debug!("Broadcasting {} to {} peers", message.message_type().as_str(), addrs.len());

    let version = node.version_message().await;
    for addr in addrs {
        let node = node.clone();
        let message = message.clone();
        let version = version.clone();

        tokio::spawn(async move {
            let timeout = node.config().request_timeout;
            let result = async {
                let (mut conn, _) = PeerConnection::open(&addr, version, timeout).await?;
                conn.send(&message).await
            }
            .await;

            if let Err(e) = result {
                let failures = node.peer_manager().mark_failed(&addr).await;
                log::warn!("Broadcast to {} failed ({} in a row): {}", addr, failures, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_state_machine() {
        let peers = PeerManager::new();
        assert!(peers.insert("127.0.0.1:9000").await);
        assert!(!peers.insert("127.0.0.1:9000").await);

        let peer = peers.get("127.0.0.1:9000").await.unwrap();
        assert_eq!(peer.state, PeerState::Disconnected);

        peers.mark_connecting("127.0.0.1:9000").await;
        assert_eq!(peers.get("127.0.0.1:9000").await.unwrap().state, PeerState::Connecting);

        let version = VersionMessage::new(1, 7, String::new());
        assert!(peers.mark_connected("127.0.0.1:9000", &version).await);
        assert!(!peers.mark_connected("127.0.0.1:9000", &version).await);

        // Connected peers stay Connected while a new interaction starts
        peers.mark_connecting("127.0.0.1:9000").await;
        let peer = peers.get("127.0.0.1:9000").await.unwrap();
        assert_eq!(peer.state, PeerState::Connected);
        assert_eq!(peer.best_height, 7);

        assert_eq!(peers.mark_failed("127.0.0.1:9000").await, 1);
        assert_eq!(peers.mark_failed("127.0.0.1:9000").await, 2);
        assert_eq!(peers.get("127.0.0.1:9000").await.unwrap().state, PeerState::Disconnected);

        // A later success announces again and resets the count
        assert!(peers.mark_connected("127.0.0.1:9000", &version).await);
        assert_eq!(peers.get("127.0.0.1:9000").await.unwrap().failures, 0);
    }

    #[test]
    fn test_retry_delay_backs_off() {
        let interval = Duration::from_secs(5);
        assert_eq!(retry_delay(interval, 0), interval);
        assert_eq!(retry_delay(interval, 1), Duration::from_secs(10));
        assert_eq!(retry_delay(interval, 3), Duration::from_secs(40));
        assert_eq!(retry_delay(interval, 4), Duration::from_secs(80));
        assert_eq!(retry_delay(interval, 50), Duration::from_secs(80));
    }
}
