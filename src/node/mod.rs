// Node - shared ledger state, peer protocol wiring and the operation surface

mod config;
mod miner;

pub use config::NodeConfig;
pub use miner::MiningError;

use crate::consensus::TransactionError;
use crate::core::{Address, Amount, Block, Hash256, Serializable, Transaction, UnspentOutput};
use crate::ledger::{ChainReplaceRejected, Ledger, LedgerError, ReplaceOutcome};
use crate::network::message::{CHAIN_SEGMENT_BLOCKS, CHAIN_SEGMENT_BYTES};
use crate::network::sync::{self, PeerEvent};
use crate::network::{Message, NetworkError, PeerConnection, PeerInfo, PeerManager, TxStatus, VersionMessage};
use crate::storage::{Storage, StorageError};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Capacity of the peer event queue
const EVENT_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Unknown {0}")]
    UnknownEntity(String),
    #[error("Transaction rejected: {0}")]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Chain replacement rejected: {0}")]
    ChainReplaceRejected(#[from] ChainReplaceRejected),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Mining(#[from] MiningError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Node already started")]
    AlreadyStarted,
}

/// Block lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Index(u64),
    Hash(Hash256),
}

impl FromStr for BlockId {
    type Err = String;

    /// 64 hex characters name a hash; anything else must be an index
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 {
            return Hash256::from_hex(s).map(BlockId::Hash);
        }
        s.parse::<u64>()
            .map(BlockId::Index)
            .map_err(|_| format!("Invalid block id '{}': expected an index or a 64-character hash", s))
    }
}

/// What reconciliation did with a peer's latest block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Not ahead of our tip
    Ignored,
    /// Extended our tip directly
    Appended,
    /// The peer's full chain replaced ours
    Replaced(ReplaceOutcome),
}

/// Network node
///
/// Cheap to clone; clones share the same ledger and peer set. The ledger
/// sits behind a single `RwLock`: appends, replacements and pool changes
/// take the write lock, queries the read lock.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    ledger: RwLock<Ledger>,
    tip_version: Arc<AtomicU64>,
    peers: PeerManager,
    events: mpsc::Sender<PeerEvent>,
    event_receiver: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    shutdown: watch::Sender<bool>,
    /// Random per-process value carried in `version`, detects self-connections
    nonce: u64,
    listen_addr: OnceLock<String>,
}

impl Node {
    /// Open the node's databases under `config.data_dir`
    pub fn open(config: NodeConfig) -> Result<Self, NodeError> {
        let storage = Storage::new(&config.data_dir)?;
        Self::with_storage(storage, config)
    }

    pub fn with_storage(storage: Storage, config: NodeConfig) -> Result<Self, NodeError> {
        let ledger = Ledger::open(storage, config.params.clone())?;
        let tip_version = ledger.tip_version();
        let (events, event_receiver) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                ledger: RwLock::new(ledger),
                tip_version,
                peers: PeerManager::new(),
                events,
                event_receiver: Mutex::new(Some(event_receiver)),
                shutdown,
                nonce: rand::random(),
                listen_addr: OnceLock::new(),
            }),
        })
    }

    /// Bind the listener, start the sync coordinator and a sync loop per
    /// configured peer, and the miner when `mine_to` is set
    pub async fn start(&self) -> Result<NodeHandle, NodeError> {
        let events = self.inner.event_receiver.lock().await.take().ok_or(NodeError::AlreadyStarted)?;
        let mut tasks = Vec::new();

        let mut local_addr = None;
        if let Some(listen) = &self.inner.config.listen {
            let listener = TcpListener::bind(listen).await?;
            let addr = listener.local_addr()?;
            // Only the first start can reach here
            let _ = self.inner.listen_addr.set(addr.to_string());
            log::info!("Listening on {}", addr);
            local_addr = Some(addr);
            tasks.push(tokio::spawn(crate::network::server::serve(self.clone(), listener)));
        }

        tasks.push(tokio::spawn(sync::run_coordinator(self.clone(), events)));

        for peer in &self.inner.config.peers {
            self.add_peer(peer).await;
        }

        if let Some(address) = self.inner.config.mine_to {
            tasks.push(self.spawn_miner(address));
        }

        Ok(NodeHandle {
            node: self.clone(),
            local_addr,
            tasks,
        })
    }

    /// Signal every node task to stop
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn nonce(&self) -> u64 {
        self.inner.nonce
    }

    /// Bound listen address, empty until started with `listen` set
    pub fn listen_addr(&self) -> String {
        self.inner.listen_addr.get().cloned().unwrap_or_default()
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.inner.peers
    }

    pub async fn version_message(&self) -> VersionMessage {
        let height = self.inner.ledger.read().await.height();
        VersionMessage::new(self.inner.nonce, height, self.listen_addr())
    }

    /// Admit a transaction to the pool and broadcast it
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, NodeError> {
        let txid = tx.id;
        self.inner.ledger.write().await.submit_transaction(tx.clone())?;
        log::info!("Accepted transaction {}", txid);
        self.broadcast(Message::Tx(tx)).await;
        Ok(txid)
    }

    pub async fn balance(&self, address: &Address) -> Amount {
        self.inner.ledger.read().await.balance_of(address)
    }

    pub async fn unspent_outputs(&self, address: &Address) -> Vec<UnspentOutput> {
        self.inner
            .ledger
            .read()
            .await
            .unspent_outputs(address)
            .into_iter()
            .map(|(outpoint, utxo)| UnspentOutput {
                txid: outpoint.txid,
                output_index: outpoint.index,
                amount: utxo.output.amount,
            })
            .collect()
    }

    pub async fn blocks(&self) -> Vec<Block> {
        self.inner.ledger.read().await.blocks().to_vec()
    }

    /// The canonical chain from genesis
    pub async fn full_chain(&self) -> Vec<Block> {
        self.blocks().await
    }

    /// Blocks from index `from` onwards, as many as one `chain` reply
    /// carries. Always holds at least one block when `from` is within the
    /// chain, and none past the tip.
    pub async fn chain_segment(&self, from: u64) -> Vec<Block> {
        let ledger = self.inner.ledger.read().await;
        let start = usize::try_from(from).unwrap_or(usize::MAX);

        let mut segment = Vec::new();
        let mut size = 0;
        for block in ledger.blocks().iter().skip(start).take(CHAIN_SEGMENT_BLOCKS) {
            size += block.serialize().len();
            if size > CHAIN_SEGMENT_BYTES && !segment.is_empty() {
                break;
            }
            segment.push(block.clone());
        }
        segment
    }

    pub async fn block(&self, id: BlockId) -> Result<Block, NodeError> {
        let ledger = self.inner.ledger.read().await;
        let block = match id {
            BlockId::Index(index) => ledger.block_by_index(index),
            BlockId::Hash(hash) => ledger.block_by_hash(&hash),
        };
        block.cloned().ok_or_else(|| NodeError::UnknownEntity(format!("block {:?}", id)))
    }

    pub async fn latest_block(&self) -> Block {
        self.inner.ledger.read().await.latest_block().clone()
    }

    pub async fn height(&self) -> u64 {
        self.inner.ledger.read().await.height()
    }

    /// `None` while unconfirmed or unknown
    pub async fn confirmations(&self, txid: &Hash256) -> Option<u64> {
        self.inner.ledger.read().await.confirmations(txid)
    }

    /// A confirmed or pooled transaction and its confirmations
    pub async fn transaction(&self, txid: &Hash256) -> Result<(Transaction, Option<u64>), NodeError> {
        self.inner
            .ledger
            .read()
            .await
            .transaction(txid)
            .map(|(tx, confirmations)| (tx.clone(), confirmations))
            .ok_or_else(|| NodeError::UnknownEntity(format!("transaction {}", txid)))
    }

    pub async fn pending_transactions(&self) -> Vec<Transaction> {
        self.inner.ledger.read().await.pool().transactions().cloned().collect()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.list().await
    }

    /// Start syncing with a peer; false if it is already known or is us
    pub async fn add_peer(&self, addr: &str) -> bool {
        let addr = addr.trim();
        if addr.is_empty() || self.inner.listen_addr.get().is_some_and(|own| own == addr) {
            return false;
        }
        if !self.inner.peers.insert(addr).await {
            return false;
        }

        log::info!("Added peer {}", addr);
        sync::spawn_peer_sync(self.clone(), addr.to_string());
        true
    }

    /// Reconcile a peer's latest block with our chain
    pub async fn receive_latest_block(&self, peer: Option<&str>, block: Block) -> Result<BlockOutcome, NodeError> {
        {
            let mut ledger = self.inner.ledger.write().await;
            let (tip_index, tip_hash) = {
                let tip = ledger.latest_block();
                (tip.header.index, tip.hash)
            };

            if block.header.index <= tip_index {
                return Ok(BlockOutcome::Ignored);
            }

            if block.header.index == tip_index + 1 && block.header.previous_hash == tip_hash {
                ledger.append_block(block.clone())?;
                drop(ledger);
                log::info!(
                    "Appended block {} ({}) from {}",
                    block.header.index,
                    block.hash,
                    peer.unwrap_or("unknown peer")
                );
                self.broadcast(Message::Block(block)).await;
                return Ok(BlockOutcome::Appended);
            }
        }

        let peer = peer.ok_or_else(|| {
            NetworkError::Protocol(format!(
                "Block {} does not extend our tip and its sender has no listen address",
                block.header.index
            ))
        })?;
        log::info!("Block {} from {} does not extend our tip, requesting its chain", block.header.index, peer);

        let (mut conn, _) =
            PeerConnection::open(peer, self.version_message().await, self.inner.config.request_timeout).await?;
        let chain = conn.get_chain().await?;

        let (outcome, latest) = {
            let mut ledger = self.inner.ledger.write().await;
            let outcome = ledger.replace_chain(chain)?;
            (outcome, ledger.latest_block().clone())
        };
        log::info!(
            "Switched to chain from {}: height {} -> {}, fork at {}, {} transactions back in pool",
            peer,
            outcome.previous_height,
            outcome.new_height,
            outcome.fork_index,
            outcome.readmitted
        );

        self.broadcast(Message::Block(latest)).await;
        Ok(BlockOutcome::Replaced(outcome))
    }

    /// Pool a transaction announced by a peer. Returns false when it was
    /// already pooled or confirmed, which is not an error.
    pub async fn receive_transaction(&self, peer: Option<&str>, tx: Transaction) -> Result<bool, NodeError> {
        let txid = tx.id;
        match self.inner.ledger.write().await.submit_transaction(tx.clone()) {
            Ok(_) => {}
            Err(TransactionError::AlreadyKnown(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        log::info!("Accepted transaction {} from {}", txid, peer.unwrap_or("unknown peer"));
        self.broadcast(Message::Tx(tx)).await;
        Ok(true)
    }

    /// Hand a transaction to the coordinator and wait for its verdict
    pub(crate) async fn relay_transaction(&self, from: Option<String>, tx: Transaction) -> TxStatus {
        let (reply, verdict) = oneshot::channel();
        self.queue_event(PeerEvent::Transaction {
            from,
            tx,
            reply: Some(reply),
        })
        .await;

        verdict
            .await
            .unwrap_or_else(|_| TxStatus::Rejected("Node is shutting down".to_string()))
    }

    pub(crate) async fn queue_event(&self, event: PeerEvent) {
        if self.inner.events.send(event).await.is_err() {
            log::debug!("Sync coordinator stopped, dropping peer event");
        }
    }

    pub(crate) async fn broadcast(&self, message: Message) {
        sync::broadcast(self, message).await;
    }
}

/// Running node tasks
pub struct NodeHandle {
    node: Node,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Bound listen address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop the node and wait for the listener, coordinator and miner
    pub async fn shutdown(self) {
        self.node.shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Node task failed: {}", e);
            }
        }
        log::info!("Node stopped");
    }
}
