// CLI commands

use crate::consensus::ConsensusParams;
use crate::core::{Address, Amount, Block};
use crate::network::{NetworkError, PeerConnection, TxStatus, VersionMessage};
use crate::node::{BlockId, Node, NodeConfig, NodeError};
use crate::wallet::{DEFAULT_FEE, Keystore, TransactionBuilder, WalletError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const KEYSTORE_FILE: &str = "keystore.json";

#[derive(Parser)]
#[command(name = "utxo-node")]
#[command(about = "Proof-of-work UTXO ledger node", long_about = None)]
pub struct Cli {
    /// Directory for the chain, UTXO set and keystore
    #[arg(long, global = true, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Leading zero bits required of block hashes; all nodes must agree
    #[arg(long, global = true)]
    pub difficulty: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node
    Run {
        /// Address to accept peers on
        #[arg(long, default_value = "127.0.0.1:8333")]
        listen: String,
        /// Peer to sync with (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Mine continuously, paying rewards to this address
        #[arg(long)]
        mine_to: Option<Address>,
        /// Seconds between sync rounds with each peer
        #[arg(long, default_value = "5")]
        sync_interval_secs: u64,
    },

    /// Get blockchain info
    Info,

    /// Show a block by index or hash
    Block {
        id: BlockId,
    },

    /// Balance of an address
    Balance {
        address: Address,
    },

    /// Unspent outputs of an address
    Unspent {
        address: Address,
    },

    /// Wallet commands
    #[command(subcommand)]
    Wallet(WalletCommands),
}

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Create a new address
    NewAddress,

    /// List all addresses
    List,

    /// Pay from a keystore address through a running node
    Send {
        /// Node to fetch outputs from and submit to
        #[arg(long, default_value = "127.0.0.1:8333")]
        node: String,
        /// Paying address (keystore default if not specified)
        #[arg(long)]
        from: Option<Address>,
        #[arg(long)]
        to: Address,
        #[arg(long)]
        amount: Amount,
        #[arg(long, default_value_t = DEFAULT_FEE)]
        fee: Amount,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("{0}")]
    Usage(String),
}

/// CLI handler
pub struct CliHandler {
    data_dir: PathBuf,
    params: ConsensusParams,
}

impl CliHandler {
    pub fn new(cli: &Cli) -> Self {
        let mut params = ConsensusParams::default();
        if let Some(difficulty) = cli.difficulty {
            params.initial_difficulty = difficulty;
        }
        Self {
            data_dir: cli.data_dir.clone(),
            params,
        }
    }

    /// Handle CLI command
    pub async fn handle(&self, command: Commands) -> Result<(), CliError> {
        match command {
            Commands::Run {
                listen,
                peers,
                mine_to,
                sync_interval_secs,
            } => {
                let config = NodeConfig {
                    listen: Some(listen),
                    peers,
                    mine_to,
                    sync_interval: Duration::from_secs(sync_interval_secs.max(1)),
                    ..self.config()
                };
                self.run(config).await
            }
            Commands::Info => self.info().await,
            Commands::Block { id } => {
                let node = self.open_node()?;
                let block = node.block(id).await?;
                print_block(&block, node.height().await);
                Ok(())
            }
            Commands::Balance { address } => {
                let node = self.open_node()?;
                println!("Balance for {}: {}", address, node.balance(&address).await);
                Ok(())
            }
            Commands::Unspent { address } => {
                let node = self.open_node()?;
                let unspent = node.unspent_outputs(&address).await;
                println!("Unspent outputs for {} ({}):", address, unspent.len());
                for utxo in unspent {
                    println!("  {}:{}  {}", utxo.txid, utxo.output_index, utxo.amount);
                }
                Ok(())
            }
            Commands::Wallet(cmd) => self.handle_wallet(cmd).await,
        }
    }

    fn config(&self) -> NodeConfig {
        NodeConfig {
            data_dir: self.data_dir.clone(),
            params: self.params.clone(),
            ..NodeConfig::default()
        }
    }

    fn open_node(&self) -> Result<Node, CliError> {
        Ok(Node::open(self.config())?)
    }

    /// Run until Ctrl-C
    async fn run(&self, config: NodeConfig) -> Result<(), CliError> {
        let node = Node::open(config)?;
        let handle = node.start().await?;
        log::info!(
            "Node running at height {} (data in {})",
            node.height().await,
            self.data_dir.display()
        );

        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
        }
        log::info!("Shutting down");
        handle.shutdown().await;
        Ok(())
    }

    /// Get blockchain info
    async fn info(&self) -> Result<(), CliError> {
        let node = self.open_node()?;
        let tip = node.latest_block().await;

        println!("Blockchain Info:");
        println!("  Height: {}", tip.header.index);
        println!("  Best block: {}", tip.hash);
        println!("  Difficulty: {}", tip.header.difficulty);
        println!("  Pending transactions: {}", node.pending_transactions().await.len());
        Ok(())
    }

    /// Handle wallet commands
    async fn handle_wallet(&self, cmd: WalletCommands) -> Result<(), CliError> {
        let keystore_path = self.data_dir.join(KEYSTORE_FILE);
        let mut keystore = Keystore::open(&keystore_path)?;

        match cmd {
            WalletCommands::NewAddress => {
                let addr = keystore.new_address();
                std::fs::create_dir_all(&self.data_dir).map_err(WalletError::from)?;
                keystore.save(&keystore_path)?;
                println!("New address: {}", addr);
                Ok(())
            }
            WalletCommands::List => {
                let addresses = keystore.list_addresses();
                let default = keystore.default_address().copied();
                println!("Addresses ({}):", addresses.len());
                for addr in addresses {
                    let marker = if Some(addr) == default { " (default)" } else { "" };
                    println!("  {}{}", addr, marker);
                }
                Ok(())
            }
            WalletCommands::Send {
                node,
                from,
                to,
                amount,
                fee,
            } => {
                let from = match from.or_else(|| keystore.default_address().copied()) {
                    Some(from) => from,
                    None => {
                        return Err(CliError::Usage(
                            "No default address. Create one with 'wallet new-address'".to_string(),
                        ));
                    }
                };
                let keypair = keystore
                    .get_keypair(&from)
                    .ok_or_else(|| CliError::Usage(format!("Address {} is not in the keystore", from)))?;

                let timeout = NodeConfig::default().request_timeout;
                let ours = VersionMessage::new(rand::random(), 0, String::new());
                let (mut conn, theirs) = PeerConnection::open(&node, ours, timeout).await?;
                log::debug!("Connected to {} at height {}", node, theirs.best_height);

                let unspent = conn.get_utxos(&from).await?;
                let tx = TransactionBuilder::new(keypair).with_fee(fee).build(&unspent, to, amount)?;

                println!("Transaction created:");
                println!("  TXID: {}", tx.id);
                println!("  Inputs: {}", tx.inputs().len());
                println!("  Outputs: {}", tx.outputs.len());

                match conn.submit_transaction(&tx).await? {
                    TxStatus::Accepted => println!("  Accepted by {}", node),
                    TxStatus::AlreadyKnown => println!("  Already known to {}", node),
                    TxStatus::Rejected(reason) => {
                        return Err(CliError::Usage(format!("Rejected by {}: {}", node, reason)));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Print block information
fn print_block(block: &Block, tip_index: u64) {
    println!("Block {}:", block.header.index);
    println!("  Hash: {}", block.hash);
    println!("  Previous: {}", block.header.previous_hash);
    println!("  Timestamp: {}", block.header.timestamp);
    println!("  Difficulty: {}", block.header.difficulty);
    println!("  Nonce: {}", block.header.nonce);
    println!("  Confirmations: {}", tip_index - block.header.index + 1);
    println!("  Transactions: {}", block.transactions.len());

    for (i, tx) in block.transactions.iter().enumerate() {
        let total: Amount = tx.outputs.iter().map(|o| o.amount).sum();
        let kind = if tx.is_coinbase() { " (coinbase)" } else { "" };
        println!("    [{}] {}{}  {} out", i, tx.id, kind, total);
    }
}
