// utxo-node: proof-of-work UTXO ledger node

pub mod core;
pub mod consensus;
pub mod ledger;
pub mod storage;
pub mod network;
pub mod node;
pub mod wallet;
mod cli;

// Re-exports for convenience
pub use crate::cli::{Cli, CliError, CliHandler, Commands, WalletCommands};
pub use crate::core::{Address, Amount, Block, BlockHeader, Hash256, OutPoint, Transaction, TxOutput, UnspentOutput};
pub use crate::consensus::{BlockError, ConsensusParams, Miner, TransactionError};
pub use crate::ledger::{ChainReplaceRejected, Ledger, LedgerError};
pub use crate::storage::Storage;
pub use crate::network::NetworkError;
pub use crate::node::{BlockId, BlockOutcome, Node, NodeConfig, NodeError, NodeHandle};
pub use crate::wallet::{KeyPair, Keystore, TransactionBuilder};
