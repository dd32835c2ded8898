// Storage layer for blockchain and UTXO set

mod blockchain_db;
mod utxo_set;

pub use blockchain_db::BlockchainDB;
pub use utxo_set::{Utxo, UtxoSet};

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Storage manager - combines blockchain DB and UTXO set
pub struct Storage {
    pub blockchain: BlockchainDB,
    pub utxo_set: UtxoSet,
}

impl Storage {
    /// Open storage under `path` (`blocks/` and `utxo/`)
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let blockchain = BlockchainDB::new(path.as_ref().join("blocks"))?;
        let utxo_set = UtxoSet::new(path.as_ref().join("utxo"))?;

        Ok(Self {
            blockchain,
            utxo_set,
        })
    }

    /// Create an in-memory storage (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let blockchain = BlockchainDB::memory()?;
        let utxo_set = UtxoSet::memory()?;

        Ok(Self {
            blockchain,
            utxo_set,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.blockchain.flush()?;
        self.utxo_set.flush()
    }
}
