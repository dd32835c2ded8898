// UTXO (Unspent Transaction Output) set persistence

use crate::core::{OutPoint, Serializable, TxOutput};
use crate::storage::StorageError;
use sled::{Batch, Db};
use std::path::Path;

/// UTXO - contains the output and metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub output: TxOutput,
    pub height: u64,       // Block height where this UTXO was created
    pub is_coinbase: bool, // Whether this is a coinbase output
}

impl Utxo {
    pub fn new(output: TxOutput, height: u64, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.output.serialize();
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.push(if self.is_coinbase { 1 } else { 0 });
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        // 8 (amount) + 20 (address) + 8 (height) + 1 (coinbase flag)
        if bytes.len() != 37 {
            return Err(format!("Invalid UTXO data length: {}", bytes.len()));
        }

        let output = TxOutput::deserialize(&bytes[..28])?;

        let mut height_bytes = [0u8; 8];
        height_bytes.copy_from_slice(&bytes[28..36]);
        let height = u64::from_le_bytes(height_bytes);

        let is_coinbase = bytes[36] != 0;

        Ok(Self {
            output,
            height,
            is_coinbase,
        })
    }
}

/// UTXO set database
pub struct UtxoSet {
    db: Db,
}

impl UtxoSet {
    /// Open (or create) a UTXO set
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Create an in-memory UTXO set (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Apply the changes of one block atomically
    pub fn apply_changes<'a, S, C>(&self, spent: S, created: C) -> Result<(), StorageError>
    where
        S: IntoIterator<Item = &'a OutPoint>,
        C: IntoIterator<Item = (&'a OutPoint, &'a Utxo)>,
    {
        let mut batch = Batch::default();
        for outpoint in spent {
            batch.remove(outpoint.to_bytes());
        }
        for (outpoint, utxo) in created {
            batch.insert(outpoint.to_bytes(), utxo.to_bytes());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Replace the whole set, e.g. after a reorg
    pub fn replace_all<'a, I>(&self, utxos: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = (&'a OutPoint, &'a Utxo)>,
    {
        let mut batch = Batch::default();
        for key in self.db.iter().keys() {
            batch.remove(key?);
        }
        for (outpoint, utxo) in utxos {
            batch.insert(outpoint.to_bytes(), utxo.to_bytes());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Get a UTXO
    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, StorageError> {
        match self.db.get(outpoint.to_bytes())? {
            Some(data) => Ok(Some(Utxo::from_bytes(&data).map_err(StorageError::Corrupt)?)),
            None => Ok(None),
        }
    }

    /// Get all UTXOs
    pub fn get_all_utxos(&self) -> Result<Vec<(OutPoint, Utxo)>, StorageError> {
        let mut utxos = Vec::new();

        for item in self.db.iter() {
            let (key, value) = item?;
            let outpoint = OutPoint::from_bytes(&key).map_err(StorageError::Corrupt)?;
            let utxo = Utxo::from_bytes(&value).map_err(StorageError::Corrupt)?;
            utxos.push((outpoint, utxo));
        }

        Ok(utxos)
    }

    /// Count total UTXOs
    pub fn count(&self) -> usize {
        self.db.len()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
