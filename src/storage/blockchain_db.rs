// Blockchain database using sled

use crate::core::{Block, Hash256, Serializable};
use crate::storage::StorageError;
use sled::{Batch, Db};
use std::path::Path;

const TIP_KEY: &[u8] = b"tip";
const HEIGHT_KEY: &[u8] = b"height";

/// Blockchain database
///
/// Blocks are keyed by hash, with a height index pointing at the canonical
/// chain. `tip` and `height` describe the last canonical block.
pub struct BlockchainDB {
    db: Db,
}

impl BlockchainDB {
    /// Open (or create) a blockchain database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Append a block to the canonical chain
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        Self::stage_block(&mut batch, block);
        Self::stage_tip(&mut batch, block);
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Replace the canonical chain, e.g. after a reorg
    pub fn replace_chain(&self, chain: &[Block]) -> Result<(), StorageError> {
        let Some(tip) = chain.last() else {
            return Err(StorageError::Corrupt("Refusing to store an empty chain".to_string()));
        };

        let mut batch = Batch::default();
        for key in self.db.iter().keys() {
            batch.remove(key?);
        }
        for block in chain {
            Self::stage_block(&mut batch, block);
        }
        Self::stage_tip(&mut batch, tip);
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Get a block by hash
    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StorageError> {
        match self.db.get(Self::block_key(hash))? {
            Some(data) => Ok(Some(Block::deserialize(&data).map_err(StorageError::Corrupt)?)),
            None => Ok(None),
        }
    }

    /// Get block hash by height
    pub fn get_hash_by_height(&self, height: u64) -> Result<Option<Hash256>, StorageError> {
        match self.db.get(Self::height_key(height))? {
            Some(data) => Ok(Some(Hash256::from_slice(&data).map_err(StorageError::Corrupt)?)),
            None => Ok(None),
        }
    }

    /// Get block by height
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        match self.get_hash_by_height(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    /// Get the chain tip (best block hash)
    pub fn get_tip(&self) -> Result<Option<Hash256>, StorageError> {
        match self.db.get(TIP_KEY)? {
            Some(data) => Ok(Some(Hash256::from_slice(&data).map_err(StorageError::Corrupt)?)),
            None => Ok(None),
        }
    }

    /// Index of the tip, `None` when nothing is stored yet
    pub fn get_chain_height(&self) -> Result<Option<u64>, StorageError> {
        match self.db.get(HEIGHT_KEY)? {
            Some(data) => {
                let bytes = <[u8; 8]>::try_from(&data[..])
                    .map_err(|_| StorageError::Corrupt(format!("Invalid height data length: {}", data.len())))?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Load the canonical chain in index order
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let Some(height) = self.get_chain_height()? else {
            return Ok(Vec::new());
        };

        let mut chain = Vec::with_capacity(height as usize + 1);
        for index in 0..=height {
            let block = self
                .get_block_by_height(index)?
                .ok_or_else(|| StorageError::Corrupt(format!("Missing block at height {}", index)))?;
            chain.push(block);
        }

        if self.get_tip()? != chain.last().map(|block| block.hash) {
            return Err(StorageError::Corrupt("Tip does not match the height index".to_string()));
        }

        Ok(chain)
    }

    /// Check if a block exists
    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(Self::block_key(hash))?)
    }

    /// Manually flush database
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn stage_block(batch: &mut Batch, block: &Block) {
        batch.insert(Self::block_key(&block.hash), block.serialize());
        batch.insert(Self::height_key(block.header.index), block.hash.as_bytes().as_slice());
    }

    fn stage_tip(batch: &mut Batch, tip: &Block) {
        batch.insert(TIP_KEY, tip.hash.as_bytes().as_slice());
        batch.insert(HEIGHT_KEY, tip.header.index.to_le_bytes().to_vec());
    }

    // Helper: create key for block storage
    fn block_key(hash: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(b'b'); // 'b' for block
        key.extend_from_slice(hash.as_bytes());
        key
    }

    // Helper: create key for height index (big-endian so keys sort by height)
    fn height_key(height: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(b'h'); // 'h' for height
        key.extend_from_slice(&height.to_be_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusParams;
    use crate::core::{Address, BlockHeader, Transaction, TxOutput};

    fn child(parent: &Block, marker: u8) -> Block {
        let index = parent.header.index + 1;
        let coinbase = Transaction::coinbase(index, vec![TxOutput::new(50, Address::from_pubkey_hash([marker; 20]))]);
        Block::new(BlockHeader::new(index, parent.hash, 1_700_000_000, 0), vec![coinbase])
    }

    #[test]
    fn test_append_and_load() {
        let db = BlockchainDB::memory().unwrap();
        assert!(db.load_chain().unwrap().is_empty());
        assert_eq!(db.get_chain_height().unwrap(), None);

        let genesis = Block::genesis(&ConsensusParams::default());
        let next = child(&genesis, 1);
        db.append_block(&genesis).unwrap();
        db.append_block(&next).unwrap();

        assert_eq!(db.get_chain_height().unwrap(), Some(1));
        assert_eq!(db.get_tip().unwrap(), Some(next.hash));
        assert_eq!(db.get_block(&genesis.hash).unwrap(), Some(genesis.clone()));
        assert_eq!(db.get_block_by_height(1).unwrap(), Some(next.clone()));
        assert_eq!(db.load_chain().unwrap(), vec![genesis, next]);
    }

    #[test]
    fn test_replace_chain_drops_orphans() {
        let db = BlockchainDB::memory().unwrap();
        let genesis = Block::genesis(&ConsensusParams::default());
        let orphan = child(&genesis, 1);
        db.append_block(&genesis).unwrap();
        db.append_block(&orphan).unwrap();

        let a = child(&genesis, 2);
        let b = child(&a, 2);
        let replacement = vec![genesis, a, b];
        db.replace_chain(&replacement).unwrap();

        assert!(!db.has_block(&orphan.hash).unwrap());
        assert_eq!(db.get_chain_height().unwrap(), Some(2));
        assert_eq!(db.load_chain().unwrap(), replacement);
        assert!(db.replace_chain(&[]).is_err());
    }
}
