// Block data structures

use crate::consensus::ConsensusParams;
use crate::core::{Address, Hash256, PrefixHasher, Serializable, Transaction, TxOutput, hash160};
use crate::core::serialize::{read_hash, read_list, read_u32, read_u64, write_list};
use std::io::Read;

/// Seed for the keyless address holding the genesis allocation
const GENESIS_SEED: &[u8] = b"utxo-node genesis allocation";

/// Block header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Position in the chain, 0 for genesis
    pub index: u64,
    /// Hash of the previous block
    pub previous_hash: Hash256,
    /// Block timestamp (Unix seconds)
    pub timestamp: u64,
    /// Required leading zero bits of the block hash
    pub difficulty: u32,
    /// Nonce for proof-of-work
    pub nonce: u64,
}

impl BlockHeader {
    pub fn new(index: u64, previous_hash: Hash256, timestamp: u64, difficulty: u32) -> Self {
        Self {
            index,
            previous_hash,
            timestamp,
            difficulty,
            nonce: 0,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(60);
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(self.previous_hash.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.difficulty.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, String> {
        Ok(Self {
            index: read_u64(reader)?,
            previous_hash: read_hash(reader)?,
            timestamp: read_u64(reader)?,
            difficulty: read_u32(reader)?,
            nonce: read_u64(reader)?,
        })
    }
}

/// Block - header, stored hash and transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Hash of header fields and transactions; checked against a recomputation
    pub hash: Hash256,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a block, computing its hash from the current nonce
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        let hash = Self::calculate_hash(&header, &transactions);
        Self {
            header,
            hash,
            transactions,
        }
    }

    /// Keyless address that receives the genesis allocation
    pub fn genesis_address() -> Address {
        Address::from_pubkey_hash(hash160(GENESIS_SEED))
    }

    /// Create the genesis block. Deterministic for a given set of parameters.
    pub fn genesis(params: &ConsensusParams) -> Self {
        let allocation = Transaction::coinbase(
            0,
            vec![TxOutput::new(params.genesis_allocation, Self::genesis_address())],
        );

        let header = BlockHeader::new(
            0,
            Hash256::zero(),
            params.genesis_timestamp,
            params.initial_difficulty,
        );

        Self::new(header, vec![allocation])
    }

    /// Hash preimage up to (not including) the nonce:
    /// index ‖ previous_hash ‖ timestamp ‖ difficulty ‖ transactions
    fn hash_prefix(header: &BlockHeader, transactions: &[Transaction]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(52 + transactions.len() * 128);
        buf.extend_from_slice(&header.index.to_le_bytes());
        buf.extend_from_slice(header.previous_hash.as_bytes());
        buf.extend_from_slice(&header.timestamp.to_le_bytes());
        buf.extend_from_slice(&header.difficulty.to_le_bytes());
        write_list(&mut buf, transactions).expect("write to Vec");
        buf
    }

    /// Calculate the block hash
    pub fn calculate_hash(header: &BlockHeader, transactions: &[Transaction]) -> Hash256 {
        Self::hasher(header, transactions).finish(&header.nonce.to_le_bytes())
    }

    /// Prefix hasher for nonce search over a fixed header and body
    pub fn hasher(header: &BlockHeader, transactions: &[Transaction]) -> PrefixHasher {
        PrefixHasher::new(&Self::hash_prefix(header, transactions))
    }

    /// Stored hash equals the recomputed one
    pub fn has_valid_hash(&self) -> bool {
        self.hash == Self::calculate_hash(&self.header, &self.transactions)
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.header.index == 0 && self.header.previous_hash == Hash256::zero()
    }

    /// Coinbase transaction, when the block is well formed
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}

impl Serializable for Block {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = self.header.serialize();
        buf.extend_from_slice(self.hash.as_bytes());
        write_list(&mut buf, &self.transactions).expect("write to Vec");
        buf
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, String> {
        let header = BlockHeader::from_reader(reader)?;
        let hash = read_hash(reader)?;
        let transactions = read_list(reader)?;

        Ok(Self {
            header,
            hash,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let coinbase = Transaction::coinbase(
            1,
            vec![TxOutput::new(50, Address::from_pubkey_hash([3; 20]))],
        );
        let header = BlockHeader::new(1, Hash256::new([1; 32]), 1_700_000_000, 4);
        Block::new(header, vec![coinbase])
    }

    #[test]
    fn test_block_serialization() {
        let block = sample_block();
        let decoded = Block::deserialize(&block.serialize()).unwrap();
        assert_eq!(block, decoded);
        assert!(decoded.has_valid_hash());
    }

    #[test]
    fn test_block_hash_covers_every_field() {
        let block = sample_block();

        let mut changed = block.header.clone();
        changed.nonce += 1;
        assert_ne!(Block::calculate_hash(&changed, &block.transactions), block.hash);

        let mut changed = block.header.clone();
        changed.timestamp += 1;
        assert_ne!(Block::calculate_hash(&changed, &block.transactions), block.hash);

        let mut changed = block.header.clone();
        changed.difficulty += 1;
        assert_ne!(Block::calculate_hash(&changed, &block.transactions), block.hash);

        let other_tx = Transaction::coinbase(
            1,
            vec![TxOutput::new(51, Address::from_pubkey_hash([3; 20]))],
        );
        assert_ne!(Block::calculate_hash(&block.header, &[other_tx]), block.hash);
    }

    #[test]
    fn test_genesis_block() {
        let params = ConsensusParams::default();
        let genesis = Block::genesis(&params);

        assert!(genesis.is_genesis());
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.coinbase().is_some());
        assert_eq!(genesis, Block::genesis(&params));
    }

    #[test]
    fn test_genesis_depends_on_params() {
        let easy = ConsensusParams { initial_difficulty: 1, ..ConsensusParams::default() };
        assert_ne!(Block::genesis(&easy).hash, Block::genesis(&ConsensusParams::default()).hash);
    }
}
