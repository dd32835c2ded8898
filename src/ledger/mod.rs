// Ledger - canonical chain, UTXO index and transaction pool

mod mempool;
mod utxo;

pub use mempool::TransactionPool;
pub use utxo::{UtxoChanges, UtxoIndex, UtxoView};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::consensus::{BlockError, BlockValidator, ConsensusParams, TransactionError, chain_work};
use crate::core::{
    Address, Amount, Block, BlockHeader, Hash256, OutPoint, Transaction, TxOutput, current_timestamp,
};
use crate::storage::{Storage, StorageError, Utxo};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Block rejected: {0}")]
    InvalidBlock(#[from] BlockError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Persisted chain is corrupt at block {index}: {reason}")]
    CorruptChain { index: u64, reason: String },
}

/// Why a candidate chain did not replace the local one
#[derive(Debug, Error)]
pub enum ChainReplaceRejected {
    #[error("Candidate chain is empty")]
    Empty,
    #[error("Candidate chain has a different genesis block")]
    GenesisMismatch,
    #[error("Candidate work {candidate} does not exceed local work {local}")]
    InsufficientWork { local: u128, candidate: u128 },
    #[error("Candidate block {index} is invalid: {error}")]
    InvalidBlock { index: u64, error: BlockError },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Summary of an accepted chain replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub previous_height: u64,
    pub new_height: u64,
    /// First index at which the chains differ
    pub fork_index: u64,
    /// Regular transactions of discarded blocks now back in the pool
    pub readmitted: usize,
}

/// Candidate block body for the miner
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Tip version the template was built against
    pub tip_version: u64,
}

/// The canonical chain and everything derived from it.
///
/// `chain` is never empty once opened; the UTXO index, transaction
/// locations and pool always agree with the current tip.
pub struct Ledger {
    params: ConsensusParams,
    chain: Vec<Block>,
    block_index: HashMap<Hash256, u64>,
    tx_locations: HashMap<Hash256, u64>,
    utxos: UtxoIndex,
    pool: TransactionPool,
    storage: Storage,
    tip_version: Arc<AtomicU64>,
}

impl Ledger {
    /// Load the persisted chain, or create one holding only genesis.
    ///
    /// Every stored block is replayed through full validation.
    pub fn open(storage: Storage, params: ConsensusParams) -> Result<Self, LedgerError> {
        let stored = storage.blockchain.load_chain()?;

        let mut ledger = Self {
            params,
            chain: Vec::new(),
            block_index: HashMap::new(),
            tx_locations: HashMap::new(),
            utxos: UtxoIndex::new(),
            pool: TransactionPool::new(),
            storage,
            tip_version: Arc::new(AtomicU64::new(0)),
        };

        if stored.is_empty() {
            let genesis = Block::genesis(&ledger.params);
            ledger.storage.blockchain.append_block(&genesis)?;
            log::info!("Created genesis block {}", genesis.hash);
            ledger.commit(genesis);
            ledger.storage.utxo_set.replace_all(ledger.utxos.iter())?;
            ledger.storage.flush()?;
            return Ok(ledger);
        }

        let now = current_timestamp();
        for block in stored {
            let validator = BlockValidator::new(&ledger.params);
            if let Err(e) = validator.validate_block(&ledger.chain, &ledger.utxos, &block, now) {
                return Err(LedgerError::CorruptChain {
                    index: block.header.index,
                    reason: e.to_string(),
                });
            }
            ledger.commit(block);
        }

        let persisted = ledger.storage.utxo_set.get_all_utxos()?;
        if !ledger.utxos.matches(&persisted) {
            log::warn!(
                "Persisted UTXO set ({} entries) disagrees with the chain ({} entries), rewriting",
                persisted.len(),
                ledger.utxos.len()
            );
            ledger.storage.utxo_set.replace_all(ledger.utxos.iter())?;
            ledger.storage.flush()?;
        }

        log::info!(
            "Loaded chain: height {}, tip {}, {} unspent outputs",
            ledger.height(),
            ledger.latest_block().hash,
            ledger.utxos.len()
        );
        Ok(ledger)
    }

    /// Validate a block against the tip and extend the chain with it,
    /// returning the new tip
    pub fn append_block(&mut self, block: Block) -> Result<&Block, LedgerError> {
        let validator = BlockValidator::new(&self.params);
        let fees = validator.validate_block(&self.chain, &self.utxos, &block, current_timestamp())?;

        self.storage.blockchain.append_block(&block)?;

        let changes = self.commit(block);
        // The UTXO store is derived data; `open` repairs it from the chain
        if let Err(e) = self.persist_utxo_changes(&changes) {
            log::warn!("Failed to persist UTXO changes: {}", e);
        }

        let tip = self.latest_block();
        log::info!(
            "Appended block {} ({}) with {} transactions, fees {}",
            tip.header.index,
            tip.hash,
            tip.transactions.len(),
            fees
        );
        Ok(tip)
    }

    /// Adopt `candidate` if it is valid from genesis and carries strictly
    /// more cumulative work than the local chain. Nothing changes on
    /// rejection.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> Result<ReplaceOutcome, ChainReplaceRejected> {
        let Some(candidate_genesis) = candidate.first() else {
            return Err(ChainReplaceRejected::Empty);
        };
        if *candidate_genesis != self.chain[0] {
            return Err(ChainReplaceRejected::GenesisMismatch);
        }

        let local = self.cumulative_work();
        let candidate_work = chain_work(&candidate);
        if candidate_work <= local {
            return Err(ChainReplaceRejected::InsufficientWork {
                local,
                candidate: candidate_work,
            });
        }

        let validator = BlockValidator::new(&self.params);
        let now = current_timestamp();
        let mut scratch = UtxoIndex::new();
        for (position, block) in candidate.iter().enumerate() {
            validator
                .validate_block(&candidate[..position], &scratch, block, now)
                .map_err(|error| ChainReplaceRejected::InvalidBlock {
                    index: position as u64,
                    error,
                })?;
            scratch.apply_block(block);
        }

        self.storage.blockchain.replace_chain(&candidate)?;
        if let Err(e) = self.storage.utxo_set.replace_all(scratch.iter()) {
            log::warn!("Failed to persist UTXO set after reorg: {}", e);
        }
        if let Err(e) = self.storage.flush() {
            log::warn!("Failed to flush storage after reorg: {}", e);
        }

        let fork_index = self
            .chain
            .iter()
            .zip(&candidate)
            .take_while(|(ours, theirs)| ours.hash == theirs.hash)
            .count();

        let previous_height = self.height();
        let discarded: Vec<Block> = self.chain.drain(fork_index..).collect();
        let pooled: Vec<Transaction> = self.pool.transactions().cloned().collect();

        self.chain = candidate;
        self.utxos = scratch;
        self.reindex();

        // Orphaned transactions go first: they were seen before the pooled ones
        let confirmed = &self.tx_locations;
        let offered: Vec<Transaction> = discarded
            .into_iter()
            .flat_map(|block| block.transactions)
            .chain(pooled)
            .filter(|tx| !tx.is_coinbase() && !confirmed.contains_key(&tx.id))
            .collect();
        let offered_count = offered.len();
        let dropped = self.pool.rebuild(offered, &self.utxos);

        self.bump_tip_version();

        let outcome = ReplaceOutcome {
            previous_height,
            new_height: self.height(),
            fork_index: fork_index as u64,
            readmitted: offered_count - dropped,
        };
        log::info!(
            "Replaced chain at fork {}: height {} -> {}, work {} -> {}, {} pooled transactions",
            outcome.fork_index,
            outcome.previous_height,
            outcome.new_height,
            local,
            candidate_work,
            self.pool.len()
        );
        Ok(outcome)
    }

    /// Admit a transaction to the pool, returning its fee
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<Amount, TransactionError> {
        if self.tx_locations.contains_key(&tx.id) {
            return Err(TransactionError::AlreadyKnown(tx.id));
        }
        let txid = tx.id;
        let fee = self.pool.submit(tx, &self.utxos)?;
        log::debug!("Accepted transaction {} into pool (fee {})", txid, fee);
        Ok(fee)
    }

    /// Next block on the current tip: pooled transactions in arrival order
    /// behind a coinbase paying the reward and, separately, the fees
    pub fn block_template(&self, reward_address: Address) -> BlockTemplate {
        let tip = self.latest_block();
        let index = tip.header.index + 1;
        let (selected, fees) = self.pool.select(self.params.max_block_transactions);

        let mut outputs = vec![TxOutput::new(self.params.block_reward, reward_address)];
        if fees > 0 {
            outputs.push(TxOutput::new(fees, reward_address));
        }

        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(Transaction::coinbase(index, outputs));
        transactions.extend(selected);

        let header = BlockHeader::new(
            index,
            tip.hash,
            current_timestamp().max(tip.header.timestamp),
            self.params.next_difficulty(&self.chain),
        );

        BlockTemplate {
            header,
            transactions,
            tip_version: self.current_tip_version(),
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn latest_block(&self) -> &Block {
        // Never empty after open
        &self.chain[self.chain.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.latest_block().header.index
    }

    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    pub fn block_by_index(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.chain.get(i))
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Option<&Block> {
        self.block_index
            .get(hash)
            .and_then(|index| self.block_by_index(*index))
    }

    /// Blocks on top of (and including) the one holding `txid`
    pub fn confirmations(&self, txid: &Hash256) -> Option<u64> {
        self.tx_locations
            .get(txid)
            .map(|index| self.height() - index + 1)
    }

    /// A pooled or confirmed transaction, with its confirmations
    pub fn transaction(&self, txid: &Hash256) -> Option<(&Transaction, Option<u64>)> {
        if let Some(index) = self.tx_locations.get(txid) {
            return self
                .block_by_index(*index)
                .and_then(|block| block.transactions.iter().find(|tx| tx.id == *txid))
                .map(|tx| (tx, self.confirmations(txid)));
        }
        self.pool.get(txid).map(|tx| (tx, None))
    }

    pub fn balance_of(&self, address: &Address) -> Amount {
        self.utxos.balance_of(address)
    }

    pub fn unspent_outputs(&self, address: &Address) -> Vec<(OutPoint, Utxo)> {
        self.utxos.unspent_outputs(address)
    }

    pub fn utxos(&self) -> &UtxoIndex {
        &self.utxos
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn cumulative_work(&self) -> u128 {
        chain_work(&self.chain)
    }

    /// Shared counter bumped on every tip change
    pub fn tip_version(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.tip_version)
    }

    pub fn current_tip_version(&self) -> u64 {
        self.tip_version.load(Ordering::Acquire)
    }

    fn commit(&mut self, block: Block) -> UtxoChanges {
        let changes = self.utxos.apply_block(&block);
        self.index_block(&block);
        self.pool.remove_for_block(&block, &self.utxos);
        self.chain.push(block);
        self.bump_tip_version();
        changes
    }

    fn index_block(&mut self, block: &Block) {
        self.block_index.insert(block.hash, block.header.index);
        for tx in &block.transactions {
            self.tx_locations.insert(tx.id, block.header.index);
        }
    }

    fn reindex(&mut self) {
        self.block_index.clear();
        self.tx_locations.clear();
        let chain = std::mem::take(&mut self.chain);
        for block in &chain {
            self.index_block(block);
        }
        self.chain = chain;
    }

    fn persist_utxo_changes(&self, changes: &UtxoChanges) -> Result<(), StorageError> {
        self.storage.utxo_set.apply_changes(
            &changes.spent,
            changes.created.iter().map(|(outpoint, utxo)| (outpoint, utxo)),
        )?;
        self.storage.flush()
    }

    fn bump_tip_version(&self) {
        self.tip_version.fetch_add(1, Ordering::AcqRel);
    }
}
