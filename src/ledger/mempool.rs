// Transaction pool for unconfirmed transactions

use std::collections::{HashMap, HashSet};

use crate::consensus::{TransactionError, TransactionValidator};
use crate::core::{Amount, Block, Hash256, OutPoint, Transaction};
use crate::ledger::UtxoIndex;

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: Transaction,
    fee: Amount,
}

/// Validated, unconfirmed transactions in arrival order.
///
/// Every entry is valid against the committed UTXO index and no two
/// entries spend the same output.
#[derive(Debug, Default)]
pub struct TransactionPool {
    entries: Vec<PoolEntry>,
    claimed: HashMap<OutPoint, Hash256>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and admit a transaction, returning its fee
    pub fn submit(&mut self, tx: Transaction, utxos: &UtxoIndex) -> Result<Amount, TransactionError> {
        if tx.is_coinbase() {
            return Err(TransactionError::UnexpectedCoinbase);
        }

        if self.contains(&tx.id) {
            return Err(TransactionError::AlreadyKnown(tx.id));
        }

        for input in tx.inputs() {
            if let Some(spent_by) = self.claimed.get(&input.previous_output) {
                return Err(TransactionError::DoubleSpend {
                    outpoint: input.previous_output,
                    spent_by: *spent_by,
                });
            }
        }

        let fee = TransactionValidator::validate(&tx, utxos)?;

        for input in tx.inputs() {
            self.claimed.insert(input.previous_output, tx.id);
        }
        self.entries.push(PoolEntry { tx, fee });
        Ok(fee)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.iter().any(|entry| entry.tx.id == *txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.entries
            .iter()
            .find(|entry| entry.tx.id == *txid)
            .map(|entry| &entry.tx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pooled transactions in arrival order
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.iter().map(|entry| &entry.tx)
    }

    /// Oldest `max` transactions and their total fee, for a block template
    pub fn select(&self, max: usize) -> (Vec<Transaction>, Amount) {
        let selected = &self.entries[..max.min(self.entries.len())];
        let fees = selected
            .iter()
            .fold(0, |acc: Amount, entry| acc.saturating_add(entry.fee));
        (selected.iter().map(|entry| entry.tx.clone()).collect(), fees)
    }

    /// Drop transactions confirmed by `block` and any entry whose inputs
    /// are no longer unspent. Returns the number removed.
    pub fn remove_for_block(&mut self, block: &Block, utxos: &UtxoIndex) -> usize {
        let confirmed: HashSet<Hash256> = block.transactions.iter().map(|tx| tx.id).collect();
        let before = self.entries.len();

        self.entries.retain(|entry| {
            !confirmed.contains(&entry.tx.id)
                && entry
                    .tx
                    .inputs()
                    .iter()
                    .all(|input| utxos.contains(&input.previous_output))
        });
        self.reindex();

        before - self.entries.len()
    }

    /// Re-admit `candidates` in order against a new UTXO index, dropping
    /// the ones that no longer validate. Returns the number dropped.
    pub fn rebuild<I>(&mut self, candidates: I, utxos: &UtxoIndex) -> usize
    where
        I: IntoIterator<Item = Transaction>,
    {
        self.entries.clear();
        self.claimed.clear();

        let mut dropped = 0;
        for tx in candidates {
            let txid = tx.id;
            match self.submit(tx, utxos) {
                Ok(_) | Err(TransactionError::AlreadyKnown(_)) => {}
                Err(e) => {
                    log::debug!("Dropping pooled transaction {}: {}", txid, e);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    fn reindex(&mut self) {
        self.claimed = self
            .entries
            .iter()
            .flat_map(|entry| {
                entry
                    .tx
                    .inputs()
                    .iter()
                    .map(|input| (input.previous_output, entry.tx.id))
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, BlockHeader, TxOutput};
    use crate::wallet::KeyPair;

    fn funded(owner: &KeyPair, amounts: &[Amount]) -> (UtxoIndex, Vec<OutPoint>) {
        let outputs = amounts.iter().map(|a| TxOutput::new(*a, owner.address())).collect();
        let funding = Transaction::coinbase(1, outputs);
        let mut index = UtxoIndex::new();
        index.apply_transaction(&funding, 1);
        let outpoints = (0..amounts.len() as u32).map(|i| OutPoint::new(funding.id, i)).collect();
        (index, outpoints)
    }

    fn spend(owner: &KeyPair, from: OutPoint, amount: Amount, to: Address) -> Transaction {
        let mut tx = Transaction::new(vec![from], vec![TxOutput::new(amount, to)]);
        tx.sign_all(owner).unwrap();
        tx
    }

    #[test]
    fn test_submit_and_select() {
        let alice = KeyPair::generate();
        let (utxos, coins) = funded(&alice, &[100, 200]);
        let mut pool = TransactionPool::new();

        let first = spend(&alice, coins[0], 99, alice.address());
        let second = spend(&alice, coins[1], 190, alice.address());
        assert_eq!(pool.submit(first.clone(), &utxos), Ok(1));
        assert_eq!(pool.submit(second.clone(), &utxos), Ok(10));

        let (selected, fees) = pool.select(1);
        assert_eq!(selected, vec![first.clone()]);
        assert_eq!(fees, 1);

        let (selected, fees) = pool.select(10);
        assert_eq!(selected, vec![first, second]);
        assert_eq!(fees, 11);
    }

    #[test]
    fn test_racing_spends() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (utxos, coins) = funded(&alice, &[100]);
        let mut pool = TransactionPool::new();

        let to_alice = spend(&alice, coins[0], 90, alice.address());
        let to_bob = spend(&alice, coins[0], 90, bob.address());

        assert!(pool.submit(to_alice.clone(), &utxos).is_ok());
        assert_eq!(
            pool.submit(to_bob, &utxos),
            Err(TransactionError::DoubleSpend { outpoint: coins[0], spent_by: to_alice.id })
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_rejects_known_and_coinbase() {
        let alice = KeyPair::generate();
        let (utxos, coins) = funded(&alice, &[100]);
        let mut pool = TransactionPool::new();

        let tx = spend(&alice, coins[0], 90, alice.address());
        pool.submit(tx.clone(), &utxos).unwrap();
        assert_eq!(pool.submit(tx.clone(), &utxos), Err(TransactionError::AlreadyKnown(tx.id)));

        let coinbase = Transaction::coinbase(5, vec![TxOutput::new(1, alice.address())]);
        assert_eq!(pool.submit(coinbase, &utxos), Err(TransactionError::UnexpectedCoinbase));
    }

    #[test]
    fn test_remove_for_block() {
        let alice = KeyPair::generate();
        let (mut utxos, coins) = funded(&alice, &[100, 200]);
        let mut pool = TransactionPool::new();

        let confirmed = spend(&alice, coins[0], 90, alice.address());
        let pending = spend(&alice, coins[1], 190, alice.address());
        pool.submit(confirmed.clone(), &utxos).unwrap();
        pool.submit(pending.clone(), &utxos).unwrap();

        let coinbase = Transaction::coinbase(2, vec![TxOutput::new(50, alice.address())]);
        let block = Block::new(BlockHeader::new(2, Hash256::zero(), 0, 0), vec![coinbase, confirmed.clone()]);
        utxos.apply_block(&block);

        assert_eq!(pool.remove_for_block(&block, &utxos), 1);
        assert!(!pool.contains(&confirmed.id));
        assert!(pool.contains(&pending.id));

        // A later spend of the confirmed output names the confirming transaction
        let respend = spend(&alice, coins[0], 80, alice.address());
        assert_eq!(
            pool.submit(respend, &utxos),
            Err(TransactionError::DoubleSpend { outpoint: coins[0], spent_by: confirmed.id })
        );
    }

    #[test]
    fn test_rebuild_drops_invalid() {
        let alice = KeyPair::generate();
        let (utxos, coins) = funded(&alice, &[100]);
        let mut pool = TransactionPool::new();

        let valid = spend(&alice, coins[0], 90, alice.address());
        let orphan = spend(&alice, OutPoint::new(Hash256::new([8; 32]), 0), 5, alice.address());

        assert_eq!(pool.rebuild(vec![valid.clone(), orphan], &utxos), 1);
        assert_eq!(pool.transactions().cloned().collect::<Vec<_>>(), vec![valid]);
    }
}
