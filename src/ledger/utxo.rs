// In-memory UTXO index

use std::collections::HashMap;

use crate::core::{Address, Amount, Block, Hash256, OutPoint, Transaction};
use crate::storage::Utxo;

/// Read access to a set of unspent outputs
pub trait UtxoView {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<Utxo>;

    /// Transaction that already consumed `outpoint`, when known
    fn spender_of(&self, _outpoint: &OutPoint) -> Option<Hash256> {
        None
    }
}

/// Persisted form of one block's effect on the index
#[derive(Debug, Default)]
pub struct UtxoChanges {
    pub spent: Vec<OutPoint>,
    pub created: Vec<(OutPoint, Utxo)>,
}

/// Unspent outputs of the canonical chain, plus which transaction spent
/// each consumed output
#[derive(Debug, Clone, Default)]
pub struct UtxoIndex {
    utxos: HashMap<OutPoint, Utxo>,
    spent: HashMap<OutPoint, Hash256>,
}

impl UtxoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a transaction already known to be valid
    pub fn apply_transaction(&mut self, tx: &Transaction, height: u64) {
        for input in tx.inputs() {
            self.utxos.remove(&input.previous_output);
            self.spent.insert(input.previous_output, tx.id);
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            self.utxos.insert(
                OutPoint::new(tx.id, index as u32),
                Utxo::new(output.clone(), height, tx.is_coinbase()),
            );
        }
    }

    /// Apply every transaction of a validated block, returning the net
    /// changes for the persisted set
    pub fn apply_block(&mut self, block: &Block) -> UtxoChanges {
        let height = block.header.index;
        let mut created: HashMap<OutPoint, Utxo> = HashMap::new();
        let mut spent = Vec::new();

        for tx in &block.transactions {
            for input in tx.inputs() {
                // Outputs created and spent inside the block never reach storage
                if created.remove(&input.previous_output).is_none() {
                    spent.push(input.previous_output);
                }
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                created.insert(
                    OutPoint::new(tx.id, index as u32),
                    Utxo::new(output.clone(), height, tx.is_coinbase()),
                );
            }
            self.apply_transaction(tx, height);
        }

        UtxoChanges {
            spent,
            created: created.into_iter().collect(),
        }
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &Utxo)> {
        self.utxos.iter()
    }

    /// Sum of unspent outputs paying `address`
    pub fn balance_of(&self, address: &Address) -> Amount {
        self.utxos
            .values()
            .filter(|utxo| utxo.output.address == *address)
            .fold(0, |acc: Amount, utxo| acc.saturating_add(utxo.output.amount))
    }

    /// Unspent outputs paying `address`, oldest first
    pub fn unspent_outputs(&self, address: &Address) -> Vec<(OutPoint, Utxo)> {
        let mut outputs: Vec<_> = self
            .utxos
            .iter()
            .filter(|(_, utxo)| utxo.output.address == *address)
            .map(|(outpoint, utxo)| (*outpoint, utxo.clone()))
            .collect();
        outputs.sort_by_key(|(outpoint, utxo)| (utxo.height, *outpoint));
        outputs
    }

    /// Whether a persisted set holds exactly these unspent outputs
    pub fn matches(&self, persisted: &[(OutPoint, Utxo)]) -> bool {
        persisted.len() == self.utxos.len()
            && persisted
                .iter()
                .all(|(outpoint, utxo)| self.utxos.get(outpoint) == Some(utxo))
    }
}

impl UtxoView for UtxoIndex {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.get(outpoint).cloned()
    }

    fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockHeader, TxOutput};

    fn addr(byte: u8) -> Address {
        Address::from_pubkey_hash([byte; 20])
    }

    #[test]
    fn test_apply_and_query() {
        let funding = Transaction::coinbase(1, vec![TxOutput::new(700, addr(1)), TxOutput::new(300, addr(2))]);
        let mut index = UtxoIndex::new();
        index.apply_transaction(&funding, 1);

        assert_eq!(index.len(), 2);
        assert_eq!(index.balance_of(&addr(1)), 700);
        assert_eq!(index.balance_of(&addr(3)), 0);

        let spend = Transaction::new(vec![OutPoint::new(funding.id, 0)], vec![TxOutput::new(650, addr(2))]);
        index.apply_transaction(&spend, 2);

        assert_eq!(index.balance_of(&addr(1)), 0);
        assert_eq!(index.balance_of(&addr(2)), 950);
        assert_eq!(index.spender_of(&OutPoint::new(funding.id, 0)), Some(spend.id));

        let unspent = index.unspent_outputs(&addr(2));
        assert_eq!(unspent.len(), 2);
        assert_eq!(unspent[0].1.height, 1);
        assert_eq!(unspent[1].1.height, 2);
    }

    #[test]
    fn test_block_changes_skip_intra_block_outputs() {
        let coinbase = Transaction::coinbase(1, vec![TxOutput::new(50, addr(1))]);
        let first = Transaction::new(vec![OutPoint::new(Hash256::new([4; 32]), 0)], vec![TxOutput::new(10, addr(2))]);
        let second = Transaction::new(vec![OutPoint::new(first.id, 0)], vec![TxOutput::new(9, addr(3))]);
        let block = Block::new(
            BlockHeader::new(1, Hash256::zero(), 0, 0),
            vec![coinbase.clone(), first.clone(), second.clone()],
        );

        let mut index = UtxoIndex::new();
        let changes = index.apply_block(&block);

        assert_eq!(changes.spent, vec![OutPoint::new(Hash256::new([4; 32]), 0)]);
        let mut created: Vec<_> = changes.created.iter().map(|(outpoint, _)| *outpoint).collect();
        created.sort();
        let mut expected = vec![OutPoint::new(coinbase.id, 0), OutPoint::new(second.id, 0)];
        expected.sort();
        assert_eq!(created, expected);
        assert!(!index.contains(&OutPoint::new(first.id, 0)));
    }

    #[test]
    fn test_matches_persisted_set() {
        let funding = Transaction::coinbase(1, vec![TxOutput::new(700, addr(1))]);
        let mut index = UtxoIndex::new();
        index.apply_transaction(&funding, 1);

        let persisted: Vec<_> = index.iter().map(|(o, u)| (*o, u.clone())).collect();
        assert!(index.matches(&persisted));
        assert!(!index.matches(&[]));
    }
}
