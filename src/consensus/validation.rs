// Transaction and block validation

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::consensus::{ConsensusParams, Miner};
use crate::core::{Amount, Block, Hash256, OutPoint, Script, Transaction, TransactionKind};
use crate::ledger::UtxoView;
use crate::storage::Utxo;

/// Why a transaction was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Transaction has no outputs")]
    EmptyOutputs,
    #[error("Regular transaction has no inputs")]
    EmptyInputs,
    #[error("Output {0} has a zero amount")]
    ZeroAmount(usize),
    #[error("Amounts overflow")]
    AmountOverflow,
    #[error("Transaction id does not match its contents")]
    IdMismatch,
    #[error("Input {0} is referenced twice")]
    DuplicateInput(OutPoint),
    #[error("Input {0} does not reference an unspent output")]
    UnknownInput(OutPoint),
    #[error("Output {outpoint} already spent by {spent_by}")]
    DoubleSpend { outpoint: OutPoint, spent_by: Hash256 },
    #[error("Invalid signature for input {index}")]
    InvalidSignature { index: usize },
    #[error("Insufficient funds: inputs {inputs}, outputs {outputs}")]
    InsufficientFunds { inputs: Amount, outputs: Amount },
    #[error("Coinbase transactions are only valid inside blocks")]
    UnexpectedCoinbase,
    #[error("Transaction {0} is already known")]
    AlreadyKnown(Hash256),
}

/// Why a block was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("Genesis block does not match")]
    InvalidGenesis,
    #[error("Invalid index: expected {expected}, got {got}")]
    InvalidIndex { expected: u64, got: u64 },
    #[error("Previous hash does not match the chain tip")]
    InvalidPreviousHash,
    #[error("Timestamp {timestamp} is too far before parent timestamp {parent}")]
    TimestampTooOld { timestamp: u64, parent: u64 },
    #[error("Timestamp {timestamp} is too far ahead of local time {now}")]
    TimestampTooNew { timestamp: u64, now: u64 },
    #[error("Invalid difficulty: expected {expected}, got {got}")]
    InvalidDifficulty { expected: u32, got: u32 },
    #[error("Block hash does not match its contents")]
    HashMismatch,
    #[error("Invalid proof of work")]
    InvalidProofOfWork,
    #[error("Block has no transactions")]
    NoTransactions,
    #[error("Missing coinbase transaction")]
    MissingCoinbase,
    #[error("Multiple coinbase transactions")]
    MultipleCoinbase,
    #[error("Coinbase height {got} does not match block index {expected}")]
    InvalidCoinbaseHeight { expected: u64, got: u64 },
    #[error("Coinbase pays {paid}, at most {allowed} allowed")]
    ExcessiveCoinbase { paid: Amount, allowed: Amount },
    #[error("Too many transactions: {count} (max {max})")]
    TooManyTransactions { count: usize, max: usize },
    #[error("Transaction {0} appears twice")]
    DuplicateTransaction(Hash256),
    #[error("Transaction {txid} is invalid: {source}")]
    InvalidTransaction { txid: Hash256, source: TransactionError },
}

/// Transaction validator
pub struct TransactionValidator;

impl TransactionValidator {
    /// Checks that need no UTXO lookups
    pub fn check_structure(tx: &Transaction) -> Result<(), TransactionError> {
        if tx.outputs.is_empty() {
            return Err(TransactionError::EmptyOutputs);
        }

        if let Some(position) = tx.outputs.iter().position(|out| out.amount == 0) {
            return Err(TransactionError::ZeroAmount(position));
        }

        if tx.total_output_value().is_none() {
            return Err(TransactionError::AmountOverflow);
        }

        if let TransactionKind::Regular { inputs } = &tx.kind {
            if inputs.is_empty() {
                return Err(TransactionError::EmptyInputs);
            }

            let mut seen = HashSet::with_capacity(inputs.len());
            for input in inputs {
                if !seen.insert(input.previous_output) {
                    return Err(TransactionError::DuplicateInput(input.previous_output));
                }
            }
        }

        if tx.compute_id() != tx.id {
            return Err(TransactionError::IdMismatch);
        }

        Ok(())
    }

    /// Validate a transaction against a UTXO view, returning its fee.
    ///
    /// Coinbase transactions only get structural checks here; their amount
    /// is bounded by the block rules.
    pub fn validate<V: UtxoView + ?Sized>(tx: &Transaction, view: &V) -> Result<Amount, TransactionError> {
        Self::check_structure(tx)?;

        let inputs = match &tx.kind {
            TransactionKind::Coinbase { .. } => return Ok(0),
            TransactionKind::Regular { inputs } => inputs,
        };

        let mut total_input: Amount = 0;
        for (index, input) in inputs.iter().enumerate() {
            let outpoint = &input.previous_output;
            let utxo = Self::resolve(view, outpoint)?;

            if !Script::verify(&utxo.output.address, &tx.id, &input.signature) {
                return Err(TransactionError::InvalidSignature { index });
            }

            total_input = total_input
                .checked_add(utxo.output.amount)
                .ok_or(TransactionError::AmountOverflow)?;
        }

        // Checked by check_structure
        let total_output = tx.total_output_value().ok_or(TransactionError::AmountOverflow)?;
        if total_input < total_output {
            return Err(TransactionError::InsufficientFunds {
                inputs: total_input,
                outputs: total_output,
            });
        }

        Ok(total_input - total_output)
    }

    fn resolve<V: UtxoView + ?Sized>(view: &V, outpoint: &OutPoint) -> Result<Utxo, TransactionError> {
        if let Some(utxo) = view.get_utxo(outpoint) {
            return Ok(utxo);
        }
        match view.spender_of(outpoint) {
            Some(spent_by) => Err(TransactionError::DoubleSpend {
                outpoint: *outpoint,
                spent_by,
            }),
            None => Err(TransactionError::UnknownInput(*outpoint)),
        }
    }
}

/// Block validator
pub struct BlockValidator<'a> {
    params: &'a ConsensusParams,
}

impl<'a> BlockValidator<'a> {
    pub fn new(params: &'a ConsensusParams) -> Self {
        Self { params }
    }

    /// Validate the first block of a chain
    pub fn validate_genesis(&self, block: &Block) -> Result<(), BlockError> {
        if *block != Block::genesis(self.params) {
            return Err(BlockError::InvalidGenesis);
        }
        Ok(())
    }

    /// Validate `block` as the successor of `chain` (which ends at the
    /// current tip) against the UTXO state at that tip. Returns the fees
    /// collected by the block's regular transactions.
    ///
    /// Header rules are checked before the body, in field order, so a
    /// single mutated header field is reported as its own rule.
    pub fn validate_block<V: UtxoView + ?Sized>(
        &self,
        chain: &[Block],
        utxos: &V,
        block: &Block,
        now: u64,
    ) -> Result<Amount, BlockError> {
        let Some(tip) = chain.last() else {
            self.validate_genesis(block)?;
            return Ok(0);
        };

        self.validate_header(chain, tip, block, now)?;
        self.validate_body(utxos, block)
    }

    fn validate_header(&self, chain: &[Block], tip: &Block, block: &Block, now: u64) -> Result<(), BlockError> {
        let header = &block.header;

        let expected_index = tip.header.index + 1;
        if header.index != expected_index {
            return Err(BlockError::InvalidIndex {
                expected: expected_index,
                got: header.index,
            });
        }

        if header.previous_hash != tip.hash {
            return Err(BlockError::InvalidPreviousHash);
        }

        let earliest = tip.header.timestamp.saturating_sub(self.params.timestamp_past_tolerance);
        if header.timestamp < earliest {
            return Err(BlockError::TimestampTooOld {
                timestamp: header.timestamp,
                parent: tip.header.timestamp,
            });
        }
        if header.timestamp > now.saturating_add(self.params.timestamp_future_tolerance) {
            return Err(BlockError::TimestampTooNew {
                timestamp: header.timestamp,
                now,
            });
        }

        let expected_difficulty = self.params.next_difficulty(chain);
        if header.difficulty != expected_difficulty {
            return Err(BlockError::InvalidDifficulty {
                expected: expected_difficulty,
                got: header.difficulty,
            });
        }

        if !block.has_valid_hash() {
            return Err(BlockError::HashMismatch);
        }

        if !Miner::verify(block) {
            return Err(BlockError::InvalidProofOfWork);
        }

        Ok(())
    }

    fn validate_body<V: UtxoView + ?Sized>(&self, utxos: &V, block: &Block) -> Result<Amount, BlockError> {
        let Some(coinbase) = block.transactions.first() else {
            return Err(BlockError::NoTransactions);
        };

        let TransactionKind::Coinbase { height } = coinbase.kind else {
            return Err(BlockError::MissingCoinbase);
        };

        if block.transactions[1..].iter().any(Transaction::is_coinbase) {
            return Err(BlockError::MultipleCoinbase);
        }

        let regular_count = block.transactions.len() - 1;
        if regular_count > self.params.max_block_transactions {
            return Err(BlockError::TooManyTransactions {
                count: regular_count,
                max: self.params.max_block_transactions,
            });
        }

        if height != block.header.index {
            return Err(BlockError::InvalidCoinbaseHeight {
                expected: block.header.index,
                got: height,
            });
        }

        TransactionValidator::check_structure(coinbase).map_err(|source| BlockError::InvalidTransaction {
            txid: coinbase.id,
            source,
        })?;

        // Spends are applied in order so later transactions see earlier ones
        let mut overlay = BlockOverlay::new(utxos);
        let mut seen = HashSet::with_capacity(block.transactions.len());
        seen.insert(coinbase.id);
        let mut fees: Amount = 0;

        for tx in &block.transactions[1..] {
            if !seen.insert(tx.id) {
                return Err(BlockError::DuplicateTransaction(tx.id));
            }

            let fee = TransactionValidator::validate(tx, &overlay).map_err(|source| {
                BlockError::InvalidTransaction { txid: tx.id, source }
            })?;

            fees = fees.checked_add(fee).ok_or(BlockError::InvalidTransaction {
                txid: tx.id,
                source: TransactionError::AmountOverflow,
            })?;

            overlay.apply(tx, block.header.index);
        }

        let allowed = self.params.block_reward.saturating_add(fees);
        let paid = coinbase.total_output_value().unwrap_or(Amount::MAX);
        if paid > allowed {
            return Err(BlockError::ExcessiveCoinbase { paid, allowed });
        }

        Ok(fees)
    }
}

/// Spends and creations of the block being validated, layered over the
/// UTXO state at its parent
struct BlockOverlay<'v, V: UtxoView + ?Sized> {
    base: &'v V,
    created: HashMap<OutPoint, Utxo>,
    spent: HashMap<OutPoint, Hash256>,
}

impl<'v, V: UtxoView + ?Sized> BlockOverlay<'v, V> {
    fn new(base: &'v V) -> Self {
        Self {
            base,
            created: HashMap::new(),
            spent: HashMap::new(),
        }
    }

    fn apply(&mut self, tx: &Transaction, height: u64) {
        for input in tx.inputs() {
            self.created.remove(&input.previous_output);
            self.spent.insert(input.previous_output, tx.id);
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            self.created.insert(
                OutPoint::new(tx.id, index as u32),
                Utxo::new(output.clone(), height, tx.is_coinbase()),
            );
        }
    }
}

impl<V: UtxoView + ?Sized> UtxoView for BlockOverlay<'_, V> {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        if self.spent.contains_key(outpoint) {
            return None;
        }
        self.created
            .get(outpoint)
            .cloned()
            .or_else(|| self.base.get_utxo(outpoint))
    }

    fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent
            .get(outpoint)
            .copied()
            .or_else(|| self.base.spender_of(outpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, BlockHeader, TxOutput};
    use crate::ledger::UtxoIndex;
    use crate::wallet::KeyPair;

    const NOW: u64 = 1_700_000_000;

    fn params() -> ConsensusParams {
        ConsensusParams {
            initial_difficulty: 2,
            ..ConsensusParams::default()
        }
    }

    fn funded(owner: &KeyPair, amount: Amount) -> (UtxoIndex, OutPoint) {
        let funding = Transaction::coinbase(1, vec![TxOutput::new(amount, owner.address())]);
        let mut index = UtxoIndex::new();
        index.apply_transaction(&funding, 1);
        (index, OutPoint::new(funding.id, 0))
    }

    fn spend(owner: &KeyPair, from: OutPoint, outputs: Vec<TxOutput>) -> Transaction {
        let mut tx = Transaction::new(vec![from], outputs);
        tx.sign_all(owner).unwrap();
        tx
    }

    fn mine_on(chain: &[Block], params: &ConsensusParams, mut transactions: Vec<Transaction>, coinbase_to: Address) -> Block {
        let tip = chain.last().unwrap();
        let index = tip.header.index + 1;
        let coinbase = Transaction::coinbase(index, vec![TxOutput::new(params.block_reward, coinbase_to)]);
        transactions.insert(0, coinbase);

        let mut header = BlockHeader::new(index, tip.hash, NOW, params.next_difficulty(chain));
        Miner::default().mine(&mut header, &transactions, || false);
        Block::new(header, transactions)
    }

    #[test]
    fn test_valid_transfer_pays_fee() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (utxos, coin) = funded(&alice, 1000);

        let tx = spend(&alice, coin, vec![
            TxOutput::new(600, bob.address()),
            TxOutput::new(399, alice.address()),
        ]);

        assert_eq!(TransactionValidator::validate(&tx, &utxos), Ok(1));
    }

    #[test]
    fn test_structural_rules() {
        let alice = KeyPair::generate();
        let (_, coin) = funded(&alice, 1000);

        let no_outputs = Transaction::new(vec![coin], vec![]);
        assert_eq!(TransactionValidator::check_structure(&no_outputs), Err(TransactionError::EmptyOutputs));

        let no_inputs = Transaction::new(vec![], vec![TxOutput::new(1, alice.address())]);
        assert_eq!(TransactionValidator::check_structure(&no_inputs), Err(TransactionError::EmptyInputs));

        let zero = Transaction::new(vec![coin], vec![TxOutput::new(0, alice.address())]);
        assert_eq!(TransactionValidator::check_structure(&zero), Err(TransactionError::ZeroAmount(0)));

        let twice = Transaction::new(vec![coin, coin], vec![TxOutput::new(1, alice.address())]);
        assert_eq!(TransactionValidator::check_structure(&twice), Err(TransactionError::DuplicateInput(coin)));

        let mut tampered = Transaction::new(vec![coin], vec![TxOutput::new(5, alice.address())]);
        tampered.outputs[0].amount = 6;
        assert_eq!(TransactionValidator::check_structure(&tampered), Err(TransactionError::IdMismatch));
    }

    #[test]
    fn test_unknown_input() {
        let alice = KeyPair::generate();
        let (utxos, _) = funded(&alice, 1000);
        let missing = OutPoint::new(Hash256::new([9; 32]), 0);

        let tx = spend(&alice, missing, vec![TxOutput::new(1, alice.address())]);
        assert_eq!(TransactionValidator::validate(&tx, &utxos), Err(TransactionError::UnknownInput(missing)));
    }

    #[test]
    fn test_signature_from_wrong_key() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let (utxos, coin) = funded(&alice, 1000);

        let tx = spend(&mallory, coin, vec![TxOutput::new(900, mallory.address())]);
        assert_eq!(
            TransactionValidator::validate(&tx, &utxos),
            Err(TransactionError::InvalidSignature { index: 0 })
        );
    }

    #[test]
    fn test_insufficient_funds() {
        let alice = KeyPair::generate();
        let (utxos, coin) = funded(&alice, 1000);

        let tx = spend(&alice, coin, vec![TxOutput::new(1001, alice.address())]);
        assert_eq!(
            TransactionValidator::validate(&tx, &utxos),
            Err(TransactionError::InsufficientFunds { inputs: 1000, outputs: 1001 })
        );
    }

    #[test]
    fn test_spent_output_is_double_spend() {
        let alice = KeyPair::generate();
        let (mut utxos, coin) = funded(&alice, 1000);

        let first = spend(&alice, coin, vec![TxOutput::new(1000, alice.address())]);
        utxos.apply_transaction(&first, 2);

        let second = spend(&alice, coin, vec![TxOutput::new(999, alice.address())]);
        assert_eq!(
            TransactionValidator::validate(&second, &utxos),
            Err(TransactionError::DoubleSpend { outpoint: coin, spent_by: first.id })
        );
    }

    #[test]
    fn test_valid_block_and_header_mutations() {
        let params = params();
        let validator = BlockValidator::new(&params);
        let miner_addr = KeyPair::generate().address();
        let genesis = Block::genesis(&params);
        let mut utxos = UtxoIndex::new();
        utxos.apply_block(&genesis);
        let chain = vec![genesis];

        let block = mine_on(&chain, &params, vec![], miner_addr);
        assert_eq!(validator.validate_block(&chain, &utxos, &block, NOW), Ok(0));

        let mut bad = block.clone();
        bad.header.index += 1;
        assert!(matches!(validator.validate_block(&chain, &utxos, &bad, NOW), Err(BlockError::InvalidIndex { .. })));

        let mut bad = block.clone();
        bad.header.previous_hash = Hash256::new([1; 32]);
        assert_eq!(validator.validate_block(&chain, &utxos, &bad, NOW), Err(BlockError::InvalidPreviousHash));

        let mut bad = block.clone();
        bad.header.timestamp = NOW + 3600;
        assert!(matches!(validator.validate_block(&chain, &utxos, &bad, NOW), Err(BlockError::TimestampTooNew { .. })));

        let mut bad = block.clone();
        bad.header.timestamp = params.genesis_timestamp - params.timestamp_past_tolerance - 1;
        assert!(matches!(validator.validate_block(&chain, &utxos, &bad, NOW), Err(BlockError::TimestampTooOld { .. })));

        let mut bad = block.clone();
        bad.header.difficulty += 1;
        assert!(matches!(validator.validate_block(&chain, &utxos, &bad, NOW), Err(BlockError::InvalidDifficulty { .. })));

        let mut bad = block.clone();
        bad.header.nonce += 1;
        assert_eq!(validator.validate_block(&chain, &utxos, &bad, NOW), Err(BlockError::HashMismatch));

        let mut bad = block.clone();
        bad.hash = Hash256::new([0xff; 32]);
        assert_eq!(validator.validate_block(&chain, &utxos, &bad, NOW), Err(BlockError::HashMismatch));
    }

    #[test]
    fn test_insufficient_work_rejected() {
        let params = ConsensusParams { initial_difficulty: 40, ..ConsensusParams::default() };
        let validator = BlockValidator::new(&params);
        let genesis = Block::genesis(&params);
        let mut utxos = UtxoIndex::new();
        utxos.apply_block(&genesis);

        let coinbase = Transaction::coinbase(1, vec![TxOutput::new(1, Address::from_pubkey_hash([1; 20]))]);
        let header = BlockHeader::new(1, genesis.hash, NOW, 40);
        // Unmined: the hash is consistent but has no work behind it
        let block = Block::new(header, vec![coinbase]);

        assert_eq!(
            validator.validate_block(&[genesis], &utxos, &block, NOW),
            Err(BlockError::InvalidProofOfWork)
        );
    }

    #[test]
    fn test_coinbase_rules() {
        let params = params();
        let validator = BlockValidator::new(&params);
        let miner_addr = KeyPair::generate().address();
        let genesis = Block::genesis(&params);
        let mut utxos = UtxoIndex::new();
        utxos.apply_block(&genesis);
        let chain = vec![genesis];

        // Coinbase paying more than the reward
        let tip = chain.last().unwrap();
        let greedy = Transaction::coinbase(1, vec![TxOutput::new(params.block_reward + 1, miner_addr)]);
        let mut header = BlockHeader::new(1, tip.hash, NOW, params.next_difficulty(&chain));
        Miner::default().mine(&mut header, std::slice::from_ref(&greedy), || false);
        let block = Block::new(header, vec![greedy]);
        assert_eq!(
            validator.validate_block(&chain, &utxos, &block, NOW),
            Err(BlockError::ExcessiveCoinbase { paid: params.block_reward + 1, allowed: params.block_reward })
        );

        // Coinbase claiming another height
        let wrong_height = Transaction::coinbase(9, vec![TxOutput::new(1, miner_addr)]);
        let mut header = BlockHeader::new(1, tip.hash, NOW, params.next_difficulty(&chain));
        Miner::default().mine(&mut header, std::slice::from_ref(&wrong_height), || false);
        let block = Block::new(header, vec![wrong_height]);
        assert_eq!(
            validator.validate_block(&chain, &utxos, &block, NOW),
            Err(BlockError::InvalidCoinbaseHeight { expected: 1, got: 9 })
        );

        // Two coinbase transactions
        let a = Transaction::coinbase(1, vec![TxOutput::new(1, miner_addr)]);
        let b = Transaction::coinbase(1, vec![TxOutput::new(2, miner_addr)]);
        let mut header = BlockHeader::new(1, tip.hash, NOW, params.next_difficulty(&chain));
        let txs = vec![a, b];
        Miner::default().mine(&mut header, &txs, || false);
        let block = Block::new(header, txs);
        assert_eq!(validator.validate_block(&chain, &utxos, &block, NOW), Err(BlockError::MultipleCoinbase));
    }

    #[test]
    fn test_fees_raise_coinbase_allowance() {
        let params = params();
        let validator = BlockValidator::new(&params);
        let alice = KeyPair::generate();
        let genesis = Block::genesis(&params);
        let (mut utxos, coin) = funded(&alice, 1000);
        utxos.apply_block(&genesis);
        let chain = vec![genesis];

        let transfer = spend(&alice, coin, vec![TxOutput::new(990, alice.address())]);
        let coinbase = Transaction::coinbase(1, vec![
            TxOutput::new(params.block_reward, alice.address()),
            TxOutput::new(10, alice.address()),
        ]);
        let txs = vec![coinbase, transfer];
        let mut header = BlockHeader::new(1, chain[0].hash, NOW, params.next_difficulty(&chain));
        Miner::default().mine(&mut header, &txs, || false);
        let block = Block::new(header, txs);

        assert_eq!(validator.validate_block(&chain, &utxos, &block, NOW), Ok(10));
    }

    #[test]
    fn test_double_spend_inside_one_block() {
        let params = params();
        let validator = BlockValidator::new(&params);
        let alice = KeyPair::generate();
        let genesis = Block::genesis(&params);
        let (mut utxos, coin) = funded(&alice, 1000);
        utxos.apply_block(&genesis);
        let chain = vec![genesis];

        let first = spend(&alice, coin, vec![TxOutput::new(1000, alice.address())]);
        let second = spend(&alice, coin, vec![TxOutput::new(500, alice.address())]);
        let block = mine_on(&chain, &params, vec![first.clone(), second.clone()], alice.address());

        assert_eq!(
            validator.validate_block(&chain, &utxos, &block, NOW),
            Err(BlockError::InvalidTransaction {
                txid: second.id,
                source: TransactionError::DoubleSpend { outpoint: coin, spent_by: first.id },
            })
        );
    }

    #[test]
    fn test_genesis_must_match() {
        let params = params();
        let validator = BlockValidator::new(&params);
        let utxos = UtxoIndex::new();

        let genesis = Block::genesis(&params);
        assert_eq!(validator.validate_block(&[], &utxos, &genesis, NOW), Ok(0));

        let mut forged = genesis.clone();
        forged.transactions[0].outputs[0].amount += 1;
        assert_eq!(validator.validate_block(&[], &utxos, &forged, NOW), Err(BlockError::InvalidGenesis));
    }
}
