// Consensus parameters and difficulty schedule

use crate::core::{Amount, Block};

/// Every node on a network must run with identical parameters; the genesis
/// block is derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusParams {
    /// Fixed coinbase reward per block
    pub block_reward: Amount,
    /// Difficulty of genesis and of every block until the first adjustment
    pub initial_difficulty: u32,
    /// Blocks between difficulty adjustments
    pub difficulty_adjustment_interval: u64,
    /// Target seconds per block
    pub target_block_time: u64,
    /// How far a timestamp may precede its parent's
    pub timestamp_past_tolerance: u64,
    /// How far a timestamp may run ahead of the local clock
    pub timestamp_future_tolerance: u64,
    /// Pool transactions per block, excluding the coinbase
    pub max_block_transactions: usize,
    pub genesis_timestamp: u64,
    pub genesis_allocation: Amount,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            block_reward: 5_000_000_000,
            initial_difficulty: 16,
            difficulty_adjustment_interval: 10,
            target_block_time: 10,
            timestamp_past_tolerance: 60,
            timestamp_future_tolerance: 60,
            max_block_transactions: 100,
            genesis_timestamp: 1_465_154_705,
            genesis_allocation: 5_000_000_000,
        }
    }
}

impl ConsensusParams {
    /// Difficulty the block at `chain.len()` must carry, given the chain
    /// preceding it (genesis included, never empty).
    ///
    /// Adjusts at positive multiples of the interval by comparing the time
    /// spanned by the previous `interval` blocks with the target; windows
    /// that start at genesis inherit, since the genesis timestamp is fixed.
    pub fn next_difficulty(&self, chain: &[Block]) -> u32 {
        let Some(last) = chain.last() else {
            return self.initial_difficulty;
        };

        let next_index = chain.len() as u64;
        let interval = self.difficulty_adjustment_interval;
        if interval == 0 || next_index % interval != 0 || next_index <= interval {
            return last.header.difficulty;
        }

        let first = &chain[(next_index - interval) as usize];
        let elapsed = last.header.timestamp.saturating_sub(first.header.timestamp);
        let expected = interval * self.target_block_time;

        let current = last.header.difficulty;
        let next = if elapsed < expected / 2 {
            current.saturating_add(1)
        } else if elapsed > expected * 2 {
            current.saturating_sub(1)
        } else {
            current
        };

        if next != current {
            log::info!(
                "Difficulty adjusted from {} to {} at block {} (took {}s, expected {}s)",
                current, next, next_index, elapsed, expected
            );
        }
        next
    }
}

/// Work represented by one block of the given difficulty
pub fn block_work(difficulty: u32) -> u128 {
    1u128.checked_shl(difficulty).unwrap_or(u128::MAX)
}

/// Cumulative proof-of-work of a chain
pub fn chain_work(chain: &[Block]) -> u128 {
    chain
        .iter()
        .fold(0u128, |acc, block| acc.saturating_add(block_work(block.header.difficulty)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockHeader, Hash256};

    fn chain_with_spacing(params: &ConsensusParams, len: usize, spacing: u64) -> Vec<Block> {
        let mut chain = vec![Block::genesis(params)];
        let start = 1_700_000_000;
        for i in 1..len {
            let header = BlockHeader::new(
                i as u64,
                Hash256::zero(),
                start + i as u64 * spacing,
                params.initial_difficulty,
            );
            chain.push(Block::new(header, vec![]));
        }
        chain
    }

    #[test]
    fn test_difficulty_inherited_between_adjustments() {
        let params = ConsensusParams { initial_difficulty: 5, ..ConsensusParams::default() };
        let chain = chain_with_spacing(&params, 13, 1);
        assert_eq!(params.next_difficulty(&chain), 5);
    }

    #[test]
    fn test_first_window_from_genesis_inherits() {
        let params = ConsensusParams { initial_difficulty: 5, ..ConsensusParams::default() };
        let chain = chain_with_spacing(&params, 10, 1);
        assert_eq!(params.next_difficulty(&chain), 5);
    }

    #[test]
    fn test_difficulty_rises_when_blocks_are_fast() {
        let params = ConsensusParams { initial_difficulty: 5, ..ConsensusParams::default() };
        let chain = chain_with_spacing(&params, 20, 1);
        assert_eq!(params.next_difficulty(&chain), 6);
    }

    #[test]
    fn test_difficulty_falls_when_blocks_are_slow() {
        let params = ConsensusParams { initial_difficulty: 5, ..ConsensusParams::default() };
        let chain = chain_with_spacing(&params, 20, 100);
        assert_eq!(params.next_difficulty(&chain), 4);
    }

    #[test]
    fn test_difficulty_unchanged_near_target() {
        let params = ConsensusParams { initial_difficulty: 5, ..ConsensusParams::default() };
        let chain = chain_with_spacing(&params, 20, 10);
        assert_eq!(params.next_difficulty(&chain), 5);
    }

    #[test]
    fn test_difficulty_clamped_at_zero() {
        let params = ConsensusParams { initial_difficulty: 0, ..ConsensusParams::default() };
        let chain = chain_with_spacing(&params, 20, 1000);
        assert_eq!(params.next_difficulty(&chain), 0);
    }

    #[test]
    fn test_chain_work_sums_powers_of_two() {
        let params = ConsensusParams { initial_difficulty: 3, ..ConsensusParams::default() };
        let chain = chain_with_spacing(&params, 4, 10);
        assert_eq!(chain_work(&chain), 4 * 8);
        assert_eq!(block_work(200), u128::MAX);
    }
}
