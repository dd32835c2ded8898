// Proof of Work implementation

use crate::core::{Block, BlockHeader, Hash256, Transaction};
use std::time::{Duration, Instant};

/// Nonce attempts between checks of the abandon condition
pub const DEFAULT_POLL_INTERVAL: u64 = 4096;

/// Proof of Work miner
///
/// Searches nonces from zero upward until the block hash has the header's
/// number of leading zero bits. The search is cooperative: every
/// `poll_interval` attempts it asks the caller whether to give up.
#[derive(Debug, Clone)]
pub struct Miner {
    poll_interval: u64,
}

impl Default for Miner {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Miner {
    pub fn new(poll_interval: u64) -> Self {
        Self {
            poll_interval: poll_interval.max(1),
        }
    }

    /// Mine a block body by finding a valid nonce.
    /// On success `header.nonce` holds the winning nonce.
    pub fn mine<F>(
        &self,
        header: &mut BlockHeader,
        transactions: &[Transaction],
        should_abandon: F,
    ) -> MiningResult
    where
        F: Fn() -> bool,
    {
        let start_time = Instant::now();
        let hasher = Block::hasher(header, transactions);
        let mut attempts = 0u64;

        for nonce in 0..=u64::MAX {
            let hash = hasher.finish(&nonce.to_le_bytes());
            attempts += 1;

            if hash.meets_difficulty(header.difficulty) {
                header.nonce = nonce;
                return MiningResult {
                    success: true,
                    nonce,
                    hash,
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            if attempts % self.poll_interval == 0 {
                if should_abandon() {
                    log::debug!("Abandoning search for block {} after {} attempts", header.index, attempts);
                    break;
                }

                // Progress indicator every 256 polls
                if attempts % (self.poll_interval * 256) == 0 {
                    let elapsed = start_time.elapsed();
                    log::debug!("Mining attempts: {} ({:.1} KH/s)",
                        attempts,
                        attempts as f64 / elapsed.as_secs_f64() / 1000.0
                    );
                }
            }
        }

        MiningResult {
            success: false,
            nonce: 0,
            hash: Hash256::zero(),
            attempts,
            duration: start_time.elapsed(),
        }
    }

    /// Verify that a block satisfies its own stated difficulty
    pub fn verify(block: &Block) -> bool {
        block.hash.meets_difficulty(block.header.difficulty)
    }
}

/// Mining result
#[derive(Debug)]
pub struct MiningResult {
    /// Whether a nonce was found (false when abandoned)
    pub success: bool,
    pub nonce: u64,
    pub hash: Hash256,
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    /// Calculate hash rate (hashes per second)
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, TxOutput};
    use std::cell::Cell;

    fn body() -> (BlockHeader, Vec<Transaction>) {
        let coinbase = Transaction::coinbase(
            1,
            vec![TxOutput::new(50, Address::from_pubkey_hash([5; 20]))],
        );
        (BlockHeader::new(1, Hash256::new([2; 32]), 1_700_000_000, 8), vec![coinbase])
    }

    #[test]
    fn test_pow_mining_easy() {
        let (mut header, txs) = body();
        let result = Miner::default().mine(&mut header, &txs, || false);

        assert!(result.success);
        assert_eq!(header.nonce, result.nonce);

        let block = Block::new(header, txs);
        assert_eq!(block.hash, result.hash);
        assert!(Miner::verify(&block));
    }

    #[test]
    fn test_zero_difficulty_accepts_first_nonce() {
        let (mut header, txs) = body();
        header.difficulty = 0;
        let result = Miner::default().mine(&mut header, &txs, || false);
        assert!(result.success);
        assert_eq!(result.nonce, 0);
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_search_is_abandoned_cooperatively() {
        let (mut header, txs) = body();
        // Unreachable target: only the abandon check can end the search
        header.difficulty = 255;
        let polls = Cell::new(0);

        let result = Miner::new(16).mine(&mut header, &txs, || {
            polls.set(polls.get() + 1);
            polls.get() >= 3
        });

        assert!(!result.success);
        assert_eq!(polls.get(), 3);
        assert_eq!(result.attempts, 48);
    }

    #[test]
    fn test_verify_rejects_unmined_block() {
        let (mut header, txs) = body();
        header.difficulty = 64;
        let block = Block::new(header, txs);
        assert!(!Miner::verify(&block));
    }
}
