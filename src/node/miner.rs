// Mining loop - cooperative proof-of-work against the shared ledger

use crate::consensus::Miner;
use crate::core::{Address, Block};
use crate::ledger::{BlockTemplate, LedgerError};
use crate::network::Message;
use crate::node::{Node, NodeError};
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Mining cancelled")]
    Cancelled,
    #[error("Mined block rejected: {0}")]
    Rejected(#[from] LedgerError),
    #[error("Mining task failed: {0}")]
    Task(String),
}

impl Node {
    /// Mine one block paying `reward_address`, append it and broadcast it.
    ///
    /// Candidates whose tip moves during the search are abandoned and
    /// rebuilt against the new tip.
    pub async fn mine(&self, reward_address: Address) -> Result<Block, NodeError> {
        loop {
            if self.is_shutting_down() {
                return Err(MiningError::Cancelled.into());
            }

            let node = self.clone();
            let mined = tokio::task::spawn_blocking(move || node.mine_candidate(reward_address))
                .await
                .map_err(|e| MiningError::Task(e.to_string()))??;

            if let Some(block) = mined {
                self.broadcast(Message::Block(block.clone())).await;
                return Ok(block);
            }
        }
    }

    /// Keep mining until shutdown
    pub fn spawn_miner(&self, reward_address: Address) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            log::info!("Mining to {}", reward_address);
            loop {
                match node.mine(reward_address).await {
                    Ok(_) => {}
                    Err(NodeError::Mining(MiningError::Cancelled)) => break,
                    Err(e) => {
                        log::error!("Mining failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            log::info!("Miner stopped");
        })
    }

    /// One search against the current tip. `None` when the tip moved first.
    /// Runs on the blocking pool.
    fn mine_candidate(&self, reward_address: Address) -> Result<Option<Block>, MiningError> {
        let template = self.inner.ledger.blocking_read().block_template(reward_address);
        match self.search(template)? {
            Some(block) => self.commit_mined(block),
            None => Ok(None),
        }
    }

    /// Nonce search over `template`, abandoned when the tip version moves
    fn search(&self, template: BlockTemplate) -> Result<Option<Block>, MiningError> {
        let tip_version = &self.inner.tip_version;
        let shutdown = self.inner.shutdown.subscribe();

        log::debug!(
            "Mining block {} at difficulty {} with {} transactions",
            template.header.index,
            template.header.difficulty,
            template.transactions.len()
        );

        let mut header = template.header;
        let result = Miner::new(self.inner.config.poll_interval).mine(&mut header, &template.transactions, || {
            tip_version.load(Ordering::Acquire) != template.tip_version || *shutdown.borrow()
        });

        if !result.success {
            if *shutdown.borrow() {
                return Err(MiningError::Cancelled);
            }
            log::debug!("Tip moved while mining block {}, rebuilding", header.index);
            return Ok(None);
        }

        log::debug!(
            "Solved block {} in {:.2}s, {} attempts ({:.1} KH/s)",
            header.index,
            result.duration.as_secs_f64(),
            result.attempts,
            result.hash_rate() / 1000.0
        );
        Ok(Some(Block::new(header, template.transactions)))
    }

    /// Append a solved block, unless its parent is no longer the tip
    fn commit_mined(&self, block: Block) -> Result<Option<Block>, MiningError> {
        let mut ledger = self.inner.ledger.blocking_write();
        if ledger.latest_block().hash != block.header.previous_hash {
            log::info!("Discarding stale block {} ({})", block.header.index, block.hash);
            return Ok(None);
        }
        let block = ledger.append_block(block)?.clone();
        drop(ledger);

        log::info!("Mined block {} ({})", block.header.index, block.hash);
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusParams;
    use crate::node::{BlockOutcome, NodeConfig};
    use crate::storage::Storage;
    use crate::wallet::KeyPair;

    fn node() -> Node {
        let config = NodeConfig {
            params: ConsensusParams {
                initial_difficulty: 8,
                ..ConsensusParams::default()
            },
            ..NodeConfig::default()
        };
        Node::with_storage(Storage::memory().unwrap(), config).unwrap()
    }

    #[tokio::test]
    async fn test_stale_block_is_discarded() {
        let ours = node();
        let theirs = node();
        let alice = KeyPair::generate().address();
        let competing = theirs.mine(KeyPair::generate().address()).await.unwrap();

        // Solve a candidate on genesis
        let template = ours.inner.ledger.read().await.block_template(alice);
        let miner = ours.clone();
        let solved = tokio::task::spawn_blocking(move || miner.search(template))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(solved.header.index, 1);

        // The competing block 1 lands before the solved one is committed
        assert_eq!(
            ours.receive_latest_block(None, competing.clone()).await.unwrap(),
            BlockOutcome::Appended
        );
        let miner = ours.clone();
        let committed = tokio::task::spawn_blocking(move || miner.commit_mined(solved))
            .await
            .unwrap()
            .unwrap();
        assert!(committed.is_none());
        assert_eq!(ours.latest_block().await, competing);

        // Mining resumes on the new tip
        let mined = ours.mine(alice).await.unwrap();
        assert_eq!(mined.header.index, 2);
        assert_eq!(mined.header.previous_hash, competing.hash);
        assert_eq!(ours.height().await, 2);
    }
}
