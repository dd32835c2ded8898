// Consensus rules, proof of work and validation

mod params;
pub mod pow;
pub mod validation;

pub use params::{ConsensusParams, block_work, chain_work};
pub use pow::{Miner, MiningResult};
pub use validation::{BlockError, BlockValidator, TransactionError, TransactionValidator};
