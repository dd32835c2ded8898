// Wallet: key pairs, keystore and transaction building

mod keystore;
mod tx_builder;

pub use keystore::{KeyPair, Keystore};
pub use tx_builder::TransactionBuilder;

use crate::core::Amount;
use thiserror::Error;

/// Flat fee attached to every payment
pub const DEFAULT_FEE: Amount = 1;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("Payment amount must be positive")]
    ZeroAmount,
    #[error("Amount overflow")]
    AmountOverflow,
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Keystore error: {0}")]
    Keystore(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
