// Transaction builder

use crate::core::{Address, Amount, OutPoint, Transaction, TxOutput, TxSigner, UnspentOutput};
use crate::wallet::{DEFAULT_FEE, WalletError};

/// Builds signed payments from a signer's unspent outputs
pub struct TransactionBuilder<'a> {
    signer: &'a dyn TxSigner,
    fee: Amount,
}

impl<'a> TransactionBuilder<'a> {
    /// Create a new transaction builder paying the default fee
    pub fn new(signer: &'a dyn TxSigner) -> Self {
        Self {
            signer,
            fee: DEFAULT_FEE,
        }
    }

    pub fn with_fee(mut self, fee: Amount) -> Self {
        self.fee = fee;
        self
    }

    /// Build a transaction paying `amount` to `to`, returning change to the
    /// signer's address
    pub fn build(
        &self,
        unspent: &[UnspentOutput],
        to: Address,
        amount: Amount,
    ) -> Result<Transaction, WalletError> {
        if amount == 0 {
            return Err(WalletError::ZeroAmount);
        }

        let target = amount.checked_add(self.fee).ok_or(WalletError::AmountOverflow)?;
        let (selected, total_input) = Self::select_utxos(unspent, target)?;

        // Payment output
        let mut outputs = vec![TxOutput::new(amount, to)];

        // Change output (if any)
        let change = total_input - target;
        if change > 0 {
            outputs.push(TxOutput::new(change, self.signer.address()));
        }

        let mut tx = Transaction::new(selected, outputs);
        tx.sign_all(self.signer).map_err(WalletError::Signing)?;

        Ok(tx)
    }

    /// Select UTXOs in the given order until they cover `target`
    fn select_utxos(
        unspent: &[UnspentOutput],
        target: Amount,
    ) -> Result<(Vec<OutPoint>, Amount), WalletError> {
        let mut selected = Vec::new();
        let mut total: Amount = 0;

        for utxo in unspent {
            selected.push(utxo.outpoint());
            total = total.saturating_add(utxo.amount);

            if total >= target {
                return Ok((selected, total));
            }
        }

        Err(WalletError::InsufficientFunds {
            available: total,
            required: target,
        })
    }
}
