// Transaction data structures

use crate::core::{Address, Amount, Hash256, Serializable, TxSigner, hash256};
use crate::core::serialize::{
    read_hash, read_list, read_u8, read_u32, read_u64, read_var_bytes,
    write_list, write_var_bytes, write_varint,
};
use std::fmt;
use std::io::{Read, Write};

const KIND_COINBASE: u8 = 0;
const KIND_REGULAR: u8 = 1;

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// Serialize to bytes for database key
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(36);
        bytes.extend_from_slice(self.txid.as_bytes());
        bytes.extend_from_slice(&self.index.to_le_bytes());
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != 36 {
            return Err(format!("Invalid outpoint bytes length: {}", bytes.len()));
        }

        let txid = Hash256::from_slice(&bytes[0..32])?;

        let mut index_bytes = [0u8; 4];
        index_bytes.copy_from_slice(&bytes[32..36]);
        let index = u32::from_le_bytes(index_bytes);

        Ok(Self { txid, index })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Transaction input - spends a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    /// Unlocking script; empty until signed
    pub signature: Vec<u8>,
}

impl TxInput {
    /// Create an unsigned input
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            signature: Vec::new(),
        }
    }
}

impl Serializable for TxInput {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36 + 1 + self.signature.len());
        buf.extend_from_slice(&self.previous_output.to_bytes());
        write_var_bytes(&mut buf, &self.signature).expect("write to Vec");
        buf
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, String> {
        let txid = read_hash(reader)?;
        let index = read_u32(reader)?;
        let signature = read_var_bytes(reader)?;
        Ok(Self {
            previous_output: OutPoint::new(txid, index),
            signature,
        })
    }
}

/// Transaction output - amount payable to an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: Amount,
    pub address: Address,
}

impl TxOutput {
    pub fn new(amount: Amount, address: Address) -> Self {
        Self { amount, address }
    }
}

impl Serializable for TxOutput {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(self.address.pubkey_hash());
        buf
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, String> {
        let amount = read_u64(reader)?;
        let mut hash = [0u8; 20];
        reader.read_exact(&mut hash).map_err(|e| e.to_string())?;
        Ok(Self {
            amount,
            address: Address::from_pubkey_hash(hash),
        })
    }
}

/// Coinbase vs. regular transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    /// Block reward; `height` is the index of the block that carries it,
    /// which keeps every coinbase id distinct.
    Coinbase { height: u64 },
    /// Transfer spending earlier outputs
    Regular { inputs: Vec<TxInput> },
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Content hash of kind, referenced outpoints and outputs
    pub id: Hash256,
    pub kind: TransactionKind,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create an unsigned regular transaction
    pub fn new(previous_outputs: Vec<OutPoint>, outputs: Vec<TxOutput>) -> Self {
        let inputs = previous_outputs.into_iter().map(TxInput::new).collect();
        Self::with_kind(TransactionKind::Regular { inputs }, outputs)
    }

    /// Create a coinbase transaction for the block at `height`
    pub fn coinbase(height: u64, outputs: Vec<TxOutput>) -> Self {
        Self::with_kind(TransactionKind::Coinbase { height }, outputs)
    }

    fn with_kind(kind: TransactionKind, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            id: Hash256::zero(),
            kind,
            outputs,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TransactionKind::Coinbase { .. })
    }

    /// Inputs of a regular transaction; empty for coinbase
    pub fn inputs(&self) -> &[TxInput] {
        match &self.kind {
            TransactionKind::Coinbase { .. } => &[],
            TransactionKind::Regular { inputs } => inputs,
        }
    }

    /// Recompute the content hash. Signatures are excluded since they sign it.
    pub fn compute_id(&self) -> Hash256 {
        let mut buf = Vec::new();
        match &self.kind {
            TransactionKind::Coinbase { height } => {
                buf.push(KIND_COINBASE);
                buf.extend_from_slice(&height.to_le_bytes());
            }
            TransactionKind::Regular { inputs } => {
                buf.push(KIND_REGULAR);
                write_varint(&mut buf, inputs.len() as u64).expect("write to Vec");
                for input in inputs {
                    buf.extend_from_slice(&input.previous_output.to_bytes());
                }
            }
        }
        write_list(&mut buf, &self.outputs).expect("write to Vec");
        hash256(&buf)
    }

    /// Sign every input with one signer (all inputs owned by the same address)
    pub fn sign_all(&mut self, signer: &dyn TxSigner) -> Result<(), String> {
        let script_sig = signer.sign(&self.id)?;
        if let TransactionKind::Regular { inputs } = &mut self.kind {
            for input in inputs.iter_mut() {
                input.signature = script_sig.clone();
            }
        }
        Ok(())
    }

    /// Total output value, `None` on overflow
    pub fn total_output_value(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }
}

impl Serializable for Transaction {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_all(self.id.as_bytes()).expect("write to Vec");

        match &self.kind {
            TransactionKind::Coinbase { height } => {
                buf.push(KIND_COINBASE);
                buf.extend_from_slice(&height.to_le_bytes());
            }
            TransactionKind::Regular { inputs } => {
                buf.push(KIND_REGULAR);
                write_list(&mut buf, inputs).expect("write to Vec");
            }
        }

        write_list(&mut buf, &self.outputs).expect("write to Vec");
        buf
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, String> {
        let id = read_hash(reader)?;

        let kind = match read_u8(reader)? {
            KIND_COINBASE => TransactionKind::Coinbase {
                height: read_u64(reader)?,
            },
            KIND_REGULAR => TransactionKind::Regular {
                inputs: read_list(reader)?,
            },
            other => return Err(format!("Unknown transaction kind: {}", other)),
        };

        let outputs = read_list(reader)?;

        Ok(Self { id, kind, outputs })
    }
}

/// Spendable output as reported to wallets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub txid: Hash256,
    pub output_index: u32,
    pub amount: Amount,
}

impl UnspentOutput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.output_index)
    }
}

impl Serializable for UnspentOutput {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = self.outpoint().to_bytes();
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, String> {
        Ok(Self {
            txid: read_hash(reader)?,
            output_index: read_u32(reader)?,
            amount: read_u64(reader)?,
        })
    }
}
