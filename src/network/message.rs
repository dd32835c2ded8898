// Network protocol messages

use crate::core::{
    Address, Block, Hash256, MAX_VAR_LEN, Serializable, Transaction, UnspentOutput, current_timestamp, read_hash,
    read_list, read_u8, read_u32, read_u64, read_var_str, write_list, write_var_str,
};
use std::io::{Cursor, Read};

pub const PROTOCOL_VERSION: u32 = 1;
pub const USER_AGENT: &str = concat!("utxo-node/", env!("CARGO_PKG_VERSION"));

/// Frame header: 12-byte command + 4-byte payload length
pub const HEADER_SIZE: usize = 16;
pub const MAX_PAYLOAD_SIZE: usize = MAX_VAR_LEN as usize;

/// Most blocks carried by one `chain` reply
pub const CHAIN_SEGMENT_BLOCKS: usize = 500;
/// Soft byte budget of one `chain` reply, well under `MAX_PAYLOAD_SIZE`
pub const CHAIN_SEGMENT_BYTES: usize = 4 * 1024 * 1024;

/// Network message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Version,
    Verack,
    Ping,
    Pong,
    GetLatest,
    Block,
    GetChain,
    Chain,
    Tx,
    TxStatus,
    GetUtxos,
    Utxos,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Version => "version",
            MessageType::Verack => "verack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::GetLatest => "getlatest",
            MessageType::Block => "block",
            MessageType::GetChain => "getchain",
            MessageType::Chain => "chain",
            MessageType::Tx => "tx",
            MessageType::TxStatus => "txstatus",
            MessageType::GetUtxos => "getutxos",
            MessageType::Utxos => "utxos",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "version" => Some(MessageType::Version),
            "verack" => Some(MessageType::Verack),
            "ping" => Some(MessageType::Ping),
            "pong" => Some(MessageType::Pong),
            "getlatest" => Some(MessageType::GetLatest),
            "block" => Some(MessageType::Block),
            "getchain" => Some(MessageType::GetChain),
            "chain" => Some(MessageType::Chain),
            "tx" => Some(MessageType::Tx),
            "txstatus" => Some(MessageType::TxStatus),
            "getutxos" => Some(MessageType::GetUtxos),
            "utxos" => Some(MessageType::Utxos),
            _ => None,
        }
    }
}

/// Version message, first on every connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub timestamp: u64,
    /// Random per-process value; lets a node recognise itself
    pub nonce: u64,
    pub best_height: u64,
    /// Where the sender accepts connections; empty for clients that don't
    pub listen_addr: String,
    pub user_agent: String,
}

impl VersionMessage {
    pub fn new(nonce: u64, best_height: u64, listen_addr: String) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            timestamp: current_timestamp(),
            nonce,
            best_height,
            listen_addr,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Outcome of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Accepted,
    AlreadyKnown,
    Rejected(String),
}

/// Network message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetLatest,
    Block(Block),
    /// Ask for the canonical chain starting at block `from`
    GetChain { from: u64 },
    /// One segment of the chain; empty past the sender's tip
    Chain(Vec<Block>),
    Tx(Transaction),
    TxStatus { txid: Hash256, status: TxStatus },
    GetUtxos(Address),
    Utxos(Vec<UnspentOutput>),
}

impl Message {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Version(_) => MessageType::Version,
            Message::Verack => MessageType::Verack,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::GetLatest => MessageType::GetLatest,
            Message::Block(_) => MessageType::Block,
            Message::GetChain { .. } => MessageType::GetChain,
            Message::Chain(_) => MessageType::Chain,
            Message::Tx(_) => MessageType::Tx,
            Message::TxStatus { .. } => MessageType::TxStatus,
            Message::GetUtxos(_) => MessageType::GetUtxos,
            Message::Utxos(_) => MessageType::Utxos,
        }
    }

    /// Serialize message to a complete frame. Fails when the payload
    /// exceeds `MAX_PAYLOAD_SIZE`, which no peer would accept.
    pub fn serialize(&self) -> Result<Vec<u8>, String> {
        let payload = self.serialize_payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(format!(
                "{} payload of {} bytes exceeds the {} byte limit",
                self.message_type().as_str(),
                payload.len(),
                MAX_PAYLOAD_SIZE
            ));
        }
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());

        // Message type (12 bytes, padded with zeros)
        let mut type_bytes = [0u8; 12];
        let name = self.message_type().as_str().as_bytes();
        type_bytes[..name.len()].copy_from_slice(name);
        bytes.extend_from_slice(&type_bytes);

        // Payload length
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());

        // Payload
        bytes.extend_from_slice(&payload);

        Ok(bytes)
    }

    /// Serialize message payload
    fn serialize_payload(&self) -> Vec<u8> {
        match self {
            Message::Version(v) => {
                let mut bytes = Vec::new();
                bytes.extend_from_slice(&v.version.to_le_bytes());
                bytes.extend_from_slice(&v.timestamp.to_le_bytes());
                bytes.extend_from_slice(&v.nonce.to_le_bytes());
                bytes.extend_from_slice(&v.best_height.to_le_bytes());
                write_var_str(&mut bytes, &v.listen_addr).expect("write to Vec");
                write_var_str(&mut bytes, &v.user_agent).expect("write to Vec");
                bytes
            }
            Message::Verack | Message::GetLatest => Vec::new(),
            Message::Ping(nonce) | Message::Pong(nonce) | Message::GetChain { from: nonce } => {
                nonce.to_le_bytes().to_vec()
            }
            Message::Block(block) => block.serialize(),
            Message::Chain(blocks) => {
                let mut bytes = Vec::new();
                write_list(&mut bytes, blocks).expect("write to Vec");
                bytes
            }
            Message::Tx(tx) => tx.serialize(),
            Message::TxStatus { txid, status } => {
                let mut bytes = txid.as_bytes().to_vec();
                let (code, reason) = match status {
                    TxStatus::Accepted => (0u8, ""),
                    TxStatus::AlreadyKnown => (1, ""),
                    TxStatus::Rejected(reason) => (2, reason.as_str()),
                };
                bytes.push(code);
                write_var_str(&mut bytes, reason).expect("write to Vec");
                bytes
            }
            Message::GetUtxos(address) => address.pubkey_hash().to_vec(),
            Message::Utxos(utxos) => {
                let mut bytes = Vec::new();
                write_list(&mut bytes, utxos).expect("write to Vec");
                bytes
            }
        }
    }

    /// Parse a frame header into its command and payload length
    pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(MessageType, usize), String> {
        let msg_type_str = std::str::from_utf8(&header[0..12])
            .map_err(|e| format!("Invalid message type: {}", e))?
            .trim_end_matches('\0');

        let msg_type = MessageType::from_string(msg_type_str)
            .ok_or_else(|| format!("Unknown message type: {}", msg_type_str))?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[12..16]);
        let payload_len = u32::from_le_bytes(len_bytes) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(format!("Payload too large: {} bytes", payload_len));
        }

        Ok((msg_type, payload_len))
    }

    /// Deserialize a complete frame
    pub fn deserialize(data: &[u8]) -> Result<Self, String> {
        let header: &[u8; HEADER_SIZE] = data
            .get(..HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or("Message too short")?;
        let (msg_type, payload_len) = Self::parse_header(header)?;

        if data.len() != HEADER_SIZE + payload_len {
            return Err("Payload length does not match frame".to_string());
        }

        Self::decode_payload(msg_type, &data[HEADER_SIZE..])
    }

    /// Decode the payload of a message of the given type
    pub fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<Self, String> {
        let mut reader = Cursor::new(payload);

        let message = match msg_type {
            MessageType::Version => Message::Version(VersionMessage {
                version: read_u32(&mut reader)?,
                timestamp: read_u64(&mut reader)?,
                nonce: read_u64(&mut reader)?,
                best_height: read_u64(&mut reader)?,
                listen_addr: read_var_str(&mut reader)?,
                user_agent: read_var_str(&mut reader)?,
            }),
            MessageType::Verack => Message::Verack,
            MessageType::Ping => Message::Ping(read_u64(&mut reader)?),
            MessageType::Pong => Message::Pong(read_u64(&mut reader)?),
            MessageType::GetLatest => Message::GetLatest,
            MessageType::Block => Message::Block(Block::from_reader(&mut reader)?),
            MessageType::GetChain => Message::GetChain {
                from: read_u64(&mut reader)?,
            },
            MessageType::Chain => Message::Chain(read_list(&mut reader)?),
            MessageType::Tx => Message::Tx(Transaction::from_reader(&mut reader)?),
            MessageType::TxStatus => {
                let txid = read_hash(&mut reader)?;
                let code = read_u8(&mut reader)?;
                let reason = read_var_str(&mut reader)?;
                let status = match code {
                    0 => TxStatus::Accepted,
                    1 => TxStatus::AlreadyKnown,
                    2 => TxStatus::Rejected(reason),
                    other => return Err(format!("Unknown transaction status: {}", other)),
                };
                Message::TxStatus { txid, status }
            }
            MessageType::GetUtxos => {
                let mut hash = [0u8; 20];
                reader.read_exact(&mut hash).map_err(|e| e.to_string())?;
                Message::GetUtxos(Address::from_pubkey_hash(hash))
            }
            MessageType::Utxos => Message::Utxos(read_list(&mut reader)?),
        };

        if reader.position() as usize != payload.len() {
            return Err(format!("Trailing bytes in {} payload", msg_type.as_str()));
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusParams;

    fn round_trip(message: Message) {
        let decoded = Message::deserialize(&message.serialize().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::GetLatest.as_str(), "getlatest");
        assert_eq!(MessageType::from_string("txstatus"), Some(MessageType::TxStatus));
        assert_eq!(MessageType::from_string("inv"), None);
    }

    #[test]
    fn test_frame_layout() {
        let frame = Message::Ping(7).serialize().unwrap();
        assert_eq!(&frame[..4], b"ping");
        assert!(frame[4..12].iter().all(|b| *b == 0));
        assert_eq!(&frame[12..16], &8u32.to_le_bytes());
        assert_eq!(frame.len(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_payload_messages() {
        round_trip(Message::Version(VersionMessage::new(42, 3, "127.0.0.1:9000".to_string())));
        round_trip(Message::Block(Block::genesis(&ConsensusParams::default())));
        round_trip(Message::GetChain { from: 12 });
        round_trip(Message::Chain(vec![Block::genesis(&ConsensusParams::default())]));
        round_trip(Message::TxStatus {
            txid: Hash256::new([5; 32]),
            status: TxStatus::Rejected("Insufficient funds".to_string()),
        });
        round_trip(Message::GetUtxos(Address::from_pubkey_hash([6; 20])));
        round_trip(Message::Utxos(vec![UnspentOutput {
            txid: Hash256::new([1; 32]),
            output_index: 2,
            amount: 300,
        }]));
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let mut frame = Message::GetLatest.serialize().unwrap();
        frame.push(0);
        assert!(Message::deserialize(&frame).is_err());

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(b"tx\0\0");
        header[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Message::parse_header(&header).is_err());

        let mut unknown = Message::Verack.serialize().unwrap();
        unknown[..6].copy_from_slice(b"bogus!");
        assert!(Message::deserialize(&unknown).is_err());
    }

    #[test]
    fn test_refuses_oversized_payload() {
        let utxo = UnspentOutput {
            txid: Hash256::new([1; 32]),
            output_index: 0,
            amount: 1,
        };
        // 44 bytes each, just past the frame limit
        let count = MAX_PAYLOAD_SIZE / 44 + 1;
        let message = Message::Utxos(vec![utxo; count]);
        assert!(message.serialize().is_err());
    }
}
