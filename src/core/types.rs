// Basic types for the ledger

use std::fmt;
use std::str::FromStr;

/// Smallest indivisible unit of value.
pub type Amount = u64;

/// 256-bit hash type (32 bytes)
/// Used for block hashes and transaction IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// Create a new Hash256 from a byte array
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a Hash256 from a slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, String> {
        if slice.len() != 32 {
            return Err(format!("Invalid hash length: expected 32, got {}", slice.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the hash as a byte slice
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create zero hash (genesis previous-hash sentinel)
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Number of leading zero bits, most significant byte first
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// True when the leading `difficulty` bits are all zero
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.leading_zero_bits() >= difficulty
    }

    /// Lowercase hex in natural byte order
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64 character hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| format!("Invalid hex string: {}", e))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Current Unix time in seconds
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
