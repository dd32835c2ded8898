// Addresses: hash160 of a compressed public key, Base58Check encoded

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::core::{hash160, hash256};

/// Version byte prefixed before the key hash
const ADDRESS_VERSION: u8 = 0x00;
/// version (1) + hash (20) + checksum (4)
const ENCODED_LEN: usize = 25;

/// Owner of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Create address from a public key hash
    pub fn from_pubkey_hash(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Derive the address owning a serialized public key
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        Self(hash160(pubkey))
    }

    pub fn pubkey_hash(&self) -> &[u8; 20] {
        &self.0
    }

    fn checksum(payload: &[u8]) -> [u8; 4] {
        let digest = hash256(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&digest.as_bytes()[..4]);
        checksum
    }

    /// Base58Check text form
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(ENCODED_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(&self.0);
        let checksum = Self::checksum(&payload);
        payload.extend_from_slice(&checksum);
        bs58::encode(payload).into_string()
    }

    pub fn decode(text: &str) -> Result<Self, String> {
        let bytes = bs58::decode(text)
            .into_vec()
            .map_err(|e| format!("Invalid address encoding: {}", e))?;

        if bytes.len() != ENCODED_LEN {
            return Err(format!("Invalid address length: {}", bytes.len()));
        }
        if bytes[0] != ADDRESS_VERSION {
            return Err(format!("Unknown address version: {}", bytes[0]));
        }
        if Self::checksum(&bytes[..21])[..] != bytes[21..] {
            return Err("Address checksum mismatch".to_string());
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[1..21]);
        Ok(Self(hash))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.encode()
    }
}
