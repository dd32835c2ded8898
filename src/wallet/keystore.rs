// Key management

use crate::core::{Address, Hash256, Script, TxSigner};
use crate::wallet::WalletError;
use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Serializable key pair (for storage)
#[derive(Serialize, Deserialize)]
struct SerializableKeyPair {
    secret_key: String,
}

/// Key pair
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
    address: Address,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(&secp, secret_key)
    }

    /// Create from secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| WalletError::Keystore(format!("Invalid secret key: {}", e)))?;
        Ok(Self::from_secret_key(&secp, secret_key))
    }

    fn from_secret_key<C: secp256k1::Signing>(secp: &Secp256k1<C>, secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key(secp);
        let address = Address::from_pubkey(&public_key.serialize());
        Self {
            secret_key,
            public_key,
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Get compressed public key bytes
    pub fn pubkey_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    fn to_serializable(&self) -> SerializableKeyPair {
        SerializableKeyPair {
            secret_key: hex::encode(self.secret_key.secret_bytes()),
        }
    }
}

impl TxSigner for KeyPair {
    fn address(&self) -> Address {
        KeyPair::address(self)
    }

    fn sign(&self, txid: &Hash256) -> Result<Vec<u8>, String> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(*txid.as_bytes());
        let signature = secp.sign_ecdsa(&message, &self.secret_key);
        Ok(Script::unlocking(&signature.serialize_der(), &self.pubkey_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("address", &self.address).finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct SerializableKeystore {
    keys: BTreeMap<Address, SerializableKeyPair>,
    default_address: Option<Address>,
}

/// Keystore - manages multiple key pairs, saved as plain JSON
#[derive(Debug, Default)]
pub struct Keystore {
    keys: BTreeMap<Address, KeyPair>,
    default_address: Option<Address>,
}

impl Keystore {
    /// Create a new keystore
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the keystore at `path`, or start an empty one if it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Generate a new address
    pub fn new_address(&mut self) -> Address {
        let keypair = KeyPair::generate();
        let address = keypair.address;

        // Set as default if first address
        if self.default_address.is_none() {
            self.default_address = Some(address);
        }

        self.keys.insert(address, keypair);
        address
    }

    /// Get key pair for address
    pub fn get_keypair(&self, address: &Address) -> Option<&KeyPair> {
        self.keys.get(address)
    }

    /// Get all addresses
    pub fn list_addresses(&self) -> Vec<Address> {
        self.keys.keys().copied().collect()
    }

    /// Get default address
    pub fn default_address(&self) -> Option<&Address> {
        self.default_address.as_ref()
    }

    /// Count addresses
    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// Save keystore to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        let data = SerializableKeystore {
            keys: self
                .keys
                .iter()
                .map(|(addr, kp)| (*addr, kp.to_serializable()))
                .collect(),
            default_address: self.default_address,
        };

        let json = serde_json::to_string_pretty(&data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load keystore from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: SerializableKeystore = serde_json::from_str(&json)?;

        let mut keys = BTreeMap::new();
        for (addr, serializable_kp) in data.keys {
            let secret = hex::decode(&serializable_kp.secret_key)
                .map_err(|e| WalletError::Keystore(format!("Invalid secret key hex: {}", e)))?;
            let kp = KeyPair::from_secret_bytes(&secret)?;
            if kp.address != addr {
                return Err(WalletError::Keystore(format!("Key does not match address {}", addr)));
            }
            keys.insert(addr, kp);
        }

        Ok(Self {
            keys,
            default_address: data.default_address,
        })
    }
}
