// Input unlocking scripts: <sig> <pubkey>, checked against the owning address

use crate::core::{Address, Hash256};
use secp256k1::{Secp256k1, Message, PublicKey, ecdsa::Signature};

/// Signing capability consumed by the core.
///
/// Key material lives with the implementor; the core only ever sees the
/// unlocking script produced for a transaction id.
pub trait TxSigner {
    /// Address whose outputs this signer can spend
    fn address(&self) -> Address;

    /// Produce the unlocking script for `txid`
    fn sign(&self, txid: &Hash256) -> Result<Vec<u8>, String>;
}

/// Unlocking script helpers
pub struct Script;

impl Script {
    /// Build an unlocking script
    /// <sig len> <DER signature> <pubkey len> <compressed pubkey>
    pub fn unlocking(signature: &[u8], pubkey: &[u8]) -> Vec<u8> {
        let mut script = Vec::with_capacity(2 + signature.len() + pubkey.len());

        // Push signature
        script.push(signature.len() as u8);
        script.extend_from_slice(signature);

        // Push pubkey
        script.push(pubkey.len() as u8);
        script.extend_from_slice(pubkey);

        script
    }

    /// Verification capability: does `script_sig` prove ownership of
    /// `address` for the transaction `txid`?
    pub fn verify(address: &Address, txid: &Hash256, script_sig: &[u8]) -> bool {
        let Ok((signature, pubkey)) = Self::parse_script_sig(script_sig) else {
            return false;
        };

        // Step 1: the key must hash to the owning address
        if Address::from_pubkey(&pubkey) != *address {
            return false;
        }

        // Step 2: the signature must cover this transaction id
        Self::verify_signature(&signature, &pubkey, txid.as_bytes()).unwrap_or(false)
    }

    /// Parse scriptSig: <sig> <pubkey>
    fn parse_script_sig(script_sig: &[u8]) -> Result<(Vec<u8>, Vec<u8>), String> {
        if script_sig.is_empty() {
            return Err("Empty scriptSig".to_string());
        }

        let mut pos = 0;

        // Read signature
        let sig_len = script_sig[pos] as usize;
        pos += 1;

        if pos + sig_len > script_sig.len() {
            return Err("Invalid signature length".to_string());
        }

        let signature = script_sig[pos..pos + sig_len].to_vec();
        pos += sig_len;

        // Read pubkey
        if pos >= script_sig.len() {
            return Err("Missing pubkey".to_string());
        }

        let pubkey_len = script_sig[pos] as usize;
        pos += 1;

        if pos + pubkey_len != script_sig.len() {
            return Err("Invalid pubkey length".to_string());
        }

        let pubkey = script_sig[pos..pos + pubkey_len].to_vec();

        Ok((signature, pubkey))
    }

    /// Verify ECDSA signature
    fn verify_signature(
        signature: &[u8],
        pubkey: &[u8],
        message: &[u8; 32],
    ) -> Result<bool, String> {
        let secp = Secp256k1::verification_only();

        let pubkey = PublicKey::from_slice(pubkey)
            .map_err(|e| format!("Invalid public key: {}", e))?;

        let signature = Signature::from_der(signature)
            .map_err(|e| format!("Invalid signature: {}", e))?;

        let message = Message::from_digest(*message);

        Ok(secp.verify_ecdsa(&message, &signature, &pubkey).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};
    use secp256k1::rand::rngs::OsRng;

    fn signed_script(secret_key: &SecretKey, txid: &Hash256) -> (Address, Vec<u8>) {
        let secp = Secp256k1::new();
        let pubkey_bytes = secret_key.public_key(&secp).serialize();
        let message = Message::from_digest(*txid.as_bytes());
        let signature = secp.sign_ecdsa(&message, secret_key);
        let script_sig = Script::unlocking(&signature.serialize_der(), &pubkey_bytes);
        (Address::from_pubkey(&pubkey_bytes), script_sig)
    }

    #[test]
    fn test_script_sig_layout() {
        let signature = vec![1, 2, 3, 4];
        let pubkey = vec![5, 6, 7, 8];

        let script_sig = Script::unlocking(&signature, &pubkey);

        assert_eq!(script_sig[0], 4); // sig length
        assert_eq!(&script_sig[1..5], &signature[..]);
        assert_eq!(script_sig[5], 4); // pubkey length
        assert_eq!(&script_sig[6..10], &pubkey[..]);
    }

    #[test]
    fn test_verify_owner_signature() {
        let secret_key = SecretKey::new(&mut OsRng);
        let txid = Hash256::new([0x42; 32]);
        let (address, script_sig) = signed_script(&secret_key, &txid);

        assert!(Script::verify(&address, &txid, &script_sig));
        // Same signature over a different transaction id
        assert!(!Script::verify(&address, &Hash256::new([0x43; 32]), &script_sig));
    }

    #[test]
    fn test_verify_wrong_owner() {
        let owner = SecretKey::new(&mut OsRng);
        let thief = SecretKey::new(&mut OsRng);
        let txid = Hash256::new([7; 32]);

        let (owner_address, _) = signed_script(&owner, &txid);
        let (_, thief_script) = signed_script(&thief, &txid);

        // Valid signature, but the key does not hash to the owning address
        assert!(!Script::verify(&owner_address, &txid, &thief_script));
    }

    #[test]
    fn test_verify_garbage_script() {
        let address = Address::from_pubkey_hash([1; 20]);
        let txid = Hash256::zero();
        assert!(!Script::verify(&address, &txid, &[]));
        assert!(!Script::verify(&address, &txid, &[10, 1, 2]));
    }
}
