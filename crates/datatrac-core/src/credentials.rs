//! Credential sealing for data-source passwords.
//!
//! Passwords are stored as `hex(nonce || AES-256-GCM ciphertext)` under a
//! deployment-wide secret key. The core only unseals inside adapter open;
//! sealed blobs are otherwise opaque.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::AdapterError;

/// GCM nonce size in bytes.
const NONCE_LEN: usize = 12;

/// A 32-byte secret key for sealing and unsealing credentials.
#[derive(Clone)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Build a key from 64 hex characters.
    pub fn from_hex(hex_str: &str) -> Result<Self, AdapterError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| AdapterError::Credentials(format!("secret key is not hex: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            AdapterError::Credentials("secret key must be 32 bytes (64 hex chars)".into())
        })?;
        Ok(Self(key))
    }

    /// Derive a key from an arbitrary passphrase via SHA-256.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        Self(digest.into())
    }

    /// Hex encoding of the raw key, for writing config files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SecretKey(..)")
    }
}

/// Seal a password. Returns `hex(nonce || ciphertext)`.
pub fn seal(key: &SecretKey, plaintext: &str) -> Result<String, AdapterError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| AdapterError::Credentials("encryption failed".into()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(hex::encode(blob))
}

/// Unseal a password blob produced by [`seal`].
pub fn unseal(key: &SecretKey, sealed: &str) -> Result<String, AdapterError> {
    let blob = hex::decode(sealed)
        .map_err(|e| AdapterError::Credentials(format!("sealed blob is not hex: {e}")))?;
    if blob.len() <= NONCE_LEN {
        return Err(AdapterError::Credentials("sealed blob too short".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| AdapterError::Credentials("decryption failed (wrong key?)".into()))?;

    String::from_utf8(plaintext)
        .map_err(|_| AdapterError::Credentials("decrypted password is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_roundtrip() {
        let key = SecretKey::from_passphrase("test passphrase");
        let sealed = seal(&key, "s3cret-p@ss").expect("seal should succeed");
        assert_ne!(sealed, "s3cret-p@ss");
        let opened = unseal(&key, &sealed).expect("unseal should succeed");
        assert_eq!(opened, "s3cret-p@ss");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let key = SecretKey::from_passphrase("k");
        let a = seal(&key, "same").unwrap();
        let b = seal(&key, "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let key = SecretKey::from_passphrase("right");
        let sealed = seal(&key, "password").unwrap();
        let wrong = SecretKey::from_passphrase("wrong");
        assert!(unseal(&wrong, &sealed).is_err());
    }

    #[test]
    fn garbage_blob_fails() {
        let key = SecretKey::from_passphrase("k");
        assert!(unseal(&key, "zz-not-hex").is_err());
        assert!(unseal(&key, "00ff").is_err());
    }

    #[test]
    fn hex_key_roundtrip() {
        let key = SecretKey::from_passphrase("k");
        let restored = SecretKey::from_hex(&key.to_hex()).expect("hex key should parse");
        let sealed = seal(&key, "pw").unwrap();
        assert_eq!(unseal(&restored, &sealed).unwrap(), "pw");
    }

    #[test]
    fn short_hex_key_rejected() {
        assert!(SecretKey::from_hex("abcd").is_err());
    }
}
