//! At-rest encryption for integration tokens.
//!
//! `TokenCipher` seals token strings with AES-256-GCM. Ciphertexts are stored as
//! `enc:v1:<hex(nonce || ciphertext)>`; values without that prefix are read back as plaintext so a
//! store can start encrypting without a migration.

use crate::{Error, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use std::path::Path;

const NONCE_LEN: usize = 12;
const PREFIX: &str = "enc:v1:";

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(master_key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(master_key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Parse a 64-char hex key (e.g. from `TRIBUTARY_MASTER_KEY`).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::InvalidInput(format!("master key is not hex: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::InvalidInput(format!("master key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::new(&key))
    }

    /// Load the master key from `path`, or generate one if it doesn't exist.
    pub fn generate_or_load_key(path: &Path) -> std::io::Result<[u8; 32]> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            if bytes.len() != 32 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "master key file must be exactly 32 bytes, got {}",
                        bytes.len()
                    ),
                ));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            Ok(key)
        } else {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, key)?;
            tracing::info!(path = %path.display(), "generated new master key");
            Ok(key)
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::BackendMessage(format!("encrypt: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(format!("{PREFIX}{}", hex::encode(out)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(PREFIX) else {
            return Ok(stored.to_string());
        };
        let data = hex::decode(encoded)
            .map_err(|e| Error::BackendMessage(format!("decrypt: invalid hex: {e}")))?;
        if data.len() < NONCE_LEN {
            return Err(Error::BackendMessage(
                "ciphertext too short (missing nonce)".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::BackendMessage(format!("decrypt: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::BackendMessage(format!("decrypt: invalid utf-8: {e}")))
    }
}
