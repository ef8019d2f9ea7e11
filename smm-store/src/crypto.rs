//! Provider API key encryption.
//!
//! # Security Model
//!
//! - AES-256-GCM with a random 96-bit nonce per encryption
//! - The provider id is bound as AAD, so a ciphertext copied onto another
//!   provider row fails to decrypt
//! - Master key provided via environment variable (SMM_CRYPTO_KEY, hex)
//! - Stored form: `hex(nonce):hex(ciphertext)`

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use smm_domain::{ApiKey, EncryptedSecret, ProviderId};
use zeroize::Zeroizing;

use crate::error::StoreError;

/// AES-256-GCM key size (32 bytes)
const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM (12 bytes)
const NONCE_SIZE: usize = 12;

/// Encrypts and decrypts provider API keys.
pub struct ProviderKeyCipher {
    key: Aes256Gcm,
}

impl ProviderKeyCipher {
    /// Create from raw bytes.
    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self, StoreError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(StoreError::Crypto(format!(
                "Invalid key size: expected {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let key = Aes256Gcm::new_from_slice(key_bytes)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        Ok(Self { key })
    }

    /// Parse a hex-encoded key (as found in `SMM_CRYPTO_KEY`).
    pub fn from_hex(hex_key: &str) -> Result<Self, StoreError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_key.trim())
                .map_err(|e| StoreError::Crypto(format!("Invalid hex key: {}", e)))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Generate a new random key (tests and development).
    pub fn generate() -> Self {
        let mut key_bytes = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(key_bytes.as_mut());
        Self {
            key: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes.as_ref())),
        }
    }

    /// Encrypt a plaintext key for `provider_id`.
    pub fn encrypt(&self, provider_id: ProviderId, plaintext: &str) -> Result<EncryptedSecret, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .key
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: provider_id.as_bytes(),
                },
            )
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        Ok(EncryptedSecret::from_encoded(format!(
            "{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        )))
    }

    /// Decrypt the stored key of `provider_id`.
    pub fn decrypt(&self, provider_id: ProviderId, secret: &EncryptedSecret) -> Result<ApiKey, StoreError> {
        let (nonce_hex, cipher_hex) = secret
            .as_encoded()
            .split_once(':')
            .ok_or_else(|| StoreError::Crypto("Malformed secret: missing separator".to_string()))?;

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|e| StoreError::Crypto(format!("Invalid nonce hex: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(StoreError::Crypto(format!(
                "Invalid nonce size: expected {} bytes, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let ciphertext = hex::decode(cipher_hex)
            .map_err(|e| StoreError::Crypto(format!("Invalid ciphertext hex: {}", e)))?;

        let plaintext = Zeroizing::new(
            self.key
                .decrypt(
                    Nonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: &ciphertext,
                        aad: provider_id.as_bytes(),
                    },
                )
                .map_err(|e| StoreError::Crypto(format!("Decryption failed: {}", e)))?,
        );

        let key = std::str::from_utf8(&plaintext)
            .map_err(|_| StoreError::Crypto("Decrypted key is not UTF-8".to_string()))?;
        Ok(ApiKey::new(key))
    }
}
