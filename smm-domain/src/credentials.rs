//! Provider credential types.
//!
//! Provider API keys are stored encrypted and decrypted only when an
//! upstream adapter is built.
//!
//! The plaintext [`ApiKey`] should:
//! - Never be logged
//! - Never be serialized
//! - Be zeroized when dropped

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Encrypted provider API key as persisted (`hex(nonce):hex(ciphertext)`).
///
/// Opaque to the domain; only the store's cipher can open it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedSecret(String);

impl EncryptedSecret {
    /// Wrap an already-encoded ciphertext.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encoded form for persistence.
    pub fn as_encoded(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptedSecret(..)")
    }
}

/// Decrypted provider API key.
pub struct ApiKey(Zeroizing<String>);

impl ApiKey {
    /// Wrap a plaintext key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(Zeroizing::new(key.into()))
    }

    /// Expose the plaintext for the wire request.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_debug_is_redacted() {
        let key = ApiKey::new("super-secret");
        assert_eq!(format!("{:?}", key), "ApiKey([REDACTED])");
        assert_eq!(key.expose(), "super-secret");
    }

    #[test]
    fn test_encrypted_secret_debug_hides_ciphertext() {
        let secret = EncryptedSecret::from_encoded("aa:bb");
        assert!(!format!("{:?}", secret).contains("aa:bb"));
        assert_eq!(secret.as_encoded(), "aa:bb");
    }
}
