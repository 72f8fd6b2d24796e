//! Credential encryption at rest

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::errors::{EngineError, EngineResult};

/// AES-256-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Symmetric cipher for exchange API credentials.
///
/// Credentials are decrypted only inside the gateway; the rest of the
/// engine (and the database) only ever sees ciphertext. The stored form is
/// `base64(nonce || ciphertext)` with a fresh random nonce per encryption.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build a cipher from a hex-encoded 32-byte key (`ENCRYPTION_KEY`).
    pub fn from_hex_key(hex_key: &str) -> EngineResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| EngineError::Cipher(format!("ENCRYPTION_KEY is not valid hex: {e}")))?;

        if bytes.len() != 32 {
            return Err(EngineError::Cipher(format!(
                "ENCRYPTION_KEY must be 32 bytes, got {}",
                bytes.len()
            )));
        }

        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Generate a fresh hex-encoded key suitable for `ENCRYPTION_KEY`.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        hex::encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> EngineResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::Cipher(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> EngineResult<String> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| EngineError::Cipher(format!("invalid ciphertext encoding: {e}")))?;

        if blob.len() <= NONCE_LEN {
            return Err(EngineError::Cipher("ciphertext too short".into()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| EngineError::Cipher(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| EngineError::Cipher(format!("decrypted data is not UTF-8: {e}")))
    }

    /// Encrypt an API key pair for storage.
    pub fn encrypt_credentials(
        &self,
        api_key: &str,
        api_secret: &str,
    ) -> EngineResult<(String, String)> {
        Ok((self.encrypt(api_key)?, self.encrypt(api_secret)?))
    }

    /// Decrypt a stored API key pair.
    pub fn decrypt_credentials(
        &self,
        api_key_enc: &str,
        api_secret_enc: &str,
    ) -> EngineResult<(String, String)> {
        Ok((self.decrypt(api_key_enc)?, self.decrypt(api_secret_enc)?))
    }
}
