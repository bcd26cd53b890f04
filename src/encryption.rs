//! Symmetric encryption for data at rest.
//!
//! Keys of any length are stretched to 256 bits with SHA-256. An empty key
//! falls back to a fixed derived key. The nonce is derived from the key and the
//! plaintext, so encryption is deterministic for a given key and input and the
//! service carries no mutable state.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Seed hashed into the key used when the caller supplies an empty key.
const EMPTY_KEY_SEED: &[u8] = b"sensing-runtime/empty-key";

/// Domain separator for nonce derivation.
const NONCE_DOMAIN: &[u8] = b"sensing-runtime/nonce";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encryption errors.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("ciphertext too short: {0} bytes (minimum 28)")]
    TooShort(usize),
    #[error("decryption failed (wrong key or corrupted data)")]
    Authentication,
    #[error("encryption failed")]
    Cipher,
    #[error("invalid base64: {0}")]
    Encoding(String),
    #[error("decrypted data is not valid UTF-8")]
    Utf8,
}

/// AES-256-GCM with a SHA-256 stretched key.
#[derive(Clone)]
pub struct SymmetricEncryption {
    key: [u8; 32],
}

impl std::fmt::Debug for SymmetricEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricEncryption").finish_non_exhaustive()
    }
}

impl SymmetricEncryption {
    /// Create a cipher from a textual key of any length.
    pub fn new(key: &str) -> Self {
        Self::from_bytes(key.as_bytes())
    }

    /// Create a cipher from raw key material of any length.
    pub fn from_bytes(key: &[u8]) -> Self {
        let material = if key.is_empty() { EMPTY_KEY_SEED } else { key };
        let digest = Sha256::digest(material);

        let mut stretched = [0u8; 32];
        stretched.copy_from_slice(&digest);
        Self { key: stretched }
    }

    /// Encrypt bytes. Output layout is `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce_bytes = self.derive_nonce(plaintext);
        let cipher = self.cipher()?;

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| EncryptionError::Cipher)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt bytes produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::TooShort(data.len()));
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| EncryptionError::Authentication)
    }

    /// Encrypt a string into base64 text.
    pub fn encrypt_to_base64(&self, plaintext: &str) -> Result<String, EncryptionError> {
        Ok(STANDARD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Decrypt base64 text produced by [`encrypt_to_base64`](Self::encrypt_to_base64).
    pub fn decrypt_from_base64(&self, encoded: &str) -> Result<String, EncryptionError> {
        let data = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EncryptionError::Encoding(e.to_string()))?;
        self.decrypt_to_string(&data)
    }

    /// Decrypt bytes and interpret them as UTF-8.
    pub fn decrypt_to_string(&self, data: &[u8]) -> Result<String, EncryptionError> {
        String::from_utf8(self.decrypt(data)?).map_err(|_| EncryptionError::Utf8)
    }

    fn cipher(&self) -> Result<Aes256Gcm, EncryptionError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| EncryptionError::Cipher)
    }

    fn derive_nonce(&self, plaintext: &[u8]) -> [u8; NONCE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(NONCE_DOMAIN);
        hasher.update(self.key);
        hasher.update(plaintext);
        let digest = hasher.finalize();

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        nonce
    }
}
