//! At-rest encryption of message bodies.
//!
//! AES-GCM with a server-held key. Output layout is
//! `[nonce (12 bytes)][ciphertext + tag]`.
//! The key length selects AES-128 (16 bytes) or AES-256 (32 bytes).

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption key is not valid base64")]
    InvalidEncoding,
    #[error("encryption key must be 16 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("ciphertext too short")]
    TooShort,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

enum AesKey {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

pub struct MessageCipher {
    engine: AesKey,
}

impl MessageCipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let engine = match key.len() {
            16 => Aes128Gcm::new_from_slice(key).map(AesKey::Aes128),
            32 => Aes256Gcm::new_from_slice(key).map(AesKey::Aes256),
            other => return Err(CipherError::InvalidKeyLength(other)),
        }
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        Ok(Self { engine })
    }

    /// Build from a base64-encoded key, as found in `ENCRYPTION_KEY`.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CipherError::InvalidEncoding)?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let nonce = Nonce::<U12>::from(nonce_bytes);

        let sealed = match &self.engine {
            AesKey::Aes128(cipher) => cipher.encrypt(&nonce, plaintext),
            AesKey::Aes256(cipher) => cipher.encrypt(&nonce, plaintext),
        }
        .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_LEN {
            return Err(CipherError::TooShort);
        }
        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let nonce_bytes: [u8; NONCE_LEN] =
            nonce_bytes.try_into().map_err(|_| CipherError::TooShort)?;
        let nonce = Nonce::<U12>::from(nonce_bytes);

        match &self.engine {
            AesKey::Aes128(cipher) => cipher.decrypt(&nonce, sealed),
            AesKey::Aes256(cipher) => cipher.decrypt(&nonce, sealed),
        }
        .map_err(|_| CipherError::Decrypt)
    }

    /// Decrypt into a UTF-8 string.
    pub fn decrypt_text(&self, data: &[u8]) -> Result<String, CipherError> {
        String::from_utf8(self.decrypt(data)?).map_err(|_| CipherError::Decrypt)
    }
}
