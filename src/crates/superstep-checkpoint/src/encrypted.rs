//! Encryption at rest for checkpoint payloads.
//!
//! [`EncryptedSerializer`] wraps any [`SerializerProtocol`] and seals the
//! serialized bytes with a [`Cipher`]. Savers only ever see ciphertext, so
//! every backend gains encryption without changes.
//!
//! ```rust,ignore
//! let cipher = AesGcmCipher::new(&key_bytes)?;
//! let serializer = EncryptedSerializer::new(JsonSerializer::new(), cipher);
//! let saver = FileCheckpointSaver::with_serializer(dir, serializer);
//! ```

use crate::error::{CheckpointError, Result};
use crate::serializer::SerializerProtocol;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Symmetric authenticated encryption used by [`EncryptedSerializer`]
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext`, returning a self-contained ciphertext
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a ciphertext produced by [`Cipher::encrypt`]
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

const NONCE_LEN: usize = 12;

/// AES-256-GCM with a random 96-bit nonce prepended to each ciphertext
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Create a cipher from a 32-byte key
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            CheckpointError::Encryption(format!("expected a 32-byte key, got {} bytes", key.len()))
        })?;
        Ok(Self { cipher })
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CheckpointError::Encryption("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CheckpointError::Encryption(
                "ciphertext shorter than nonce".to_string(),
            ));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CheckpointError::Encryption("authentication failed".to_string()))
    }
}

/// Serializer that encrypts the output of an inner serializer
#[derive(Debug, Clone)]
pub struct EncryptedSerializer<S, C> {
    inner: S,
    cipher: C,
}

impl<S, C> EncryptedSerializer<S, C>
where
    S: SerializerProtocol,
    C: Cipher,
{
    pub fn new(inner: S, cipher: C) -> Self {
        Self { inner, cipher }
    }
}

impl<S, C> SerializerProtocol for EncryptedSerializer<S, C>
where
    S: SerializerProtocol,
    C: Cipher,
{
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let plaintext = self.inner.dumps(value)?;
        self.cipher.encrypt(&plaintext)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        let plaintext = self.cipher.decrypt(data)?;
        self.inner.loads(&plaintext)
    }
}
