//! AES-128-GCM with a fresh random IV per message.
//!
//! Ciphertext layout: `ivLength: u8 | iv | ciphertext || tag`.

use std::fmt;

use aes_gcm::{
    Aes128Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD as B64};

use super::CryptoError;

/// Size of an AES key in bytes.
pub const AES_KEY_LENGTH: usize = 16;
/// Size of the GCM IV in bytes.
pub const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// An AES-128 key shared by the Client and the TPS.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey(Key<Aes128Gcm>);

impl AesKey {
    /// Generates a random key.
    pub fn generate() -> Self {
        Self(Aes128Gcm::generate_key(OsRng))
    }

    /// Builds a key from its raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != AES_KEY_LENGTH {
            return Err(CryptoError::new(
                "AES key decoding",
                format!("expected {AES_KEY_LENGTH} bytes, got {}", bytes.len()),
            ));
        }
        Ok(Self(*Key::<Aes128Gcm>::from_slice(bytes)))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Base64 encoding of the raw key.
    pub fn encode(&self) -> String {
        B64.encode(self.as_bytes())
    }

    /// Parses the output of [`AesKey::encode`].
    pub fn decode(text: &str) -> Result<Self, CryptoError> {
        let bytes = B64
            .decode(text.trim())
            .map_err(|err| CryptoError::new("AES key decoding", err))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(<REDACTED>)")
    }
}

/// Encrypts and authenticates `plaintext`, prepending a fresh IV.
pub fn encrypt_aes(key: &AesKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(&key.0);
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::new("AES encryption", "cipher rejected the plaintext"))?;
    let mut out = Vec::with_capacity(1 + IV_LENGTH + ciphertext.len());
    out.push(IV_LENGTH as u8);
    out.extend_from_slice(&nonce);
    out.extend(ciphertext);
    Ok(out)
}

/// Decrypts the output of [`encrypt_aes`], failing on a malformed IV field or a tag mismatch.
pub fn decrypt_aes(key: &AesKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let Some((&iv_len, rest)) = data.split_first() else {
        return Err(CryptoError::new("AES decryption", "empty ciphertext"));
    };
    if iv_len as usize != IV_LENGTH {
        return Err(CryptoError::new(
            "AES decryption",
            format!("invalid IV length {iv_len}"),
        ));
    }
    if rest.len() < IV_LENGTH + TAG_LENGTH {
        return Err(CryptoError::new("AES decryption", "ciphertext too short"));
    }
    let (iv, ciphertext) = rest.split_at(IV_LENGTH);
    Aes128Gcm::new(&key.0)
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::new("AES decryption", "authentication tag mismatch"))
}
