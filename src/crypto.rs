//! Cryptographic primitives shared by the Client, the RPP and the TPS.
//!
//! - RSA (2048 bit, PKCS#1 v1.5) protects short secrets: the session hash salt and the AES key.
//! - AES-128-GCM protects the bulk data exchanged between the Client and the TPS.
//! - HMAC-SHA256 pseudonymizes variant and gene identifiers before they leave a party.
//!
//! All failures are reported as a single [`CryptoError`]; callers are not expected to branch on
//! the kind of failure.

mod asymmetric;
mod pseudonym;
mod symmetric;

pub use asymmetric::{PrivateKey, PublicKey, RSA_BITS, decrypt_rsa, encrypt_rsa, generate_rsa_keypair};
pub use pseudonym::{generate_salt, hash};
pub use symmetric::{AES_KEY_LENGTH, AesKey, IV_LENGTH, decrypt_aes, encrypt_aes};

/// A failed cryptographic operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} failed: {reason}")]
pub struct CryptoError {
    /// The operation that failed, e.g. `"RSA decryption"`.
    pub operation: &'static str,
    /// A description of what went wrong.
    pub reason: String,
}

impl CryptoError {
    pub(crate) fn new(operation: &'static str, reason: impl ToString) -> Self {
        Self {
            operation,
            reason: reason.to_string(),
        }
    }
}
