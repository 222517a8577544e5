//! Keyed hashing used to pseudonymize identifiers before they cross a trust boundary.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Returns the lowercase hex HMAC-SHA256 of `message` keyed with `salt`.
///
/// Client and RPP use the same per-session salt, so hashed identifiers can be compared at the
/// TPS, which never learns the salt.
pub fn hash(salt: &str, message: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes()).expect("HMAC key of any size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Generates a random 256 bit salt, hex encoded.
pub fn generate_salt() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_per_salt() {
        let salt = generate_salt();
        assert_eq!(salt.len(), 64);
        assert_eq!(hash(&salt, "1:1000:A:G"), hash(&salt, "1:1000:A:G"));
        assert_ne!(hash(&salt, "1:1000:A:G"), hash(&salt, "1:1000:A:T"));
    }

    #[test]
    fn different_salts_give_different_hashes() {
        let (a, b) = (generate_salt(), generate_salt());
        assert_ne!(a, b);
        assert_ne!(hash(&a, "BRCA2"), hash(&b, "BRCA2"));
    }

    #[test]
    fn matches_rfc_4231_test_case_2() {
        assert_eq!(
            hash("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
