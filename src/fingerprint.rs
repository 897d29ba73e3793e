//! Fingerprint hashing and drift-tolerant similarity scoring.
//!
//! A device fingerprint arrives as an opaque string produced by the
//! browser-side collector (canvas/WebGL/UA signals — out of scope here).
//! At rest only a keyed hash is stored: HMAC-SHA256 over the raw string
//! with a process-wide secret pepper, hex-encoded.
//!
//! ## Similarity is a heuristic, not cryptography
//! `similarity` measures character-position agreement between two hex
//! digests. It exists solely to detect *gradual* fingerprint drift from
//! browser/OS updates and must never be used as an authentication check
//! by itself. It is also fragile to insertion/deletion drift — only
//! equal-position characters are compared. A Hamming/Levenshtein-based
//! replacement would change historical scoring and is intentionally not
//! applied here.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Keyed one-way transform of raw fingerprints plus similarity scoring.
#[derive(Debug, Clone)]
pub struct FingerprintHasher {
    pepper: String,
}

impl FingerprintHasher {
    /// Create a hasher keyed with the process-wide pepper.
    pub fn new(pepper: impl Into<String>) -> Self {
        Self {
            pepper: pepper.into(),
        }
    }

    /// HMAC-SHA256 the raw fingerprint with the pepper. Deterministic for
    /// identical input + pepper; 64 lowercase hex chars.
    pub fn hash(&self, raw: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.pepper.as_bytes())
            .expect("HMAC can accept any key length");
        mac.update(raw.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Character-position agreement ratio over the shorter of the two
    /// digests, in `[0.0, 1.0]`. Returns 0.0 when either side is empty.
    pub fn similarity(hash_a: &str, hash_b: &str) -> f64 {
        if hash_a.is_empty() || hash_b.is_empty() {
            return 0.0;
        }
        let length = hash_a.len().min(hash_b.len());
        let matches = hash_a
            .bytes()
            .zip(hash_b.bytes())
            .filter(|(a, b)| a == b)
            .count();
        matches as f64 / length as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let hasher = FingerprintHasher::new("test-pepper");
        assert_eq!(hasher.hash("fingerprint_a"), hasher.hash("fingerprint_a"));
    }

    #[test]
    fn hash_differs_with_different_input() {
        let hasher = FingerprintHasher::new("test-pepper");
        assert_ne!(hasher.hash("fingerprint_a"), hasher.hash("fingerprint_b"));
    }

    #[test]
    fn hash_differs_with_different_pepper() {
        let a = FingerprintHasher::new("pepper_a").hash("fingerprint");
        let b = FingerprintHasher::new("pepper_b").hash("fingerprint");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let hasher = FingerprintHasher::new("test-pepper");
        let digest = hasher.hash("fingerprint");
        assert_eq!(digest.len(), 64);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn similarity_is_reflexive() {
        let hasher = FingerprintHasher::new("test-pepper");
        let digest = hasher.hash("fingerprint");
        assert_eq!(FingerprintHasher::similarity(&digest, &digest), 1.0);
    }

    #[test]
    fn similarity_of_empty_is_zero() {
        assert_eq!(FingerprintHasher::similarity("", "abcd"), 0.0);
        assert_eq!(FingerprintHasher::similarity("abcd", ""), 0.0);
    }

    #[test]
    fn similarity_counts_positional_agreement() {
        // 3 of 4 positions agree.
        assert_eq!(FingerprintHasher::similarity("abcd", "abxd"), 0.75);
        // Compared over the shorter string.
        assert_eq!(FingerprintHasher::similarity("abcd", "ab"), 1.0);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = "0123456789abcdef";
        let b = "0123456789abcdff";
        assert_eq!(
            FingerprintHasher::similarity(a, b),
            FingerprintHasher::similarity(b, a)
        );
    }
}
