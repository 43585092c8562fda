//! Cache fingerprinting
//!
//! Every cache lookup is keyed by a SHA-256 digest over `model + ":" + text`.
//! Log lines only ever show the first 16 hex characters.

use sha2::{Digest, Sha256};
use std::fmt;

/// 256-bit cache key over a (model, text) pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest `model + ":" + text`.
    pub fn new(model: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Full 64-character hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex characters, for log truncation.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = Fingerprint::new("model-a", "你好，世界。");
        let b = Fingerprint::new("model-a", "你好，世界。");
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn test_model_and_text_both_keyed() {
        let base = Fingerprint::new("model-a", "hello");
        assert_ne!(base, Fingerprint::new("model-b", "hello"));
        assert_ne!(base, Fingerprint::new("model-a", "hello!"));
        // The separator matters: ("ab", "c") != ("a", "bc")
        assert_ne!(Fingerprint::new("ab", "c"), Fingerprint::new("a", "bc"));
    }

    #[test]
    fn test_hex_lengths() {
        let fp = Fingerprint::new("m", "t");
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(fp.short().len(), 16);
        assert!(fp.to_hex().starts_with(&fp.short()));
    }
}
