use veggieshop_auth::{HmacSigner, Signer};

/// A deterministic signer for tests: always the same key id and key bytes,
/// so encoded tokens are reproducible across test runs (useful for golden
/// assertions and property tests alike).
pub struct FixedSigner(HmacSigner);

impl FixedSigner {
    pub fn new() -> Self {
        Self(HmacSigner::new(
            "test-k1",
            vec![("test-k1".to_string(), b"fixed-test-key-0123456789abcdef".to_vec())],
        ))
    }
}

impl Default for FixedSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer for FixedSigner {
    fn active_key_id(&self) -> &str {
        self.0.active_key_id()
    }

    fn sign(&self, kid: &str, bytes: &[u8]) -> Option<Vec<u8>> {
        self.0.sign(kid, bytes)
    }

    fn verify(&self, kid: &str, bytes: &[u8], sig: &[u8]) -> bool {
        self.0.verify(kid, bytes, sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_and_verifies_deterministically() {
        let s1 = FixedSigner::new();
        let s2 = FixedSigner::new();
        let sig1 = s1.sign(s1.active_key_id(), b"hello").unwrap();
        let sig2 = s2.sign(s2.active_key_id(), b"hello").unwrap();
        assert_eq!(sig1, sig2);
        assert!(s1.verify(s1.active_key_id(), b"hello", &sig2));
    }
}
