// The signer is an injected dependency: this crate never manages key
// material, it only defines the contract a key manager must satisfy (see
// the Non-goals in the spec: "no cryptographic key management"). Verify
// must be constant-time so an attacker probing signatures over the wire
// can't learn anything from timing.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Signs and verifies byte strings under a named key id (`kid`). A `kid`
/// lets the signer rotate keys without invalidating tokens issued under an
/// older one: old tokens keep verifying as long as the old `kid`'s key is
/// still known to the signer.
pub trait Signer: Send + Sync {
    /// The `kid` new tokens should be signed with.
    fn active_key_id(&self) -> &str;

    /// Sign `bytes` under `kid`. Returns `None` if `kid` is unknown.
    fn sign(&self, kid: &str, bytes: &[u8]) -> Option<Vec<u8>>;

    /// Verify `sig` over `bytes` under `kid`. Must run in constant time
    /// with respect to `sig`'s content. Returns `false` (never panics) for
    /// an unknown `kid`.
    fn verify(&self, kid: &str, bytes: &[u8], sig: &[u8]) -> bool;
}

type HmacSha256 = Hmac<Sha256>;

/// Reference `Signer` backed by one or more HMAC-SHA256 keys. Suitable for
/// production use when key material is distributed out of band (e.g. via a
/// secrets manager that hands this process raw key bytes at startup); this
/// type does no key storage or rotation scheduling of its own.
pub struct HmacSigner {
    active_kid: String,
    keys: Vec<(String, Vec<u8>)>,
}

impl HmacSigner {
    /// `keys` must contain `active_kid`; the others are retained only to
    /// verify tokens signed before a rotation.
    pub fn new(active_kid: impl Into<String>, keys: Vec<(String, Vec<u8>)>) -> Self {
        Self {
            active_kid: active_kid.into(),
            keys,
        }
    }

    fn key_for(&self, kid: &str) -> Option<&[u8]> {
        self.keys
            .iter()
            .find(|(k, _)| k == kid)
            .map(|(_, v)| v.as_slice())
    }
}

impl Signer for HmacSigner {
    fn active_key_id(&self) -> &str {
        &self.active_kid
    }

    fn sign(&self, kid: &str, bytes: &[u8]) -> Option<Vec<u8>> {
        let key = self.key_for(kid)?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(bytes);
        Some(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, kid: &str, bytes: &[u8], sig: &[u8]) -> bool {
        let Some(key) = self.key_for(kid) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(bytes);
        let expected = mac.finalize().into_bytes();
        // `ConstantTimeEq` short-circuits on length only, which is fine: an
        // HMAC-SHA256 tag's length isn't secret, its content is.
        expected.as_slice().ct_eq(sig).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> HmacSigner {
        HmacSigner::new("k1", vec![("k1".into(), b"0123456789abcdef".to_vec())])
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let s = signer();
        let sig = s.sign("k1", b"hello").unwrap();
        assert!(s.verify("k1", b"hello", &sig));
    }

    #[test]
    fn verify_rejects_tampered_bytes() {
        let s = signer();
        let sig = s.sign("k1", b"hello").unwrap();
        assert!(!s.verify("k1", b"hellp", &sig));
    }

    #[test]
    fn verify_rejects_unknown_kid() {
        let s = signer();
        let sig = s.sign("k1", b"hello").unwrap();
        assert!(!s.verify("k2", b"hello", &sig));
    }

    #[test]
    fn sign_with_unknown_kid_returns_none() {
        let s = signer();
        assert!(s.sign("k2", b"hello").is_none());
    }

    #[test]
    fn old_key_still_verifies_after_rotation() {
        let s = HmacSigner::new(
            "k2",
            vec![
                ("k1".into(), b"0123456789abcdef".to_vec()),
                ("k2".into(), b"fedcba9876543210".to_vec()),
            ],
        );
        let old_sig = s.sign("k1", b"payload").unwrap();
        assert!(s.verify("k1", b"payload", &old_sig));
        assert_eq!(s.active_key_id(), "k2");
    }
}
