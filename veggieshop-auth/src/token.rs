// Causality tokens are the wire form of "what a tenant's watermark and
// entity version looked like when this response was produced". The codec
// here only handles the envelope: encode/decode/signature-check. Semantic
// checks that depend on wall-clock time or the requesting tenant (§4.3) are
// deliberately left to the consistency engine, which is the "use site" the
// spec refers to -- this keeps the codec testable without a clock.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use veggieshop_base::TenantId;
use veggieshop_vers::EntityVersion;

use crate::signer::Signer;

const PREFIX: &str = "CT1";

/// Compact structured payload, short field names per the wire grammar in
/// the spec (`t, iat, wm, ver`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Payload {
    t: String,
    iat: i64,
    wm: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ver: Option<u64>,
}

/// A decoded causality token: tenant, issued-at, watermark, and an optional
/// entity version, plus the `kid` it was signed under (needed by the
/// consistency engine to decide whether the signing key is still trusted).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CausalityToken {
    pub tenant: TenantId,
    pub kid: String,
    /// Epoch millis the token was issued at. Semantically non-negative;
    /// zero/negative values are structurally representable but rejected by
    /// the consistency engine, not by this codec (see module doc).
    pub issued_at_ms: i64,
    pub watermark_ms: i64,
    pub entity_version: Option<EntityVersion>,
}

impl CausalityToken {
    pub fn new(
        tenant: TenantId,
        kid: impl Into<String>,
        issued_at_ms: i64,
        watermark_ms: i64,
        entity_version: Option<EntityVersion>,
    ) -> Self {
        Self {
            tenant,
            kid: kid.into(),
            issued_at_ms,
            watermark_ms,
            entity_version,
        }
    }

    fn to_payload(&self) -> Payload {
        Payload {
            t: self.tenant.as_str().to_string(),
            iat: self.issued_at_ms,
            wm: self.watermark_ms,
            ver: self.entity_version.map(EntityVersion::get),
        }
    }
}

/// Encode `token` into its compact wire form, signed by `signer`. Fails
/// only if the signer's active key id is blank or unknown to itself.
pub fn encode(token: &CausalityToken, signer: &dyn Signer) -> Option<String> {
    let kid = signer.active_key_id();
    if kid.trim().is_empty() {
        return None;
    }
    let payload = token.to_payload();
    let payload_bytes = rmp_serde::to_vec(&payload).ok()?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_bytes);
    let signed_material = format!("{PREFIX}.{kid}.{payload_b64}");
    let sig = signer.sign(kid, signed_material.as_bytes())?;
    let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
    Some(format!("{signed_material}.{sig_b64}"))
}

/// Parse and verify a compact token. Returns `None` on any structural or
/// cryptographic failure: wrong prefix, wrong segment count, blank parts,
/// base64 error, signature mismatch, or payload deserialization error.
/// Never panics on attacker-controlled input.
pub fn parse_and_verify(compact: &str, signer: &dyn Signer) -> Option<CausalityToken> {
    let mut parts = compact.split('.');
    let prefix = parts.next()?;
    let kid = parts.next()?;
    let payload_b64 = parts.next()?;
    let sig_b64 = parts.next()?;
    if parts.next().is_some() {
        return None; // more than 4 segments
    }
    if prefix != PREFIX || kid.is_empty() || payload_b64.is_empty() || sig_b64.is_empty() {
        return None;
    }

    let signed_material = format!("{prefix}.{kid}.{payload_b64}");
    let sig = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;
    if !signer.verify(kid, signed_material.as_bytes(), &sig) {
        return None;
    }

    let payload_bytes = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let payload: Payload = rmp_serde::from_slice(&payload_bytes).ok()?;
    let tenant = TenantId::parse(&payload.t).ok()?;
    let entity_version = match payload.ver {
        Some(v) => Some(EntityVersion::new(v).ok()?),
        None => None,
    };

    Some(CausalityToken {
        tenant,
        kid: kid.to_string(),
        issued_at_ms: payload.iat,
        watermark_ms: payload.wm,
        entity_version,
    })
}
