// TenantId is the only identifier that crosses every component boundary in
// this workspace: tokens carry it, watermarks are keyed by it, outbox rows
// are routed by it, dedupe keys are scoped to it. We validate it once, at
// construction, so every downstream component can treat a `TenantId` as
// already-normalized and never re-validate.

use std::fmt;

use crate::error::{err_kind, ErrorKind};
use crate::Result;

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 63;

/// A validated tenant identifier: lowercase ASCII, `[a-z0-9](-?[a-z0-9])*`,
/// length 3-63, never containing `--`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Parse and validate a tenant id from its wire representation (an
    /// `X-Tenant-Id` header value, typically). Rejects anything that isn't
    /// already normalized rather than normalizing on behalf of the caller.
    pub fn parse(raw: &str) -> Result<TenantId> {
        if raw.len() < MIN_LEN || raw.len() > MAX_LEN {
            return Err(err_kind(
                ErrorKind::Validation,
                format!("tenant id length must be {MIN_LEN}..={MAX_LEN}, got {}", raw.len()),
            ));
        }
        if raw.contains("--") {
            return Err(err_kind(ErrorKind::Validation, "tenant id must not contain \"--\""));
        }
        let bytes = raw.as_bytes();
        let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
            return Err(err_kind(
                ErrorKind::Validation,
                "tenant id must start and end with a lowercase ASCII letter or digit",
            ));
        }
        for &b in bytes {
            if !(is_alnum(b) || b == b'-') {
                return Err(err_kind(
                    ErrorKind::Validation,
                    format!("tenant id contains disallowed byte {b:#x}"),
                ));
            }
        }
        Ok(TenantId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_too_short() {
        assert!(TenantId::parse("ab").is_err());
    }

    #[test]
    fn rejects_double_hyphen() {
        assert!(TenantId::parse("a--b").is_err());
    }

    #[test]
    fn rejects_leading_hyphen() {
        assert!(TenantId::parse("-ab").is_err());
    }

    #[test]
    fn rejects_trailing_hyphen() {
        assert!(TenantId::parse("ab-").is_err());
    }

    #[test]
    fn rejects_uppercase() {
        assert!(TenantId::parse("Abc").is_err());
        assert!(TenantId::parse("abC").is_err());
    }

    #[test]
    fn accepts_minimal() {
        assert!(TenantId::parse("abc").is_ok());
    }

    #[test]
    fn accepts_hyphenated() {
        assert!(TenantId::parse("a-b-c").is_ok());
    }

    #[test]
    fn accepts_max_length() {
        let s: String = std::iter::once('a')
            .chain(std::iter::repeat('b').take(61))
            .chain(std::iter::once('c'))
            .collect();
        assert_eq!(s.len(), 63);
        assert!(TenantId::parse(&s).is_ok());
    }

    #[test]
    fn rejects_over_max_length() {
        let s: String = std::iter::repeat('a').take(64).collect();
        assert!(TenantId::parse(&s).is_err());
    }
}
