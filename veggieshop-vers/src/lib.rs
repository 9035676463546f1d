// Versioning for a single aggregate record: a strictly positive, monotonic
// counter and its strong-ETag wire representation. Nothing here talks to
// storage; `RowVersion` is the same representation reused by the outbox's
// optimistic-concurrency column so the two don't drift.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use veggieshop_base::{err_kind, Error, ErrorKind, Result};

/// A monotonic per-aggregate version. Zero is never a legal value: the sum
/// type `{Absent, Present(EntityVersion)}` from the design notes is just
/// `Option<EntityVersion>`, since `NonZeroU64` already makes `None`
/// unambiguous.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EntityVersion(NonZeroU64);

impl EntityVersion {
    pub fn new(value: u64) -> Result<EntityVersion> {
        NonZeroU64::new(value)
            .map(EntityVersion)
            .ok_or_else(|| err_kind(ErrorKind::Validation, "entity version 0 is never legal"))
    }

    /// Build from the first version ever assigned to a fresh aggregate.
    pub const FIRST: EntityVersion = match NonZeroU64::new(1) {
        Some(v) => EntityVersion(v),
        None => unreachable!(),
    };

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub fn next(self) -> EntityVersion {
        // Saturating: a 64-bit version counter overflowing is not a case
        // this workspace needs to handle gracefully, but we still prefer a
        // saturated max over silently wrapping back to a small version.
        EntityVersion(NonZeroU64::new(self.0.get().saturating_add(1)).unwrap_or(self.0))
    }

    /// Strong ETag wire form: `"lowerhex"`, e.g. `255` -> `"ff"`.
    pub fn etag(self) -> String {
        format!("\"{:x}\"", self.0.get())
    }

    /// Parse a strong ETag (`"<hex>"`) back into a version, used by write
    /// handlers checking `If-Match` against a stored version.
    pub fn parse_etag(raw: &str) -> Result<EntityVersion> {
        let inner = raw
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(|| err_kind(ErrorKind::Validation, "ETag must be a strong quoted value"))?;
        let value = u64::from_str_radix(inner, 16)
            .map_err(|e| Error::with_kind(ErrorKind::Validation, e))?;
        EntityVersion::new(value)
    }
}

impl fmt::Display for EntityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for EntityVersion {
    type Error = Error;

    fn try_from(value: u64) -> Result<EntityVersion> {
        EntityVersion::new(value)
    }
}

/// Transparent alias for the outbox row's concurrency counter (§3). Kept as
/// a distinct name rather than reusing `EntityVersion` directly: a row
/// version is a storage-layer optimistic-lock counter, not a domain entity
/// version, even though the representation happens to coincide today.
pub type RowVersion = EntityVersion;
