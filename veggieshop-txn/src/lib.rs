//! Per-tenant watermarks, request-scoped consistency (open/RYW/token
//! emission), and consumer-side dedupe with replay fences. The three
//! modules share nothing but the tenant/clock/signer primitives from
//! `veggieshop-base`/`veggieshop-auth`/`veggieshop-vers`; they're kept in
//! one crate because a server assembly always wires them together.

mod dedupe;
mod scope;
mod watermark;

pub use dedupe::{
    DedupeEngine, DedupePolicy, DedupeStore, Decision, InMemoryDedupeStore, InsertOutcome,
    PgDedupeStore, PolicyProvider, StaticPolicyProvider,
};
pub use scope::{ConsistencyConfig, ConsistencyEngine, NoScope, RequestScope};
pub use watermark::{advance_to_now, InMemoryWatermarkStore, WatermarkStore};
