//! The HTTP boundary (§4.5-4.6): tenant resolution, the consistency-scope
//! middleware, and the idempotent-POST cache. Everything here sits in
//! front of handlers that belong to the assembling binary, not this crate
//! -- `build_router` takes a fallback/merge router rather than owning
//! business routes itself.

mod error;
mod headers;
mod idempotency;
mod scope_local;
mod scope_mw;
mod state;
mod tenant;

pub use error::BoundaryError;
pub use idempotency::{
    hash_payload, idempotency_key, Admission, CachedResponse, IdempotencyCache,
    IDEMPOTENCY_KEY_HEADER,
};
pub use scope_local::{current_scope, with_scope};
pub use scope_mw::consistency_scope;
pub use state::AppState;
pub use tenant::{resolve_tenant, TENANT_HEADER};

use axum::Router;
use axum::middleware;

/// Layers the consistency-scope middleware over a caller-supplied router.
/// The idempotency cache is consulted by handlers directly (via
/// `AppState::idempotency`), not by a blanket middleware layer, since only
/// the caller knows which routes are safe to cache (§4.6.1 scopes
/// idempotency to mutating routes the handler opts into).
pub fn build_router(routes: Router<AppState>, state: AppState) -> Router {
    routes
        .layer(middleware::from_fn_with_state(state.clone(), consistency_scope))
        .with_state(state)
}
