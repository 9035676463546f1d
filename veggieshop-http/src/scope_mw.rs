// The boundary-level half of request-scoped consistency (§4.5). The
// engine itself (`veggieshop_txn::ConsistencyEngine`) is explicit and
// stack-free; this middleware is the one place an ambient, per-request
// scope is threaded through axum's request extensions so handlers can
// pull it out without plumbing it through every signature by hand.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use veggieshop_txn::RequestScope;

use crate::headers;
use crate::scope_local;
use crate::state::AppState;
use crate::tenant::resolve_tenant;

const SKIP_EXACT: &[&str] = &["/error", "/favicon.ico"];
const SKIP_PREFIXES: &[&str] = &["/actuator", "/internal", "/_internal"];

fn should_skip(method: &Method, path: &str) -> bool {
    if method == Method::OPTIONS {
        return true;
    }
    if SKIP_EXACT.contains(&path) {
        return true;
    }
    SKIP_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Opens a `RequestScope` for every request that isn't skipped, waits for
/// read-your-writes when the caller asked for it, and on the way back out
/// merges `Vary`, sets a strong `ETag` from the request extension a
/// handler may have left behind, and emits a fresh `X-Consistency-Token`.
pub async fn consistency_scope(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if should_skip(&method, &path) {
        return next.run(request).await;
    }

    let tenant = match resolve_tenant(request.headers()) {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let if_consistent_with = headers::get_str(request.headers(), headers::IF_CONSISTENT_WITH).map(str::to_string);
    let prior_token = headers::get_str(request.headers(), headers::X_CONSISTENCY_TOKEN).map(str::to_string);

    let scope: Arc<RequestScope> = state
        .consistency
        .open_request(tenant, if_consistent_with.as_deref(), prior_token.as_deref(), None)
        .await;

    if matches!(method, Method::GET | Method::HEAD) {
        let cancel = CancellationToken::new();
        state.consistency.wait_read_your_writes(&scope, &cancel).await;
    }

    request.extensions_mut().insert(scope.clone());

    let mut response = scope_local::with_scope(scope.clone(), next.run(request)).await;

    headers::merge_vary(response.headers_mut());

    let entity_version = response.extensions().get::<veggieshop_vers::EntityVersion>().copied();
    if let Some(version) = entity_version {
        headers::set_etag_if_absent(response.headers_mut(), version);
    }

    if response.status().is_success() && !response.headers().contains_key(headers::X_CONSISTENCY_TOKEN) {
        if let Some(token) = state.consistency.emit_token_for_current_tenant(&scope, entity_version).await {
            if let Ok(value) = axum::http::HeaderValue::from_str(&token) {
                response.headers_mut().insert(headers::X_CONSISTENCY_TOKEN, value);
            }
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_requests_are_skipped() {
        assert!(should_skip(&Method::OPTIONS, "/anything"));
    }

    #[test]
    fn exact_allowlist_is_skipped() {
        assert!(should_skip(&Method::GET, "/error"));
        assert!(should_skip(&Method::GET, "/favicon.ico"));
    }

    #[test]
    fn internal_prefixes_are_skipped() {
        assert!(should_skip(&Method::GET, "/actuator/health"));
        assert!(should_skip(&Method::GET, "/internal/debug"));
        assert!(should_skip(&Method::GET, "/_internal/anything"));
    }

    #[test]
    fn ordinary_requests_are_not_skipped() {
        assert!(!should_skip(&Method::GET, "/orders/123"));
        assert!(!should_skip(&Method::POST, "/orders"));
    }
}
