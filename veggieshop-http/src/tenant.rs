use axum::http::HeaderMap;
use veggieshop_base::TenantId;

use crate::error::BoundaryError;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Resolves and validates the tenant id from the canonical header. A
/// missing or malformed header is a boundary-level 400, never a 5xx --
/// the handler never sees a request without a valid tenant.
pub fn resolve_tenant(headers: &HeaderMap) -> Result<TenantId, BoundaryError> {
    let raw = headers
        .get(TENANT_HEADER)
        .ok_or_else(|| BoundaryError::bad_request("missing X-Tenant-Id header"))?
        .to_str()
        .map_err(|_| BoundaryError::bad_request("X-Tenant-Id header is not valid UTF-8"))?;
    TenantId::parse(raw).map_err(|e| BoundaryError::bad_request(format!("{e:?}")))
}
