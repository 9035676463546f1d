use axum::http::{HeaderMap, HeaderValue};

pub const IF_CONSISTENT_WITH: &str = "if-consistent-with";
pub const X_CONSISTENCY_TOKEN: &str = "x-consistency-token";
pub const IF_MATCH: &str = "if-match";
pub const ETAG: &str = "etag";
pub const VARY: &str = "vary";

pub fn get_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Merge `If-Consistent-With` into an existing `Vary` header, case
/// insensitively, without duplicating it if already present.
pub fn merge_vary(headers: &mut HeaderMap) {
    let already = headers
        .get(VARY)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(IF_CONSISTENT_WITH))
        })
        .unwrap_or(false);
    if already {
        return;
    }
    let merged = match headers.get(VARY).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, If-Consistent-With"),
        _ => "If-Consistent-With".to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&merged) {
        headers.insert(VARY, value);
    }
}

/// Set the strong ETag for a response, unless one is already present.
pub fn set_etag_if_absent(headers: &mut HeaderMap, version: veggieshop_vers::EntityVersion) {
    if headers.contains_key(ETAG) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&version.etag()) {
        headers.insert(ETAG, value);
    }
}
