// The classic idempotent-POST pattern (§4.6.1): distinct from the C4
// consumer-side dedupe engine, this guards the HTTP boundary itself. An
// in-flight entry coalesces concurrent duplicates behind a `Notify`; a
// completed entry replays the cached response within `ttl_ms`; a payload
// hash mismatch under the same key is a conflict, never a silent replay.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::HeaderMap;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::timeout;
use veggieshop_base::{Clock, TenantId};

#[derive(Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Bytes,
}

enum Entry {
    InFlight { payload_hash: String, notify: Arc<Notify> },
    Completed { payload_hash: String, response: CachedResponse, expires_at_ms: i64 },
}

/// What the caller should do with a request carrying an `Idempotency-Key`.
pub enum Admission {
    /// First time this key has been seen (or its prior entry expired):
    /// proceed, then call [`IdempotencyCache::complete`] with the result.
    Proceed,
    /// A cached response for this exact key and payload already exists.
    Replay(CachedResponse),
    /// Same key, different payload -- the caller returns 409 and does not
    /// run the handler.
    PayloadMismatch,
}

pub struct IdempotencyCache {
    entries: DashMap<(TenantId, String), Entry>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    wait_timeout_ms: u64,
}

impl IdempotencyCache {
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: i64, wait_timeout_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            ttl_ms,
            wait_timeout_ms,
        }
    }

    /// Call before running the handler. `payload_hash` should be a hash of
    /// the request method, path, and body so a reused key with a different
    /// request is caught.
    pub async fn admit(&self, tenant: &TenantId, key: &str, payload_hash: &str) -> Admission {
        let row_key = (tenant.clone(), key.to_string());
        loop {
            let existing = self.entries.get(&row_key).map(|e| match &*e {
                Entry::InFlight { payload_hash, notify } => {
                    Entry::InFlight { payload_hash: payload_hash.clone(), notify: notify.clone() }
                }
                Entry::Completed { payload_hash, response, expires_at_ms } => Entry::Completed {
                    payload_hash: payload_hash.clone(),
                    response: response.clone(),
                    expires_at_ms: *expires_at_ms,
                },
            });

            match existing {
                None => {
                    self.entries.insert(
                        row_key,
                        Entry::InFlight {
                            payload_hash: payload_hash.to_string(),
                            notify: Arc::new(Notify::new()),
                        },
                    );
                    return Admission::Proceed;
                }
                Some(Entry::Completed { payload_hash: seen_hash, response, expires_at_ms }) => {
                    if expires_at_ms <= self.clock.now_ms() {
                        self.entries.remove(&row_key);
                        continue;
                    }
                    if seen_hash != payload_hash {
                        return Admission::PayloadMismatch;
                    }
                    return Admission::Replay(response);
                }
                Some(Entry::InFlight { payload_hash: seen_hash, notify }) => {
                    if seen_hash != payload_hash {
                        return Admission::PayloadMismatch;
                    }
                    let _ = timeout(Duration::from_millis(self.wait_timeout_ms), notify.notified()).await;
                    continue;
                }
            }
        }
    }

    /// Call after the handler runs, with the response it produced.
    pub fn complete(&self, tenant: &TenantId, key: &str, payload_hash: &str, response: CachedResponse) {
        let row_key = (tenant.clone(), key.to_string());
        let notify = match self.entries.get(&row_key) {
            Some(e) => match &*e {
                Entry::InFlight { notify, .. } => Some(notify.clone()),
                Entry::Completed { .. } => None,
            },
            None => None,
        };
        self.entries.insert(
            row_key,
            Entry::Completed {
                payload_hash: payload_hash.to_string(),
                response,
                expires_at_ms: self.clock.now_ms() + self.ttl_ms,
            },
        );
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn hash_payload(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\0");
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(body);
    hasher.finalize().to_hex().to_string()
}
