use std::sync::Arc;

use veggieshop_txn::ConsistencyEngine;

use crate::idempotency::IdempotencyCache;

/// Shared state every handler and middleware layer sees. Cheap to clone --
/// everything inside is already behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub consistency: Arc<ConsistencyEngine>,
    pub idempotency: Arc<IdempotencyCache>,
}

impl AppState {
    pub fn new(consistency: Arc<ConsistencyEngine>, idempotency: Arc<IdempotencyCache>) -> Self {
        Self {
            consistency,
            idempotency,
        }
    }
}
