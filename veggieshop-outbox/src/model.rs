// A row's whole life is this state machine (§4.5):
//
//   PENDING --claim--> IN_PROGRESS --ok--> PUBLISHED
//                            |
//                            +-fail, attempts<max-> RETRY --available_at elapsed--> PENDING
//                            +-fail, attempts>=max-> QUARANTINED
//
// QUARANTINED has no transition back out anywhere in this crate: an
// operator re-enqueues by inserting a fresh row, not by touching this one.

use veggieshop_base::TenantId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Pending,
    InProgress,
    Published,
    Retry,
    Quarantined,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::InProgress => "IN_PROGRESS",
            Status::Published => "PUBLISHED",
            Status::Retry => "RETRY",
            Status::Quarantined => "QUARANTINED",
        }
    }
}

/// One outbox row (§6's logical schema). `payload`/`headers` are kept as
/// opaque bytes/maps here -- this crate never interprets message content,
/// only moves it.
#[derive(Clone, Debug)]
pub struct OutboxRow {
    pub id: i64,
    pub tenant: TenantId,
    pub topic: String,
    pub event_key: Option<Vec<u8>>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub entity_version: Option<u64>,
    pub payload: Vec<u8>,
    pub headers: std::collections::BTreeMap<String, String>,
    pub priority: i32,
    pub created_at_ms: i64,
    pub available_at_ms: i64,
    pub published_at_ms: Option<i64>,
    pub status: Status,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub row_version: u64,
}

/// A brand-new row before it has ever been claimed (`created_at` /
/// `available_at` default to "now" at insert time, which the store
/// implementation stamps).
#[derive(Clone, Debug)]
pub struct NewOutboxRow {
    pub tenant: TenantId,
    pub topic: String,
    pub event_key: Option<Vec<u8>>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub entity_version: Option<u64>,
    pub payload: Vec<u8>,
    pub headers: std::collections::BTreeMap<String, String>,
    pub priority: i32,
}
