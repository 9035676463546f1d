//! `proptest` strategies for this workspace's validated newtypes, so
//! property tests elsewhere don't each hand-roll a tenant-id or
//! outbox-row generator.

use std::collections::BTreeMap;

use proptest::prelude::*;
use veggieshop_base::TenantId;
use veggieshop_outbox::{NewOutboxRow, Status};
use veggieshop_vers::EntityVersion;

/// Generates strings that satisfy [`TenantId::parse`]: lowercase
/// alphanumeric segments of 1-8 chars joined by single hyphens, total
/// length clamped to the valid 3-63 range by construction.
pub fn tenant_id() -> impl Strategy<Value = TenantId> {
    proptest::collection::vec("[a-z0-9]{1,8}", 1..6)
        .prop_map(|segments| segments.join("-"))
        .prop_filter_map("must satisfy TenantId::parse", |raw| TenantId::parse(&raw).ok())
}

/// Generates a valid, non-zero entity version.
pub fn entity_version() -> impl Strategy<Value = EntityVersion> {
    (1u64..=1_000_000).prop_map(|v| EntityVersion::new(v).expect("nonzero by construction"))
}

/// Generates a causality-token-shaped triple: issued-at, watermark, and an
/// optional entity version, all within plausible epoch-millis ranges.
pub fn token_payload() -> impl Strategy<Value = (i64, i64, Option<EntityVersion>)> {
    (
        0i64..10_000_000_000,
        0i64..10_000_000_000,
        proptest::option::of(entity_version()),
    )
}

/// Generates a syntactically valid [`NewOutboxRow`] with a fixed topic,
/// varying priority and an empty header map -- enough surface to exercise
/// claim ordering without coupling to any particular payload shape.
pub fn new_outbox_row() -> impl Strategy<Value = NewOutboxRow> {
    (tenant_id(), any::<i32>(), proptest::option::of(1u64..1_000_000)).prop_map(
        |(tenant, priority, entity_version)| NewOutboxRow {
            tenant,
            topic: "test-topic".to_string(),
            event_key: None,
            aggregate_type: None,
            aggregate_id: None,
            event_type: None,
            entity_version,
            payload: b"{}".to_vec(),
            headers: BTreeMap::new(),
            priority,
        },
    )
}

/// Generates one of the outbox row's five legal statuses, uniformly.
pub fn outbox_status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Pending),
        Just(Status::InProgress),
        Just(Status::Published),
        Just(Status::Retry),
        Just(Status::Quarantined),
    ]
}
