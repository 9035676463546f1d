// Same `spawn_blocking` discipline as `watermark.rs`. Unlike the watermark
// trait, `DedupeStore::try_insert` is fallible, so a storage error here
// surfaces as `Err` and the caller (the dedupe engine) fails closed into
// `QuarantineStoreError`, exactly as it does for any other store.

use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use veggieshop_base::{Result, TenantId};
use veggieshop_txn::{DedupeStore, InsertOutcome};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("dedupe");

#[derive(Serialize, Deserialize)]
struct WireRow {
    first_seen_ms: i64,
    last_seen_ms: i64,
    expires_at_ms: i64,
    seen_count: u64,
}

fn dedupe_key(tenant: &TenantId, event_id: &str, version: u64) -> String {
    format!("{}\u{0}{}\u{0}{}", tenant.as_str(), event_id, version)
}

pub struct RedbDedupeStore {
    db: Arc<Database>,
}

impl RedbDedupeStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl DedupeStore for RedbDedupeStore {
    async fn try_insert(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: u64,
        now_ms: i64,
        expires_at_ms: i64,
    ) -> Result<InsertOutcome> {
        let db = self.db.clone();
        let key = dedupe_key(tenant, event_id, version);
        tokio::task::spawn_blocking(move || try_insert_blocking(&db, &key, now_ms, expires_at_ms))
            .await
            .map_err(|e| veggieshop_base::err(format!("dedupe store task panicked: {e}")))?
    }
}

fn try_insert_blocking(
    db: &Database,
    key: &str,
    now_ms: i64,
    expires_at_ms: i64,
) -> Result<InsertOutcome> {
    let txn = db.begin_write()?;
    let outcome;
    {
        let mut table = txn.open_table(TABLE)?;
        let existing = table
            .get(key)?
            .map(|v| rmp_serde::from_slice::<WireRow>(v.value()))
            .transpose()?;

        let fresh = WireRow {
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            expires_at_ms,
            seen_count: 1,
        };

        let row = match existing {
            None => {
                outcome = InsertOutcome::Inserted;
                fresh
            }
            Some(row) if row.expires_at_ms <= now_ms => {
                outcome = InsertOutcome::Inserted;
                fresh
            }
            Some(mut row) => {
                outcome = InsertOutcome::AlreadyPresent;
                row.last_seen_ms = now_ms;
                row.seen_count += 1;
                row
            }
        };

        let bytes = rmp_serde::to_vec(&row)?;
        table.insert(key, bytes.as_slice())?;
    }
    txn.commit()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn temp_db() -> Arc<Database> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        std::mem::forget(dir);
        Arc::new(Database::create(path).unwrap())
    }

    #[tokio::test]
    async fn first_insert_is_accepted() {
        let store = RedbDedupeStore::new(temp_db());
        let outcome = store
            .try_insert(&tenant("acme"), "evt-1", 1, 1_000, 1_000 + 86_400_000)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn second_insert_is_already_present() {
        let store = RedbDedupeStore::new(temp_db());
        let t = tenant("acme");
        store
            .try_insert(&t, "evt-1", 1, 1_000, 1_000 + 86_400_000)
            .await
            .unwrap();
        let outcome = store
            .try_insert(&t, "evt-1", 1, 1_100, 1_000 + 86_400_000)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn different_versions_are_independent_keys() {
        let store = RedbDedupeStore::new(temp_db());
        let t = tenant("acme");
        store
            .try_insert(&t, "evt-1", 1, 1_000, 1_000 + 86_400_000)
            .await
            .unwrap();
        let outcome = store
            .try_insert(&t, "evt-1", 2, 1_000, 1_000 + 86_400_000)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn expired_row_is_reinserted_as_fresh() {
        let store = RedbDedupeStore::new(temp_db());
        let t = tenant("acme");
        store.try_insert(&t, "evt-1", 1, 1_000, 2_000).await.unwrap();
        let outcome = store
            .try_insert(&t, "evt-1", 1, 5_000, 6_000)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }
}
