// `redb` transactions are synchronous and not `Send`-friendly across an
// `.await`, so every operation here runs inside `spawn_blocking`. The
// watermark trait itself is infallible (it has no `Result` in its
// signature -- see `veggieshop-txn::watermark`), so a storage error here
// degrades to "assume the advance happened" rather than panicking a
// request task; it's logged so an operator still sees it.

use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use veggieshop_base::TenantId;
use veggieshop_txn::WatermarkStore;

const TABLE: TableDefinition<&str, i64> = TableDefinition::new("watermarks");

pub struct RedbWatermarkStore {
    db: Arc<Database>,
}

impl RedbWatermarkStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl WatermarkStore for RedbWatermarkStore {
    async fn current(&self, tenant: &TenantId) -> i64 {
        let db = self.db.clone();
        let key = tenant.as_str().to_string();
        match tokio::task::spawn_blocking(move || read_current(&db, &key)).await {
            Ok(Ok(val)) => val,
            Ok(Err(e)) => {
                tracing::error!(target: "veggieshop", error = ?e, "watermark_store_error");
                0
            }
            Err(join_err) => {
                tracing::error!(target: "veggieshop", error = %join_err, "watermark_store_task_panicked");
                0
            }
        }
    }

    async fn advance_at_least(&self, tenant: &TenantId, ms: i64) -> i64 {
        let db = self.db.clone();
        let key = tenant.as_str().to_string();
        match tokio::task::spawn_blocking(move || write_advance(&db, &key, ms)).await {
            Ok(Ok(new_val)) => new_val,
            Ok(Err(e)) => {
                tracing::error!(target: "veggieshop", error = ?e, "watermark_store_error");
                ms
            }
            Err(join_err) => {
                tracing::error!(target: "veggieshop", error = %join_err, "watermark_store_task_panicked");
                ms
            }
        }
    }
}

fn read_current(db: &Database, key: &str) -> veggieshop_base::Result<i64> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(TABLE) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    Ok(table.get(key)?.map(|v| v.value()).unwrap_or(0))
}

fn write_advance(db: &Database, key: &str, ms: i64) -> veggieshop_base::Result<i64> {
    let txn = db.begin_write()?;
    let new_val;
    {
        let mut table = txn.open_table(TABLE)?;
        let current = table.get(key)?.map(|v| v.value()).unwrap_or(0);
        new_val = current.max(ms);
        table.insert(key, new_val)?;
    }
    txn.commit()?;
    Ok(new_val)
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
    async fn starts_at_zero() {
        let store = RedbWatermarkStore::new(temp_db());
        assert_eq!(store.current(&tenant("acme")).await, 0);
    }

    #[tokio::test]
    async fn advance_at_least_is_max_and_persists() {
        let store = RedbWatermarkStore::new(temp_db());
        let t = tenant("acme");
        assert_eq!(store.advance_at_least(&t, 100).await, 100);
        assert_eq!(store.advance_at_least(&t, 50).await, 100);
        assert_eq!(store.current(&t).await, 100);
    }

    #[tokio::test]
    async fn tenants_are_independent() {
        let store = RedbWatermarkStore::new(temp_db());
        store.advance_at_least(&tenant("acme"), 500).await;
        assert_eq!(store.current(&tenant("other")).await, 0);
    }
}
