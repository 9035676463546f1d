// The claim step is the one place correctness actually lives: two workers
// racing the same batch must never both claim the same row. `sqlx`'s
// `FOR UPDATE SKIP LOCKED` gives that for Postgres; the in-memory store
// gets it for free from a single-threaded claim critical section guarded
// by a `tokio::sync::Mutex`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{TimeZone, Utc};
use tokio::sync::Mutex;
use veggieshop_base::{err, Result, TenantId};

use crate::model::{NewOutboxRow, OutboxRow, Status};

#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, row: NewOutboxRow, now_ms: i64) -> Result<i64>;

    /// Claim up to `batch_size` rows in `PENDING`/`RETRY` whose
    /// `available_at` has elapsed, ordered by `(priority DESC, created_at
    /// ASC)`, transitioning them to `IN_PROGRESS` and bumping `attempts`.
    async fn claim(&self, worker: &str, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxRow>>;

    async fn mark_published(
        &self,
        id: i64,
        now_ms: i64,
        partition: Option<i32>,
        offset: Option<i64>,
    ) -> Result<()>;

    async fn mark_retry(&self, id: i64, available_at_ms: i64, last_error: String) -> Result<()>;

    async fn mark_quarantined(&self, id: i64, last_error: String) -> Result<()>;
}

/// In-process store, for tests and single-node deployments. Claims are
/// serialized through a `tokio::sync::Mutex` rather than `dashmap`'s
/// per-shard locking because the claim step must scan and mutate several
/// rows as one atomic unit -- exactly the transaction boundary `sqlx`
/// gives the Postgres store for free.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<BTreeMap<i64, OutboxRow>>,
    next_id: AtomicI64,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, row: NewOutboxRow, now_ms: i64) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut rows = self.rows.lock().await;
        rows.insert(
            id,
            OutboxRow {
                id,
                tenant: row.tenant,
                topic: row.topic,
                event_key: row.event_key,
                aggregate_type: row.aggregate_type,
                aggregate_id: row.aggregate_id,
                event_type: row.event_type,
                entity_version: row.entity_version,
                payload: row.payload,
                headers: row.headers,
                priority: row.priority,
                created_at_ms: now_ms,
                available_at_ms: now_ms,
                published_at_ms: None,
                status: Status::Pending,
                attempts: 0,
                last_error: None,
                row_version: 1,
            },
        );
        Ok(id)
    }

    async fn claim(&self, _worker: &str, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxRow>> {
        let mut rows = self.rows.lock().await;
        let mut candidates: Vec<i64> = rows
            .values()
            .filter(|r| {
                matches!(r.status, Status::Pending | Status::Retry) && r.available_at_ms <= now_ms
            })
            .map(|r| r.id)
            .collect();
        candidates.sort_by_key(|id| {
            let r = &rows[id];
            (std::cmp::Reverse(r.priority), r.created_at_ms, r.id)
        });
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let row = rows.get_mut(&id).expect("candidate id must exist");
            row.status = Status::InProgress;
            row.attempts += 1;
            row.row_version += 1;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_published(
        &self,
        id: i64,
        now_ms: i64,
        partition: Option<i32>,
        offset: Option<i64>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or_else(|| err("unknown outbox row"))?;
        row.status = Status::Published;
        row.published_at_ms = Some(now_ms);
        row.last_error = None;
        row.row_version += 1;
        if let Some(p) = partition {
            row.headers.insert("x-partition".to_string(), p.to_string());
        }
        if let Some(o) = offset {
            row.headers.insert("x-offset".to_string(), o.to_string());
        }
        Ok(())
    }

    async fn mark_retry(&self, id: i64, available_at_ms: i64, last_error: String) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or_else(|| err("unknown outbox row"))?;
        row.status = Status::Retry;
        row.available_at_ms = available_at_ms;
        row.last_error = Some(last_error);
        row.row_version += 1;
        Ok(())
    }

    async fn mark_quarantined(&self, id: i64, last_error: String) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or_else(|| err("unknown outbox row"))?;
        row.status = Status::Quarantined;
        row.last_error = Some(last_error);
        row.row_version += 1;
        Ok(())
    }
}

pub(crate) fn ms_to_timestamp(ms: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Production store: Postgres via `sqlx`, implementing the claim query
/// from §4.5 verbatim (`FOR UPDATE SKIP LOCKED`, priority/created_at
/// ordering).
pub struct PgOutboxStore {
    pool: sqlx::PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, row: NewOutboxRow, now_ms: i64) -> Result<i64> {
        let now = ms_to_timestamp(now_ms);
        let headers_json = serde_json::to_value(&row.headers)?;
        let rec = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO outbox
                (tenant_id, topic, event_key, aggregate_type, aggregate_id, event_type,
                 entity_version, payload, headers, priority, created_at, available_at,
                 status, attempts, row_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11, 'PENDING', 0, 1)
            RETURNING id
            "#,
        )
        .bind(row.tenant.as_str())
        .bind(&row.topic)
        .bind(&row.event_key)
        .bind(&row.aggregate_type)
        .bind(&row.aggregate_id)
        .bind(&row.event_type)
        .bind(row.entity_version.map(|v| v as i64))
        .bind(&row.payload)
        .bind(headers_json)
        .bind(row.priority)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec)
    }

    async fn claim(&self, worker: &str, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxRow>> {
        let now = ms_to_timestamp(now_ms);
        let rows = sqlx::query(
            r#"
            UPDATE outbox SET status = 'IN_PROGRESS', claimed_by = $1, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status IN ('PENDING', 'RETRY') AND available_at <= $2
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $3
            )
            RETURNING id, tenant_id, topic, event_key, aggregate_type, aggregate_id,
                      event_type, entity_version, payload, headers, priority,
                      created_at, available_at, published_at, status, attempts,
                      last_error, row_version
            "#,
        )
        .bind(worker)
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_from_sqlx).collect()
    }

    async fn mark_published(
        &self,
        id: i64,
        now_ms: i64,
        partition: Option<i32>,
        offset: Option<i64>,
    ) -> Result<()> {
        let now = ms_to_timestamp(now_ms);
        sqlx::query(
            r#"UPDATE outbox SET status = 'PUBLISHED', published_at = $2, last_error = NULL,
               row_version = row_version + 1, headers = headers
                   || jsonb_build_object('x-partition', $3::text, 'x-offset', $4::text)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(now)
        .bind(partition.map(|p| p.to_string()))
        .bind(offset.map(|o| o.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retry(&self, id: i64, available_at_ms: i64, last_error: String) -> Result<()> {
        let available_at = ms_to_timestamp(available_at_ms);
        sqlx::query(
            r#"UPDATE outbox SET status = 'RETRY', available_at = $2, last_error = $3,
               row_version = row_version + 1 WHERE id = $1"#,
        )
        .bind(id)
        .bind(available_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_quarantined(&self, id: i64, last_error: String) -> Result<()> {
        sqlx::query(
            r#"UPDATE outbox SET status = 'QUARANTINED', last_error = $2,
               row_version = row_version + 1 WHERE id = $1"#,
        )
        .bind(id)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_from_sqlx(row: sqlx::postgres::PgRow) -> Result<OutboxRow> {
    use sqlx::Row;

    let status_raw: String = row.try_get("status")?;
    let status = match status_raw.as_str() {
        "PENDING" => Status::Pending,
        "IN_PROGRESS" => Status::InProgress,
        "PUBLISHED" => Status::Published,
        "RETRY" => Status::Retry,
        "QUARANTINED" => Status::Quarantined,
        other => return Err(err(format!("unknown outbox status {other}"))),
    };
    let tenant_raw: String = row.try_get("tenant_id")?;
    let tenant = TenantId::parse(&tenant_raw)?;
    let headers_json: serde_json::Value = row.try_get("headers")?;
    let headers: BTreeMap<String, String> = serde_json::from_value(headers_json).unwrap_or_default();
    let entity_version: Option<i64> = row.try_get("entity_version")?;
    let created_at: chrono::DateTime<Utc> = row.try_get("created_at")?;
    let available_at: chrono::DateTime<Utc> = row.try_get("available_at")?;
    let published_at: Option<chrono::DateTime<Utc>> = row.try_get("published_at")?;
    let attempts: i32 = row.try_get("attempts")?;
    let row_version: i64 = row.try_get("row_version")?;

    Ok(OutboxRow {
        id: row.try_get("id")?,
        tenant,
        topic: row.try_get("topic")?,
        event_key: row.try_get("event_key")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        entity_version: entity_version.map(|v| v as u64),
        payload: row.try_get("payload")?,
        headers,
        priority: row.try_get("priority")?,
        created_at_ms: created_at.timestamp_millis(),
        available_at_ms: available_at.timestamp_millis(),
        published_at_ms: published_at.map(|t| t.timestamp_millis()),
        status,
        attempts: attempts as u32,
        last_error: row.try_get("last_error")?,
        row_version: row_version as u64,
    })
}
