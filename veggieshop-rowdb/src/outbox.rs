// The embedded backend expresses the claim step as a single write
// transaction that scans the pending index and flips status in place --
// `redb` has no cross-process lock contention to skip the way Postgres's
// `FOR UPDATE SKIP LOCKED` does, so a plain scan-then-mutate under one
// transaction is already exclusive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use veggieshop_base::{err, Result, TenantId};
use veggieshop_outbox::{NewOutboxRow, OutboxRow, OutboxStore, Status};

const ROWS: TableDefinition<u64, &[u8]> = TableDefinition::new("outbox_rows");
const IDS: TableDefinition<&str, u64> = TableDefinition::new("outbox_ids");
const NEXT_ID_KEY: &str = "next_id";

#[derive(Serialize, Deserialize, Clone)]
struct WireRow {
    id: u64,
    tenant: String,
    topic: String,
    event_key: Option<Vec<u8>>,
    aggregate_type: Option<String>,
    aggregate_id: Option<String>,
    event_type: Option<String>,
    entity_version: Option<u64>,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
    priority: i32,
    created_at_ms: i64,
    available_at_ms: i64,
    published_at_ms: Option<i64>,
    status: u8,
    attempts: u32,
    last_error: Option<String>,
    row_version: u64,
}

fn status_to_u8(s: Status) -> u8 {
    match s {
        Status::Pending => 0,
        Status::InProgress => 1,
        Status::Published => 2,
        Status::Retry => 3,
        Status::Quarantined => 4,
    }
}

fn status_from_u8(v: u8) -> Result<Status> {
    match v {
        0 => Ok(Status::Pending),
        1 => Ok(Status::InProgress),
        2 => Ok(Status::Published),
        3 => Ok(Status::Retry),
        4 => Ok(Status::Quarantined),
        other => Err(err(format!("unknown outbox status byte {other}"))),
    }
}

fn to_wire(row: &OutboxRow) -> WireRow {
    WireRow {
        id: row.id as u64,
        tenant: row.tenant.as_str().to_string(),
        topic: row.topic.clone(),
        event_key: row.event_key.clone(),
        aggregate_type: row.aggregate_type.clone(),
        aggregate_id: row.aggregate_id.clone(),
        event_type: row.event_type.clone(),
        entity_version: row.entity_version,
        payload: row.payload.clone(),
        headers: row.headers.clone(),
        priority: row.priority,
        created_at_ms: row.created_at_ms,
        available_at_ms: row.available_at_ms,
        published_at_ms: row.published_at_ms,
        status: status_to_u8(row.status),
        attempts: row.attempts,
        last_error: row.last_error.clone(),
        row_version: row.row_version,
    }
}

fn from_wire(row: WireRow) -> Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.id as i64,
        tenant: TenantId::parse(&row.tenant)?,
        topic: row.topic,
        event_key: row.event_key,
        aggregate_type: row.aggregate_type,
        aggregate_id: row.aggregate_id,
        event_type: row.event_type,
        entity_version: row.entity_version,
        payload: row.payload,
        headers: row.headers,
        priority: row.priority,
        created_at_ms: row.created_at_ms,
        available_at_ms: row.available_at_ms,
        published_at_ms: row.published_at_ms,
        status: status_from_u8(row.status)?,
        attempts: row.attempts,
        last_error: row.last_error,
        row_version: row.row_version,
    })
}

pub struct RedbOutboxStore {
    db: Arc<Database>,
    next_id: AtomicI64,
}

impl RedbOutboxStore {
    /// Opens (or creates) the tables and primes the id counter from the
    /// highest row already on disk, so restarts don't reuse ids.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let highest = {
            let txn = db.begin_read()?;
            match txn.open_table(ROWS) {
                Ok(table) => match table.iter()?.next_back() {
                    Some(entry) => entry?.0.value(),
                    None => 0,
                },
                Err(redb::TableError::TableDoesNotExist(_)) => 0,
                Err(e) => return Err(e.into()),
            }
        };
        Ok(Self { db, next_id: AtomicI64::new(highest as i64) })
    }
}

#[async_trait::async_trait]
impl OutboxStore for RedbOutboxStore {
    async fn insert(&self, row: NewOutboxRow, now_ms: i64) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || insert_blocking(&db, id, row, now_ms))
            .await
            .map_err(|e| err(format!("outbox store task panicked: {e}")))??;
        Ok(id)
    }

    async fn claim(&self, _worker: &str, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxRow>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || claim_blocking(&db, batch_size, now_ms))
            .await
            .map_err(|e| err(format!("outbox store task panicked: {e}")))?
    }

    async fn mark_published(
        &self,
        id: i64,
        now_ms: i64,
        partition: Option<i32>,
        offset: Option<i64>,
    ) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            mutate_row(&db, id, |row| {
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
            })
        })
        .await
        .map_err(|e| err(format!("outbox store task panicked: {e}")))?
    }

    async fn mark_retry(&self, id: i64, available_at_ms: i64, last_error: String) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            mutate_row(&db, id, |row| {
                row.status = Status::Retry;
                row.available_at_ms = available_at_ms;
                row.last_error = Some(last_error.clone());
                row.row_version += 1;
            })
        })
        .await
        .map_err(|e| err(format!("outbox store task panicked: {e}")))?
    }

    async fn mark_quarantined(&self, id: i64, last_error: String) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            mutate_row(&db, id, |row| {
                row.status = Status::Quarantined;
                row.last_error = Some(last_error.clone());
                row.row_version += 1;
            })
        })
        .await
        .map_err(|e| err(format!("outbox store task panicked: {e}")))?
    }
}

fn insert_blocking(db: &Database, id: i64, row: NewOutboxRow, now_ms: i64) -> Result<()> {
    let wire = WireRow {
        id: id as u64,
        tenant: row.tenant.as_str().to_string(),
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
        status: status_to_u8(Status::Pending),
        attempts: 0,
        last_error: None,
        row_version: 1,
    };
    let bytes = rmp_serde::to_vec(&wire)?;
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(ROWS)?;
        table.insert(id as u64, bytes.as_slice())?;
    }
    txn.commit()?;
    Ok(())
}

fn claim_blocking(db: &Database, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxRow>> {
    let txn = db.begin_write()?;
    let claimed;
    {
        let mut table = txn.open_table(ROWS)?;
        let mut candidates = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let wire: WireRow = rmp_serde::from_slice(value.value())?;
            let status = status_from_u8(wire.status)?;
            if matches!(status, Status::Pending | Status::Retry) && wire.available_at_ms <= now_ms {
                candidates.push((key.value(), wire));
            }
        }
        candidates.sort_by_key(|(id, w)| (std::cmp::Reverse(w.priority), w.created_at_ms, *id));
        candidates.truncate(batch_size);

        let mut out = Vec::with_capacity(candidates.len());
        for (id, mut wire) in candidates {
            wire.status = status_to_u8(Status::InProgress);
            wire.attempts += 1;
            wire.row_version += 1;
            let bytes = rmp_serde::to_vec(&wire)?;
            table.insert(id, bytes.as_slice())?;
            out.push(from_wire(wire)?);
        }
        claimed = out;
    }
    txn.commit()?;
    Ok(claimed)
}

fn mutate_row(db: &Database, id: i64, f: impl FnOnce(&mut WireRow)) -> Result<()> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(ROWS)?;
        let mut wire: WireRow = match table.get(id as u64)? {
            Some(v) => rmp_serde::from_slice(v.value())?,
            None => return Err(err(format!("unknown outbox row {id}"))),
        };
        f(&mut wire);
        let bytes = rmp_serde::to_vec(&wire)?;
        table.insert(id as u64, bytes.as_slice())?;
    }
    txn.commit()?;
    Ok(())
}
