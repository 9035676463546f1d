// Housekeeping (§4.5) is explicitly not part of this crate's own
// scheduler: it's meant to be invoked by whatever cron-like process the
// deployment already runs. This module exposes the SQL and a thin runner
// so that caller can still go through `sqlx` without hand-rolling the
// queries, but it never spawns a task of its own.

use veggieshop_base::Result;

pub const DELETE_PUBLISHED_ROWS_SQL: &str = r#"
DELETE FROM outbox
WHERE id IN (
    SELECT id FROM outbox
    WHERE status = 'PUBLISHED' AND published_at < $1
    LIMIT $2
)
"#;

pub const DELETE_EXPIRED_DEDUPE_ROWS_SQL: &str = r#"
DELETE FROM dedupe
WHERE (tenant_id, event_id, version) IN (
    SELECT tenant_id, event_id, version FROM dedupe
    WHERE expires_at < $1
    LIMIT $2
)
"#;

/// Default batch size for both sweeps (§4.5: "bounded batches, e.g. LIMIT
/// 10000").
pub const DEFAULT_SWEEP_LIMIT: i64 = 10_000;

/// Deletes `PUBLISHED` rows whose `published_at` is older than
/// `retention_cutoff_ms`, in batches of `limit`, until a batch comes back
/// empty. Returns the total number of rows removed.
pub async fn sweep_published_rows(
    pool: &sqlx::PgPool,
    retention_cutoff_ms: i64,
    limit: i64,
) -> Result<u64> {
    let cutoff = crate::store::ms_to_timestamp(retention_cutoff_ms);
    let mut total = 0u64;
    loop {
        let result = sqlx::query(DELETE_PUBLISHED_ROWS_SQL)
            .bind(cutoff)
            .bind(limit)
            .execute(pool)
            .await?;
        let affected = result.rows_affected();
        total += affected;
        if affected == 0 || affected < limit as u64 {
            break;
        }
    }
    Ok(total)
}

/// Deletes dedupe rows whose `expires_at` has passed, in batches of
/// `limit`. TTL is enforced by the dedupe engine at insert time (≥ 7
/// days); this sweep only removes rows that have already expired.
pub async fn sweep_expired_dedupe_rows(pool: &sqlx::PgPool, now_ms: i64, limit: i64) -> Result<u64> {
    let now = crate::store::ms_to_timestamp(now_ms);
    let mut total = 0u64;
    loop {
        let result = sqlx::query(DELETE_EXPIRED_DEDUPE_ROWS_SQL)
            .bind(now)
            .bind(limit)
            .execute(pool)
            .await?;
        let affected = result.rows_affected();
        total += affected;
        if affected == 0 || affected < limit as u64 {
            break;
        }
    }
    Ok(total)
}
