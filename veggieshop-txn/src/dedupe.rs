// Consumer-side dedupe: before a consumer applies an event's side effects,
// it calls `check_and_mark`. Exactly one caller for a given
// `(tenant, event_id, version)` gets `AcceptFirstSeen`; everyone else gets
// `Duplicate` or a quarantine decision. The store is the source of truth
// for the first-writer-wins guarantee; the in-process cache in front of it
// is purely an optimization (a cache miss never produces a wrong answer,
// only an extra store round trip).

use std::sync::Arc;

use dashmap::DashMap;
use veggieshop_base::{Clock, TenantId};

const MIN_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1_000;

/// Outcome of a dedupe check (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    AcceptFirstSeen,
    Duplicate,
    QuarantineTooOldVersion,
    QuarantineOutsideReplayWindow,
    QuarantineFutureSkew,
    QuarantineStoreError,
}

impl Decision {
    fn as_tracing_str(&self) -> &'static str {
        match self {
            Decision::AcceptFirstSeen => "accept",
            Decision::Duplicate => "duplicate",
            Decision::QuarantineTooOldVersion
            | Decision::QuarantineOutsideReplayWindow
            | Decision::QuarantineFutureSkew => "quarantine",
            Decision::QuarantineStoreError => "error",
        }
    }
}

/// Per-`(tenant, family)` admission fences, resolved by a [`PolicyProvider`].
#[derive(Clone, Copy, Debug)]
pub struct DedupePolicy {
    pub min_accepted_version: u64,
    pub replay_window_ms: i64,
    pub max_future_skew_ms: i64,
}

impl Default for DedupePolicy {
    fn default() -> Self {
        Self {
            min_accepted_version: 0,
            replay_window_ms: 7 * 24 * 60 * 60 * 1_000,
            max_future_skew_ms: 5 * 60 * 1_000,
        }
    }
}

pub trait PolicyProvider: Send + Sync {
    fn policy_for(&self, tenant: &TenantId, family: Option<&str>) -> DedupePolicy;
}

/// The default provider: one static policy for every tenant and family,
/// sourced from `AppConfig.dedupe`. A per-tenant override provider can be
/// layered in later without touching the engine.
pub struct StaticPolicyProvider(pub DedupePolicy);

impl PolicyProvider for StaticPolicyProvider {
    fn policy_for(&self, _tenant: &TenantId, _family: Option<&str>) -> DedupePolicy {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Durable dedupe row store SPI (§3 `DedupeRow`). Implementations must make
/// the insert atomic across concurrent callers racing the same key: a
/// `sqlx::PgPool` implementation backed by a unique index (production) or
/// the `redb` implementation in `veggieshop-rowdb` (embedded/dev).
#[async_trait::async_trait]
pub trait DedupeStore: Send + Sync {
    /// First-writer-wins insert of `(tenant, event_id, version)`. On
    /// conflict, bump the row's `lastSeenAt`/`seenCount` best-effort and
    /// return `AlreadyPresent`; a failure to bump must not surface as an
    /// error, since the duplicate decision itself is already correct.
    async fn try_insert(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: u64,
        now_ms: i64,
        expires_at_ms: i64,
    ) -> veggieshop_base::Result<InsertOutcome>;
}

#[derive(Clone, Debug)]
struct DedupeRow {
    first_seen_ms: i64,
    last_seen_ms: i64,
    expires_at_ms: i64,
    seen_count: u64,
}

type RowKey = (TenantId, String, u64);

/// In-process dedupe store, for tests and single-node deployments without
/// a durable backend wired in. Rows are swept lazily on access; there is
/// no background sweeper (housekeeping over a durable store belongs to
/// `veggieshop-outbox::housekeeping`, not here).
#[derive(Default)]
pub struct InMemoryDedupeStore {
    rows: DashMap<RowKey, DedupeRow>,
}

impl InMemoryDedupeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DedupeStore for InMemoryDedupeStore {
    async fn try_insert(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: u64,
        now_ms: i64,
        expires_at_ms: i64,
    ) -> veggieshop_base::Result<InsertOutcome> {
        let key = (tenant.clone(), event_id.to_string(), version);
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(DedupeRow {
                    first_seen_ms: now_ms,
                    last_seen_ms: now_ms,
                    expires_at_ms,
                    seen_count: 1,
                });
                Ok(InsertOutcome::Inserted)
            }
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                if o.get().expires_at_ms <= now_ms {
                    // Expired row: treat this as a fresh first-writer.
                    o.insert(DedupeRow {
                        first_seen_ms: now_ms,
                        last_seen_ms: now_ms,
                        expires_at_ms,
                        seen_count: 1,
                    });
                    return Ok(InsertOutcome::Inserted);
                }
                let row = o.get_mut();
                row.last_seen_ms = now_ms;
                row.seen_count += 1;
                Ok(InsertOutcome::AlreadyPresent)
            }
        }
    }
}

/// Production store: Postgres via `sqlx`, first-writer-wins via a unique
/// index on `(tenant_id, event_id, version)`. A conflicting insert is not
/// an error -- it's the `AlreadyPresent` signal -- so the insert is an
/// `ON CONFLICT DO UPDATE` that bumps `last_seen_at`/`seen_count` and
/// reports which branch fired via `xmax`, the same trick `INSERT ...
/// RETURNING` tricks commonly use to distinguish insert from update.
pub struct PgDedupeStore {
    pool: sqlx::PgPool,
}

impl PgDedupeStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn ms_to_timestamp(ms: i64) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    chrono::Utc.timestamp_millis_opt(ms).single().unwrap_or_else(chrono::Utc::now)
}

#[async_trait::async_trait]
impl DedupeStore for PgDedupeStore {
    async fn try_insert(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: u64,
        now_ms: i64,
        expires_at_ms: i64,
    ) -> veggieshop_base::Result<InsertOutcome> {
        let now = ms_to_timestamp(now_ms);
        let expires_at = ms_to_timestamp(expires_at_ms);
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO dedupe
                (tenant_id, event_id, version, first_seen_at, last_seen_at, expires_at, seen_count)
            VALUES ($1, $2, $3, $4, $4, $5, 1)
            ON CONFLICT (tenant_id, event_id, version) DO UPDATE SET
                last_seen_at = $4,
                seen_count = dedupe.seen_count + 1,
                first_seen_at = CASE
                    WHEN dedupe.expires_at <= $4 THEN $4
                    ELSE dedupe.first_seen_at
                END,
                expires_at = CASE
                    WHEN dedupe.expires_at <= $4 THEN $5
                    ELSE dedupe.expires_at
                END
            WHERE dedupe.expires_at <= $4
            RETURNING true
            "#,
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .bind(version as i64)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(false);

        if inserted {
            return Ok(InsertOutcome::Inserted);
        }

        // The row already existed and was still live: bump its counters on
        // a best-effort basis (§4.4 -- a failure here must not surface,
        // the duplicate decision is already correct without it).
        let _ = sqlx::query(
            r#"UPDATE dedupe SET last_seen_at = $4, seen_count = seen_count + 1
               WHERE tenant_id = $1 AND event_id = $2 AND version = $3"#,
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .bind(version as i64)
        .bind(now)
        .execute(&self.pool)
        .await;

        Ok(InsertOutcome::AlreadyPresent)
    }
}

struct FastCacheEntry {
    expires_at_ms: i64,
}

/// The dedupe engine (C4). Owns the durable store, the policy provider, and
/// an in-process fast-path cache that lets a hot duplicate key skip the
/// store round trip entirely.
pub struct DedupeEngine {
    store: Arc<dyn DedupeStore>,
    policy: Arc<dyn PolicyProvider>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    fast_cache: DashMap<RowKey, FastCacheEntry>,
}

impl DedupeEngine {
    pub fn new(
        store: Arc<dyn DedupeStore>,
        policy: Arc<dyn PolicyProvider>,
        clock: Arc<dyn Clock>,
        ttl_ms: i64,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
            ttl_ms: ttl_ms.max(MIN_TTL_MS),
            fast_cache: DashMap::new(),
        }
    }

    /// §4.4's `check_and_mark`. Fence evaluation order is version floor,
    /// then future skew, then replay window (skipped when
    /// `operator_replay`); time-based fences are skipped entirely when
    /// `event_ts_ms` is absent.
    pub async fn check_and_mark(
        &self,
        tenant: &TenantId,
        event_id: &str,
        version: u64,
        event_ts_ms: Option<i64>,
        family: Option<&str>,
        operator_replay: bool,
    ) -> Decision {
        let policy = self.policy.policy_for(tenant, family);
        let now_ms = self.clock.now_ms();

        if version < policy.min_accepted_version {
            return self.record(tenant, family, event_id, Decision::QuarantineTooOldVersion);
        }
        if let Some(ts) = event_ts_ms {
            if ts > now_ms + policy.max_future_skew_ms {
                return self.record(tenant, family, event_id, Decision::QuarantineFutureSkew);
            }
            if !operator_replay && ts < now_ms - policy.replay_window_ms {
                return self.record(
                    tenant,
                    family,
                    event_id,
                    Decision::QuarantineOutsideReplayWindow,
                );
            }
        }

        let key = (tenant.clone(), event_id.to_string(), version);
        if let Some(entry) = self.fast_cache.get(&key) {
            if entry.expires_at_ms > now_ms {
                return self.record(tenant, family, event_id, Decision::Duplicate);
            }
        }

        let expires_at_ms = now_ms + self.ttl_ms;
        let decision = match self
            .store
            .try_insert(tenant, event_id, version, now_ms, expires_at_ms)
            .await
        {
            Ok(InsertOutcome::Inserted) => Decision::AcceptFirstSeen,
            Ok(InsertOutcome::AlreadyPresent) => Decision::Duplicate,
            Err(err) => {
                tracing::error!(target: "veggieshop", tenant = %tenant, event_id_hash = %hash_event_id(event_id), error = ?err, "dedupe_store_error");
                return self.record(tenant, family, event_id, Decision::QuarantineStoreError);
            }
        };

        self.fast_cache.insert(key, FastCacheEntry { expires_at_ms });
        self.record(tenant, family, event_id, decision)
    }

    fn record(&self, tenant: &TenantId, family: Option<&str>, event_id: &str, decision: Decision) -> Decision {
        tracing::info!(
            target: "veggieshop",
            tenant = %tenant,
            family = family.unwrap_or(""),
            event_id_hash = %hash_event_id(event_id),
            reason = decision.as_tracing_str(),
            "dedupe_decision"
        );
        decision
    }
}

/// `event_id` never appears in a log line verbatim (§4.4's observability
/// contract); a short `blake3` digest is enough to correlate repeats
/// without leaking event content.
fn hash_event_id(event_id: &str) -> String {
    blake3::hash(event_id.as_bytes()).to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use veggieshop_base::FakeClock;

    fn tenant(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn engine(policy: DedupePolicy, now_ms: i64) -> (DedupeEngine, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(now_ms));
        let store: Arc<dyn DedupeStore> = Arc::new(InMemoryDedupeStore::new());
        let policy_provider: Arc<dyn PolicyProvider> = Arc::new(StaticPolicyProvider(policy));
        let eng = DedupeEngine::new(store, policy_provider, clock.clone(), 10 * 24 * 60 * 60 * 1_000);
        (eng, clock)
    }

    #[tokio::test]
    async fn first_seen_is_accepted() {
        let (eng, _clock) = engine(DedupePolicy::default(), 1_000_000);
        let d = eng
            .check_and_mark(&tenant("acme"), "e1", 1, Some(1_000_000), Some("orders"), false)
            .await;
        assert_eq!(d, Decision::AcceptFirstSeen);
    }

    #[tokio::test]
    async fn second_seen_is_duplicate() {
        let (eng, _clock) = engine(DedupePolicy::default(), 1_000_000);
        let t = tenant("acme");
        let first = eng.check_and_mark(&t, "e1", 1, Some(1_000_000), None, false).await;
        let second = eng.check_and_mark(&t, "e1", 1, Some(1_000_000), None, false).await;
        assert_eq!(first, Decision::AcceptFirstSeen);
        assert_eq!(second, Decision::Duplicate);
    }

    #[tokio::test]
    async fn concurrent_duplicates_exactly_one_accept() {
        let (eng, _clock) = engine(DedupePolicy::default(), 1_000_000);
        let eng = Arc::new(eng);
        let t = tenant("acme");
        let mut handles = Vec::new();
        for _ in 0..20 {
            let eng = eng.clone();
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                eng.check_and_mark(&t, "e1", 7, Some(1_000_000), Some("f"), false).await
            }));
        }
        let mut accepted = 0;
        let mut duplicate = 0;
        for h in handles {
            match h.await.unwrap() {
                Decision::AcceptFirstSeen => accepted += 1,
                Decision::Duplicate => duplicate += 1,
                other => panic!("unexpected decision {other:?}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(duplicate, 19);
    }

    #[tokio::test]
    async fn version_below_floor_is_quarantined() {
        let policy = DedupePolicy {
            min_accepted_version: 5,
            ..DedupePolicy::default()
        };
        let (eng, _clock) = engine(policy, 1_000_000);
        let d = eng
            .check_and_mark(&tenant("acme"), "e1", 4, Some(1_000_000), None, false)
            .await;
        assert_eq!(d, Decision::QuarantineTooOldVersion);
    }

    #[tokio::test]
    async fn future_skew_is_quarantined() {
        let policy = DedupePolicy {
            max_future_skew_ms: 1_000,
            ..DedupePolicy::default()
        };
        let (eng, _clock) = engine(policy, 1_000_000);
        let d = eng
            .check_and_mark(&tenant("acme"), "e1", 1, Some(1_000_000 + 5_000), None, false)
            .await;
        assert_eq!(d, Decision::QuarantineFutureSkew);
    }

    #[tokio::test]
    async fn replay_outside_window_is_quarantined_unless_operator_replay() {
        let policy = DedupePolicy {
            replay_window_ms: 10 * 24 * 60 * 60 * 1_000,
            ..DedupePolicy::default()
        };
        let now = 40 * 24 * 60 * 60 * 1_000i64;
        let (eng, _clock) = engine(policy, now);
        let old_ts = now - 30 * 24 * 60 * 60 * 1_000;

        let rejected = eng
            .check_and_mark(&tenant("acme"), "e1", 1, Some(old_ts), None, false)
            .await;
        assert_eq!(rejected, Decision::QuarantineOutsideReplayWindow);

        let accepted = eng
            .check_and_mark(&tenant("acme"), "e2", 1, Some(old_ts), None, true)
            .await;
        assert_eq!(accepted, Decision::AcceptFirstSeen);
    }

    #[tokio::test]
    async fn absent_timestamp_skips_time_fences() {
        let policy = DedupePolicy {
            replay_window_ms: 1,
            max_future_skew_ms: 1,
            ..DedupePolicy::default()
        };
        let (eng, _clock) = engine(policy, 1_000_000);
        let d = eng
            .check_and_mark(&tenant("acme"), "e1", 1, None, None, false)
            .await;
        assert_eq!(d, Decision::AcceptFirstSeen);
    }

    struct AlwaysFailsStore;

    #[async_trait::async_trait]
    impl DedupeStore for AlwaysFailsStore {
        async fn try_insert(
            &self,
            _tenant: &TenantId,
            _event_id: &str,
            _version: u64,
            _now_ms: i64,
            _expires_at_ms: i64,
        ) -> veggieshop_base::Result<InsertOutcome> {
            Err(veggieshop_base::err("store unreachable"))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let clock = Arc::new(FakeClock::new(1_000_000));
        let policy: Arc<dyn PolicyProvider> = Arc::new(StaticPolicyProvider(DedupePolicy::default()));
        let eng = DedupeEngine::new(Arc::new(AlwaysFailsStore), policy, clock, MIN_TTL_MS);
        let d = eng
            .check_and_mark(&tenant("acme"), "e1", 1, Some(1_000_000), None, false)
            .await;
        assert_eq!(d, Decision::QuarantineStoreError);
    }

    #[tokio::test]
    async fn ttl_below_minimum_is_clamped() {
        let (eng, _clock) = engine(DedupePolicy::default(), 0);
        assert_eq!(eng.ttl_ms, MIN_TTL_MS);
    }
}
