// One drain cycle: claim a batch, publish each claimed row up to
// `parallelism` at a time, and don't return until every publish in the
// batch has settled (success, retry, or quarantine). The `Semaphore` +
// `JoinSet` pairing is the same bounded-fan-out shape the corpus uses for
// background pollers: spawn per item, but never more in flight than the
// semaphore allows, and always drain the `JoinSet` before returning.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use veggieshop_adapt::{PublishOutcome, Publisher};
use veggieshop_base::{Clock, Result};

use crate::model::OutboxRow;
use crate::store::OutboxStore;

#[derive(Clone, Copy, Debug)]
pub struct DrainerConfig {
    pub batch_size: usize,
    pub parallelism: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            parallelism: 8,
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Tally of one drain cycle, reported by the scheduler as a `tracing` event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub quarantined: usize,
    pub errored: usize,
}

pub struct Drainer {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    config: DrainerConfig,
}

impl Drainer {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        config: DrainerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
        }
    }

    pub async fn run_cycle(&self, worker: &str) -> Result<DrainOutcome> {
        let now_ms = self.clock.now_ms();
        let claimed = self.store.claim(worker, self.config.batch_size, now_ms).await?;
        let mut outcome = DrainOutcome {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(outcome);
        }

        let width = self.config.parallelism.min(self.config.batch_size).max(1);
        let semaphore = Arc::new(Semaphore::new(width));
        let mut tasks: JoinSet<PublishResult> = JoinSet::new();

        for row in claimed {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let publisher = self.publisher.clone();
            let max_attempts = self.config.max_attempts;
            let base_backoff_ms = self.config.base_backoff_ms;
            let max_backoff_ms = self.config.max_backoff_ms;
            let now_ms = self.clock.now_ms();
            tasks.spawn(async move {
                let _permit = permit;
                publish_one(row, publisher.as_ref(), max_attempts, base_backoff_ms, max_backoff_ms, now_ms).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => self.apply_result(result, &mut outcome).await,
                Err(join_err) => {
                    tracing::error!(target: "veggieshop", error = %join_err, "outbox_publish_task_panicked");
                    outcome.errored += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn apply_result(&self, result: PublishResult, outcome: &mut DrainOutcome) {
        let store_result = match &result.disposition {
            Disposition::Published { partition, offset } => {
                outcome.published += 1;
                self.store
                    .mark_published(result.id, self.clock.now_ms(), *partition, *offset)
                    .await
            }
            Disposition::Retry { available_at_ms, reason } => {
                outcome.retried += 1;
                self.store.mark_retry(result.id, *available_at_ms, reason.clone()).await
            }
            Disposition::Quarantined { reason } => {
                outcome.quarantined += 1;
                self.store.mark_quarantined(result.id, reason.clone()).await
            }
        };
        if let Err(err) = store_result {
            tracing::error!(target: "veggieshop", id = result.id, error = ?err, "outbox_store_update_failed");
            outcome.errored += 1;
        }
    }
}

enum Disposition {
    Published { partition: Option<i32>, offset: Option<i64> },
    Retry { available_at_ms: i64, reason: String },
    Quarantined { reason: String },
}

struct PublishResult {
    id: i64,
    disposition: Disposition,
}

async fn publish_one(
    row: OutboxRow,
    publisher: &dyn Publisher,
    max_attempts: u32,
    base_backoff_ms: i64,
    max_backoff_ms: i64,
    now_ms: i64,
) -> PublishResult {
    let mut headers = row.headers.clone();
    headers
        .entry("x-tenant-id".to_string())
        .or_insert_with(|| row.tenant.as_str().to_string());
    if let Some(v) = row.entity_version {
        headers.entry("x-entity-version".to_string()).or_insert_with(|| v.to_string());
    }
    if let Some(key) = &row.event_key {
        headers
            .entry("x-event-id".to_string())
            .or_insert_with(|| String::from_utf8_lossy(key).to_string());
    }

    let key = row.event_key.clone().unwrap_or_default();
    let disposition = match publisher.publish(&row.topic, &key, &row.payload, &headers).await {
        PublishOutcome::Published { partition, offset } => Disposition::Published { partition, offset },
        PublishOutcome::Rejected(reason) => Disposition::Quarantined { reason },
        PublishOutcome::Retryable(reason) => {
            if row.attempts >= max_attempts {
                Disposition::Quarantined { reason }
            } else {
                let backoff = backoff_with_jitter(row.attempts, base_backoff_ms, max_backoff_ms);
                Disposition::Retry {
                    available_at_ms: now_ms + backoff,
                    reason,
                }
            }
        }
    };

    PublishResult { id: row.id, disposition }
}

/// `min(base * 2^(attempts-1), max) + jitter(50..250ms)` (§4.5).
fn backoff_with_jitter(attempts: u32, base_ms: i64, max_ms: i64) -> i64 {
    let exp = attempts.saturating_sub(1).min(30);
    let scaled = base_ms.saturating_mul(1i64 << exp);
    let capped = scaled.min(max_ms).max(0);
    let jitter = rand::thread_rng().gen_range(50..=250);
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use veggieshop_base::{FakeClock, TenantId};

    use crate::model::NewOutboxRow;
    use crate::store::InMemoryOutboxStore;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn new_row() -> NewOutboxRow {
        NewOutboxRow {
            tenant: tenant(),
            topic: "orders".to_string(),
            event_key: Some(b"evt-1".to_vec()),
            aggregate_type: None,
            aggregate_id: None,
            event_type: None,
            entity_version: Some(3),
            payload: b"{}".to_vec(),
            headers: BTreeMap::new(),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn successful_publish_marks_published() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.insert(new_row(), 1_000).await.unwrap();
        let publisher = Arc::new(veggieshop_adapt::InMemoryPublisher::new());
        let clock = Arc::new(FakeClock::new(1_000));
        let drainer = Drainer::new(store.clone(), publisher.clone(), clock, DrainerConfig::default());

        let outcome = drainer.run_cycle("w1").await.unwrap();
        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.published, 1);
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].headers.get("x-tenant-id").unwrap(), "acme");
        assert_eq!(published[0].headers.get("x-entity-version").unwrap(), "3");
    }

    struct FlakyPublisher {
        calls: AtomicUsize,
        fail_times: usize,
    }

    #[async_trait::async_trait]
    impl Publisher for FlakyPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _key: &[u8],
            _value: &[u8],
            _headers: &BTreeMap<String, String>,
        ) -> PublishOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                PublishOutcome::Retryable("transient".to_string())
            } else {
                PublishOutcome::Published { partition: None, offset: None }
            }
        }
    }

    #[tokio::test]
    async fn transient_failure_goes_to_retry_then_recovers() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.insert(new_row(), 1_000).await.unwrap();
        let publisher = Arc::new(FlakyPublisher {
            calls: AtomicUsize::new(0),
            fail_times: 1,
        });
        let clock = Arc::new(FakeClock::new(1_000));
        let config = DrainerConfig {
            max_attempts: 5,
            base_backoff_ms: 10,
            max_backoff_ms: 1_000,
            ..DrainerConfig::default()
        };
        let drainer = Drainer::new(store.clone(), publisher.clone(), clock.clone(), config);

        let first = drainer.run_cycle("w1").await.unwrap();
        assert_eq!(first.retried, 1);

        clock.advance(10_000);
        let second = drainer.run_cycle("w1").await.unwrap();
        assert_eq!(second.published, 1);
    }

    struct AlwaysFailsPublisher;

    #[async_trait::async_trait]
    impl Publisher for AlwaysFailsPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _key: &[u8],
            _value: &[u8],
            _headers: &BTreeMap<String, String>,
        ) -> PublishOutcome {
            PublishOutcome::Retryable("down".to_string())
        }
    }

    #[tokio::test]
    async fn exhausting_attempts_quarantines() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.insert(new_row(), 1_000).await.unwrap();
        let publisher = Arc::new(AlwaysFailsPublisher);
        let clock = Arc::new(FakeClock::new(1_000));
        let config = DrainerConfig {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 10,
            ..DrainerConfig::default()
        };
        let drainer = Drainer::new(store.clone(), publisher, clock.clone(), config);

        for _ in 0..3 {
            drainer.run_cycle("w1").await.unwrap();
            clock.advance(1_000);
        }
        let last = drainer.run_cycle("w1").await.unwrap();
        assert_eq!(last.claimed, 0); // quarantined after attempt 3, no longer claimable
    }

    #[tokio::test]
    async fn rejection_quarantines_immediately() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.insert(new_row(), 1_000).await.unwrap();
        struct RejectingPublisher;
        #[async_trait::async_trait]
        impl Publisher for RejectingPublisher {
            async fn publish(
                &self,
                _topic: &str,
                _key: &[u8],
                _value: &[u8],
                _headers: &BTreeMap<String, String>,
            ) -> PublishOutcome {
                PublishOutcome::Rejected("bad payload".to_string())
            }
        }
        let clock = Arc::new(FakeClock::new(1_000));
        let drainer = Drainer::new(store.clone(), Arc::new(RejectingPublisher), clock, DrainerConfig::default());
        let outcome = drainer.run_cycle("w1").await.unwrap();
        assert_eq!(outcome.quarantined, 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let b1 = backoff_with_jitter(1, 100, 10_000);
        let b2 = backoff_with_jitter(2, 100, 10_000);
        assert!(b1 >= 150 && b1 <= 350);
        assert!(b2 >= 250 && b2 <= 450);
        let capped = backoff_with_jitter(20, 100, 1_000);
        assert!(capped <= 1_250);
    }
}
