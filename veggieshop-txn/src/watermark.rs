// Each tenant has exactly one watermark: an epoch-millisecond high-water
// mark for "everything up to here has been durably written and is safe to
// read". It only ever moves forward. The SPI design note asks for this to
// be pluggable (in-process for tests and light deployments, a durable
// store for production) and for the advance to be expressed as a CAS/`max`,
// never a read-then-write race -- `DashMap`'s per-shard locking gives us
// that for free without a global mutex across tenants.

use dashmap::DashMap;
use veggieshop_base::{Clock, TenantId};

#[async_trait::async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Current watermark for `tenant`, or 0 if the tenant has never
    /// written anything this store has observed.
    async fn current(&self, tenant: &TenantId) -> i64;

    /// Atomically set `current(tenant) = max(current(tenant), ms)` and
    /// return the resulting value.
    async fn advance_at_least(&self, tenant: &TenantId, ms: i64) -> i64;
}

/// In-process watermark store, the default for tests and single-node
/// deployments without a durable backend wired in.
#[derive(Default)]
pub struct InMemoryWatermarkStore {
    marks: DashMap<TenantId, i64>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn current(&self, tenant: &TenantId) -> i64 {
        self.marks.get(tenant).map(|v| *v).unwrap_or(0)
    }

    async fn advance_at_least(&self, tenant: &TenantId, ms: i64) -> i64 {
        // `DashMap::entry` takes the shard lock for the duration of the
        // closure, which is exactly the CAS semantics we need: no other
        // writer for this tenant can observe a torn read-modify-write.
        let mut entry = self.marks.entry(tenant.clone()).or_insert(0);
        if ms > *entry {
            *entry = ms;
        }
        *entry
    }
}

/// Convenience built on top of [`WatermarkStore::advance_at_least`]: advance
/// a tenant's watermark to the current time.
pub async fn advance_to_now(
    store: &dyn WatermarkStore,
    clock: &dyn Clock,
    tenant: &TenantId,
) -> i64 {
    store.advance_at_least(tenant, clock.now_ms()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use veggieshop_base::SystemClock;

    fn tenant(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn starts_at_zero() {
        let store = InMemoryWatermarkStore::new();
        assert_eq!(store.current(&tenant("acme")).await, 0);
    }

    #[tokio::test]
    async fn advance_at_least_is_max() {
        let store = InMemoryWatermarkStore::new();
        let t = tenant("acme");
        assert_eq!(store.advance_at_least(&t, 100).await, 100);
        assert_eq!(store.advance_at_least(&t, 50).await, 100); // no regress
        assert_eq!(store.advance_at_least(&t, 200).await, 200);
        assert_eq!(store.current(&t).await, 200);
    }

    #[tokio::test]
    async fn tenants_are_independent() {
        let store = InMemoryWatermarkStore::new();
        store.advance_at_least(&tenant("acme"), 500).await;
        assert_eq!(store.current(&tenant("other")).await, 0);
    }

    #[tokio::test]
    async fn advance_to_now_uses_clock() {
        let store = InMemoryWatermarkStore::new();
        let clock = veggieshop_base::FakeClock::new(42);
        let t = tenant("acme");
        let got = advance_to_now(&store, &clock, &t).await;
        assert_eq!(got, 42);
        let _ = SystemClock; // SystemClock exists and implements Clock
    }

    #[tokio::test]
    async fn concurrent_advances_are_monotonic() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryWatermarkStore::new());
        let t = tenant("acme");
        let mut handles = Vec::new();
        for i in 1..=100i64 {
            let store = store.clone();
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                store.advance_at_least(&t, i * 10).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.current(&t).await, 1000);
    }

    proptest::proptest! {
        #[test]
        fn current_is_non_decreasing(advances in proptest::collection::vec(0i64..100_000, 1..50)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = InMemoryWatermarkStore::new();
                let t = tenant("acme");
                let mut last = 0i64;
                for v in advances {
                    let cur = store.advance_at_least(&t, v).await;
                    proptest::prop_assert!(cur >= last);
                    last = cur;
                }
                Ok(())
            }).unwrap();
        }
    }
}
