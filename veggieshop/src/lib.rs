// A server collects together all resources necessary to answer requests
// consistently for every tenant it serves: the watermark/token substrate,
// the outbox draining loop, the dedupe engine, and the HTTP boundary that
// fronts them.
//
// A server always wires the same shape regardless of which storage
// backend it ends up using -- `Server::build` picks between `sqlx`
// (Postgres) and `veggieshop-rowdb` (embedded `redb`) based on
// `AppConfig.storage.kind`, but every resource above that line is
// identical either way.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use veggieshop_adapt::{HttpWebhookPublisher, LoggingPublisher, Publisher};
use veggieshop_admin::{AppConfig, PublisherKind, StorageKind};
use veggieshop_auth::{HmacSigner, Signer};
use veggieshop_base::{err, Result, SystemClock};
use veggieshop_http::{AppState, IdempotencyCache};
use veggieshop_outbox::{Drainer, DrainerConfig, OutboxStore, PgOutboxStore, Scheduler, SchedulerConfig};
use veggieshop_txn::{
    ConsistencyConfig, ConsistencyEngine, DedupeEngine, DedupePolicy, DedupeStore,
    InMemoryWatermarkStore, PgDedupeStore, StaticPolicyProvider, WatermarkStore,
};

/// Everything a running process needs: the resources a handler reaches
/// through `veggieshop_http::AppState`, plus the background scheduler that
/// drains the outbox. Built once at startup and handed to `run`.
pub struct Server {
    pub config: AppConfig,
    pub http_state: AppState,
    pub dedupe: Arc<DedupeEngine>,
    scheduler: Arc<Scheduler>,
}

impl Server {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let clock: Arc<dyn veggieshop_base::Clock> = Arc::new(SystemClock);
        let signer: Arc<dyn Signer> = Arc::new(HmacSigner::new(
            config.auth.active_key_id.clone(),
            vec![(
                config.auth.active_key_id.clone(),
                config.auth.active_key_secret.clone().into_bytes(),
            )],
        ));

        let (watermark_store, outbox_store, dedupe_store): (
            Arc<dyn WatermarkStore>,
            Arc<dyn OutboxStore>,
            Arc<dyn DedupeStore>,
        ) = match config.storage.kind {
            StorageKind::Postgres => {
                let pool = sqlx::PgPool::connect(&config.storage.database_url)
                    .await
                    .map_err(|e| err(format!("failed to connect to postgres: {e}")))?;
                // No durable Postgres-backed watermark store is named in
                // the design (§4.2 lists only in-process and `redb`): the
                // watermark is process-local liveness state even when the
                // outbox/dedupe tables live in Postgres.
                (
                    Arc::new(InMemoryWatermarkStore::new()),
                    Arc::new(PgOutboxStore::new(pool.clone())),
                    Arc::new(PgDedupeStore::new(pool)),
                )
            }
            StorageKind::EmbeddedRedb => {
                let db = veggieshop_rowdb::open(&config.storage.redb_path)?;
                let outbox = veggieshop_rowdb::RedbOutboxStore::new(db.clone())?;
                (
                    Arc::new(veggieshop_rowdb::RedbWatermarkStore::new(db.clone())),
                    Arc::new(outbox),
                    Arc::new(veggieshop_rowdb::RedbDedupeStore::new(db)),
                )
            }
        };

        let consistency_config = ConsistencyConfig {
            token_ttl_ms: config.consistency.token_ttl_ms,
            clock_skew_ms: config.consistency.clock_skew_ms,
            ryw_max_wait_ms: config.consistency.ryw_max_wait_ms,
            ryw_initial_poll_ms: config.consistency.ryw_initial_poll_ms,
            ryw_max_poll_ms: config.consistency.ryw_max_poll_ms,
        };
        let consistency = Arc::new(ConsistencyEngine::new(
            watermark_store,
            clock.clone(),
            signer,
            consistency_config,
        ));

        let dedupe_policy = Arc::new(StaticPolicyProvider(DedupePolicy {
            min_accepted_version: config.dedupe.min_accepted_version,
            replay_window_ms: config.dedupe.replay_window_ms,
            max_future_skew_ms: config.dedupe.max_future_skew_ms,
        }));
        let dedupe = Arc::new(DedupeEngine::new(
            dedupe_store,
            dedupe_policy,
            clock.clone(),
            config.dedupe.ttl_ms,
        ));

        let idempotency = Arc::new(IdempotencyCache::new(clock.clone(), config.dedupe.ttl_ms, 5_000));
        let http_state = AppState::new(consistency, idempotency);

        let publisher: Arc<dyn Publisher> = match config.publisher.kind {
            PublisherKind::Logging => Arc::new(LoggingPublisher),
            PublisherKind::HttpWebhook => {
                Arc::new(HttpWebhookPublisher::new(config.publisher.webhook_base_url.clone()))
            }
        };
        let drainer_config = DrainerConfig {
            batch_size: config.outbox.batch_size,
            parallelism: config.outbox.parallelism,
            max_attempts: config.outbox.max_attempts,
            base_backoff_ms: config.outbox.base_backoff_ms,
            max_backoff_ms: config.outbox.max_backoff_ms,
        };
        let drainer = Arc::new(Drainer::new(outbox_store, publisher, clock, drainer_config));
        let scheduler_config = SchedulerConfig {
            initial_delay_ms: config.outbox.scheduler.initial_delay_ms,
            interval_ms: config.outbox.scheduler.interval_ms,
            burst_batches: config.outbox.scheduler.burst_batches,
            max_burst_duration_ms: config.outbox.scheduler.max_burst_duration_ms,
            idle_sleep_ms: config.outbox.scheduler.idle_sleep_ms,
            shutdown_grace_ms: 500,
        };
        let scheduler = Arc::new(Scheduler::new(drainer, scheduler_config, "veggieshop-outbox"));

        Ok(Self {
            config,
            http_state,
            dedupe,
            scheduler,
        })
    }

    /// Runs the outbox scheduler loop and the HTTP listener concurrently
    /// until `cancel` fires. Route wiring belongs to the caller (typically
    /// `main`, or an integration test): this only supplies the
    /// middleware-wrapped state every route needs.
    pub async fn run(self, routes: axum::Router<AppState>, addr: std::net::SocketAddr, cancel: CancellationToken) -> Result<()> {
        let router = veggieshop_http::build_router(routes, self.http_state);

        let scheduler = self.scheduler.clone();
        let scheduler_cancel = cancel.clone();
        let mut scheduler_task = tokio::spawn(async move {
            scheduler.run(scheduler_cancel).await;
        });

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| err(format!("failed to bind {addr}: {e}")))?;
        tracing::info!(target: "veggieshop", %addr, "listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| err(format!("http server error: {e}")))?;

        // `Scheduler::run` already bounds any in-flight drain cycle to
        // `shutdown_grace_ms` on cancellation; this is a backstop against
        // the scheduler task itself wedging, so shutdown never blocks
        // indefinitely regardless.
        let grace = std::time::Duration::from_millis(1_000);
        tokio::select! {
            _ = &mut scheduler_task => {}
            _ = tokio::time::sleep(grace) => {
                scheduler_task.abort();
                tracing::warn!(target: "veggieshop", "outbox_scheduler_task_did_not_stop_in_time");
            }
        }
        Ok(())
    }
}
