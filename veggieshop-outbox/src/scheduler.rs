// Fixed-delay background loop driving the drainer. `tokio::time::interval`
// rather than a `sleep` loop so drift doesn't accumulate across ticks;
// `CancellationToken` rather than a channel so shutdown composes with
// whatever else the server assembly is already tearing down.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::drainer::{DrainOutcome, Drainer};

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub burst_batches: u32,
    pub max_burst_duration_ms: u64,
    pub idle_sleep_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            interval_ms: 1_000,
            burst_batches: 4,
            max_burst_duration_ms: 5_000,
            idle_sleep_ms: 2_000,
            shutdown_grace_ms: 500,
        }
    }
}

pub struct Scheduler {
    drainer: Arc<Drainer>,
    config: SchedulerConfig,
    worker: String,
}

impl Scheduler {
    pub fn new(drainer: Arc<Drainer>, config: SchedulerConfig, worker: impl Into<String>) -> Self {
        Self {
            drainer,
            config,
            worker: worker.into(),
        }
    }

    /// Runs until `cancel` fires. Each tick performs up to `burst_batches`
    /// drain cycles, bounded by `max_burst_duration`; an empty cycle ends
    /// the burst early and the loop sleeps `idle_sleep` before the next
    /// tick's regular interval wait. A cancellation that lands mid-cycle
    /// gives the in-flight cycle up to `shutdown_grace_ms` to settle, then
    /// abandons it -- the loop never blocks shutdown indefinitely.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.config.initial_delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.initial_delay_ms)) => {}
                _ = cancel.cancelled() => return,
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let burst_deadline = tokio::time::Instant::now()
                + Duration::from_millis(self.config.max_burst_duration_ms);
            let mut any_work = false;

            let mut shutting_down = false;
            for _ in 0..self.config.burst_batches {
                if cancel.is_cancelled() || tokio::time::Instant::now() >= burst_deadline {
                    break;
                }

                let cycle_fut = self.drainer.run_cycle(&self.worker);
                tokio::pin!(cycle_fut);

                let result = tokio::select! {
                    result = &mut cycle_fut => result,
                    _ = cancel.cancelled() => {
                        shutting_down = true;
                        match tokio::time::timeout(
                            Duration::from_millis(self.config.shutdown_grace_ms),
                            &mut cycle_fut,
                        ).await {
                            Ok(result) => result,
                            Err(_) => {
                                // The cycle didn't settle within the grace period --
                                // drop `cycle_fut` here, which drops its `JoinSet`
                                // and aborts whatever publishes were still in flight.
                                tracing::warn!(target: "veggieshop", "outbox_drain_cycle_abandoned_on_shutdown");
                                break;
                            }
                        }
                    }
                };

                match result {
                    Ok(outcome) => {
                        log_outcome(&outcome);
                        if outcome.claimed == 0 {
                            break;
                        }
                        any_work = true;
                    }
                    Err(err) => {
                        tracing::error!(target: "veggieshop", error = ?err, "outbox_drain_cycle_failed");
                        break;
                    }
                }

                if shutting_down {
                    break;
                }
            }

            if shutting_down {
                break;
            }

            if !any_work && self.config.idle_sleep_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.idle_sleep_ms)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
}

fn log_outcome(outcome: &DrainOutcome) {
    tracing::info!(
        target: "veggieshop",
        claimed = outcome.claimed,
        published = outcome.published,
        retried = outcome.retried,
        quarantined = outcome.quarantined,
        errored = outcome.errored,
        "outbox_drain_cycle"
    );
}
