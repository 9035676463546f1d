//! Transactional outbox: claim-and-publish with backoff, ordering, and
//! quarantine (C5). A row's journey is claim -> publish -> terminal; the
//! scheduler drives a `Drainer` on a fixed-delay loop, and `housekeeping`
//! exposes the retention sweeps for an external cron caller.

mod drainer;
mod housekeeping;
mod model;
mod scheduler;
mod store;

pub use drainer::{DrainOutcome, Drainer, DrainerConfig};
pub use housekeeping::{sweep_expired_dedupe_rows, sweep_published_rows, DEFAULT_SWEEP_LIMIT};
pub use model::{NewOutboxRow, OutboxRow, Status};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{InMemoryOutboxStore, OutboxStore, PgOutboxStore};
