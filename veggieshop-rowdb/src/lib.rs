//! Embedded storage: `redb`-backed implementations of the watermark,
//! dedupe, and outbox store traits for single-node and development
//! deployments, as an alternative to the Postgres-backed stores.
//!
//! `redb` transactions are synchronous, so every table access in this
//! crate runs through `tokio::task::spawn_blocking`. `TenantId` does not
//! implement `Serialize`/`Deserialize` by design (it is validated once at
//! construction); every wire row here stores the tenant as a plain
//! `String` and reconstructs it with [`TenantId::parse`] on load, which
//! re-validates it.

mod dedupe;
mod outbox;
mod watermark;

use std::sync::Arc;

use redb::Database;
use veggieshop_base::Result;

pub use dedupe::RedbDedupeStore;
pub use outbox::RedbOutboxStore;
pub use watermark::RedbWatermarkStore;

/// Opens (or creates) a single `redb` database file and hands back the
/// shared handle each store wraps. One file backs all three stores --
/// they live in distinct tables within it.
pub fn open(path: impl AsRef<std::path::Path>) -> Result<Arc<Database>> {
    Ok(Arc::new(Database::create(path)?))
}
