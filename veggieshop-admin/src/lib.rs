//! Config loading and logging setup: the ambient stack every deployment
//! of this toolkit needs regardless of which storage backend or transport
//! it's wired up with (C0-adjacent, ambient).

mod config;
mod logging;

pub use config::{
    AppConfig, AuthSettings, ConsistencySettings, DedupeSettings, LogFormat, LogSettings,
    OutboxSettings, PublisherKind, PublisherSettings, SchedulerSettings, StorageKind,
    StorageSettings,
};
pub use logging::init as init_logging;
