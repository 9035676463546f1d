// Three layers, lowest to highest precedence: compiled-in defaults (the
// `Default` impls below), an optional TOML file, then `VEGGIESHOP_`-prefixed
// environment variables. Nested fields use `__` as the env separator
// (`VEGGIESHOP_OUTBOX__BATCH_SIZE`), since `.` isn't a legal env var
// character.

use serde::Deserialize;

const ENV_PREFIX: &str = "VEGGIESHOP";
const ENV_SEPARATOR: &str = "__";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Postgres,
    EmbeddedRedb,
}

impl Default for StorageKind {
    fn default() -> Self {
        StorageKind::EmbeddedRedb
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub kind: StorageKind,
    /// Only consulted when `kind = postgres`.
    pub database_url: String,
    /// Only consulted when `kind = embedded_redb`.
    pub redb_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            database_url: "postgres://localhost/veggieshop".to_string(),
            redb_path: "veggieshop.redb".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsistencySettings {
    pub token_ttl_ms: i64,
    pub clock_skew_ms: i64,
    pub ryw_max_wait_ms: i64,
    pub ryw_initial_poll_ms: i64,
    pub ryw_max_poll_ms: i64,
}

impl Default for ConsistencySettings {
    fn default() -> Self {
        Self {
            token_ttl_ms: 30_000,
            clock_skew_ms: 2_000,
            ryw_max_wait_ms: 500,
            ryw_initial_poll_ms: 5,
            ryw_max_poll_ms: 50,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub burst_batches: u32,
    pub max_burst_duration_ms: u64,
    pub idle_sleep_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            interval_ms: 1_000,
            burst_batches: 4,
            max_burst_duration_ms: 5_000,
            idle_sleep_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub batch_size: usize,
    pub parallelism: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub scheduler: SchedulerSettings,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            parallelism: 8,
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            scheduler: SchedulerSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    pub ttl_ms: i64,
    pub min_accepted_version: u64,
    pub replay_window_ms: i64,
    pub max_future_skew_ms: i64,
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 7 * 24 * 60 * 60 * 1_000,
            min_accepted_version: 0,
            replay_window_ms: 7 * 24 * 60 * 60 * 1_000,
            max_future_skew_ms: 5 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherKind {
    Logging,
    HttpWebhook,
}

impl Default for PublisherKind {
    fn default() -> Self {
        PublisherKind::Logging
    }
}

/// Selects the `veggieshop_adapt::Publisher` the outbox drainer publishes
/// through. `Logging` is the zero-config default for local development;
/// `HttpWebhook` delivers to `webhook_base_url` (`POST {base}/{topic}`).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub kind: PublisherKind,
    pub webhook_base_url: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            kind: PublisherKind::default(),
            webhook_base_url: "http://localhost:9000".to_string(),
        }
    }
}

/// The signer itself is always injected (never constructed from config
/// alone per §4.1's non-goal on key management) -- this only carries the
/// one HMAC key an `HmacSigner` needs to boot in a single-key deployment.
/// Multi-key rotation wires up a `HmacSigner` directly in code instead.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub active_key_id: String,
    pub active_key_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            active_key_id: "k1".to_string(),
            active_key_secret: "change-me-in-every-real-deployment".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub consistency: ConsistencySettings,
    pub outbox: OutboxSettings,
    pub dedupe: DedupeSettings,
    pub storage: StorageSettings,
    pub log: LogSettings,
    pub auth: AuthSettings,
    pub publisher: PublisherSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            consistency: ConsistencySettings::default(),
            outbox: OutboxSettings::default(),
            dedupe: DedupeSettings::default(),
            storage: StorageSettings::default(),
            log: LogSettings::default(),
            auth: AuthSettings::default(),
            publisher: PublisherSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads compiled-in defaults, then an optional TOML file at `path`
    /// (silently skipped if it doesn't exist), then `VEGGIESHOP_*`
    /// environment variables, in that order of increasing precedence.
    pub fn load(path: Option<&str>) -> veggieshop_base::Result<AppConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_with_no_file_or_env() {
        let cfg = AppConfig::load(Some("/nonexistent/path/does-not-exist")).unwrap();
        assert_eq!(cfg.consistency.token_ttl_ms, 30_000);
        assert_eq!(cfg.outbox.batch_size, 100);
        assert!(matches!(cfg.storage.kind, StorageKind::EmbeddedRedb));
        assert!(matches!(cfg.publisher.kind, PublisherKind::Logging));
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("VEGGIESHOP_OUTBOX__BATCH_SIZE", "250");
        let cfg = AppConfig::load(None).unwrap();
        std::env::remove_var("VEGGIESHOP_OUTBOX__BATCH_SIZE");
        assert_eq!(cfg.outbox.batch_size, 250);
    }
}
