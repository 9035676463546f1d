// Structured logging setup. No event in this crate (or anywhere
// downstream that respects the observability contract in §4.4) ever
// carries a raw tenant secret or event payload -- call sites pass hashed
// or already-validated identifiers only.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LogSettings};

/// Installs the global `tracing` subscriber. Call once, at process start.
/// `RUST_LOG` (if set) takes precedence over `settings.level`.
pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));
    let builder = fmt::Subscriber::builder().with_env_filter(filter);

    match settings.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_to_pretty() {
        let settings = LogSettings::default();
        assert_eq!(settings.format, LogFormat::Pretty);
    }
}
