//! Console plus daily-rolling file logging.

use chrono::Local;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "vodmill=info,sqlx=warn";

/// Local-timezone timestamps, easier to correlate with operator activity
/// than UTC.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Initialize console and file logging.
///
/// Filter precedence: `filter_override` (CLI flags or the config file), then
/// `RUST_LOG`, then [`DEFAULT_LOG_FILTER`]. The returned guard flushes the
/// file writer on drop; keep it alive for the life of the process.
pub fn init_logging(log_dir: &Path, filter_override: Option<&str>) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "vodmill.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = match filter_override {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|err| Error::config(format!("invalid log filter '{directive}': {err}")))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|err| Error::Other(format!("Failed to set global subscriber: {err}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_crate_and_sqlx() {
        assert!(DEFAULT_LOG_FILTER.contains("vodmill=info"));
        assert!(DEFAULT_LOG_FILTER.contains("sqlx=warn"));
    }
}
