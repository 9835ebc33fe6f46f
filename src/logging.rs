use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: `RUST_LOG` filter (default `info`), stderr,
/// and a daily rolling file in `log_dir` when given.
///
/// The returned guard flushes the file writer on drop; keep it alive in `main`.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "scr-ldx.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            registry
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            tracing::info!(dir = %dir.display(), "logging to file");
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}
