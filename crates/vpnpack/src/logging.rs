//! Tracing setup: stderr in text or JSON, plus an optional daily-rolling
//! file under `logging.directory`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use vpnpack_config::{LogFormat, LoggingConfig};

const FILE_BASE_NAME: &str = "vpnpack.log";

/// Keeps the file writer flushing until dropped.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Filter precedence: `RUST_LOG`, then `-v` count, then the configured level.
fn directives(verbosity: u8, configured: &str) -> String {
    if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        if !env.trim().is_empty() {
            return env;
        }
    }
    match verbosity {
        0 => configured.to_owned(),
        1 => "debug".into(),
        _ => "trace".into(),
    }
}

fn filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Call once, before any work is done.
pub fn init(logging: &LoggingConfig, verbosity: u8) -> LogGuard {
    let directives = directives(verbosity, &logging.level);
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    layers.push(match logging.format {
        LogFormat::Text => stderr.with_filter(filter(&directives)).boxed(),
        LogFormat::Json => stderr.json().with_filter(filter(&directives)).boxed(),
    });

    let guard = logging.directory.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, FILE_BASE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        layers.push(match logging.format {
            LogFormat::Text => file.with_filter(filter(&directives)).boxed(),
            LogFormat::Json => file.json().with_filter(filter(&directives)).boxed(),
        });
        guard
    });

    if let Err(e) = tracing_subscriber::registry().with(layers).try_init() {
        eprintln!("tracing already initialized: {e}");
    }
    LogGuard { _file: guard }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_overrides_configured_level() {
        if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
            return;
        }
        assert_eq!(directives(0, "warn"), "warn");
        assert_eq!(directives(1, "warn"), "debug");
        assert_eq!(directives(3, "warn"), "trace");
    }
}
