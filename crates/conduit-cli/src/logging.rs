use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "conduit=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Logs to a daily file under `<data dir>/logs`, and to stderr as well when
/// `verbose` is set. Keep the returned guard alive until exit so buffered
/// lines get flushed.
pub fn setup_logging(verbose: bool) -> Result<WorkerGuard> {
    let log_dir = conduit::config::data_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "conduit.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("failed to install the log subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_default_filter_applies_without_rust_log() {
        temp_env::with_var_unset("RUST_LOG", || {
            assert_eq!(env_filter().to_string(), DEFAULT_DIRECTIVE);
        });
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_default() {
        temp_env::with_var("RUST_LOG", Some("conduit=debug"), || {
            assert_eq!(env_filter().to_string(), "conduit=debug");
        });
    }
}
