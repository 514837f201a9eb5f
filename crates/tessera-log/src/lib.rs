//! Structured logging for tessera.
//!
//! Installs a `tracing` subscriber with console output (uptime, target,
//! level) and, in debug builds, a JSON file layer for post-mortem analysis.
//! `RUST_LOG` wins over the configured log level.

use std::fs::File;
use std::path::Path;

use tessera_config::Config;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "tessera.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file (debug builds only)
/// * `debug_build` - enables file logging
/// * `config` - source of the `debug.log_level` filter
///
/// ```no_run
/// use tessera_config::Config;
/// use tessera_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // reader threads are named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && let Some(log_file) = open_log_file(log_dir)
    {
        subscriber.with(json_file_layer(log_file)).init();
        return;
    }

    subscriber.init();
}

/// The filter directive `config` asks for, or [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    config
        .map(|c| c.debug.log_level.trim())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

/// An `EnvFilter` with [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

/// Creates `log_dir` and truncates [`LOG_FILE_NAME`] inside it.
pub fn open_log_file(log_dir: &Path) -> Option<File> {
    std::fs::create_dir_all(log_dir).ok()?;
    File::create(log_dir.join(LOG_FILE_NAME)).ok()
}

/// JSON-lines layer writing to `file`.
pub fn json_file_layer<S>(file: File) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        assert_eq!(filter_directive(None), "info");
        assert!(format!("{}", default_env_filter()).contains("info"));
    }

    #[test]
    fn test_config_log_level_is_used() {
        let mut config = Config::default();
        config.debug.log_level = "warn,tessera_world=debug".to_string();
        assert_eq!(filter_directive(Some(&config)), "warn,tessera_world=debug");
    }

    #[test]
    fn test_blank_config_level_falls_back() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        for filter_str in ["info", "debug,tessera_world=trace", "warn,tessera_lighting=debug"] {
            assert!(EnvFilter::try_from(filter_str).is_ok(), "failed to parse {filter_str}");
        }
    }

    #[test]
    fn test_json_file_layer_writes_structured_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_log_file(&dir.path().join("logs")).unwrap();
        let subscriber = tracing_subscriber::registry().with(json_file_layer(file));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(chunk = 3, "chunk saved");
        });

        let contents = std::fs::read_to_string(dir.path().join("logs").join(LOG_FILE_NAME)).unwrap();
        let line = contents.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["fields"]["message"], "chunk saved");
        assert_eq!(value["fields"]["chunk"], 3);
    }
}
