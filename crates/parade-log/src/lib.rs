//! Logging setup for parade peers.
//!
//! Console output with an uptime timer, filtered by `RUST_LOG` or the
//! configured log level. Debug builds also write JSON lines to `parade.log`.

use std::path::{Path, PathBuf};

use parade_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE_NAME: &str = "parade.log";

/// Filter string from `config`, or [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => config.debug.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// `RUST_LOG` if set, otherwise [`filter_directive`].
pub fn env_filter(config: Option<&Config>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config)))
}

/// Create the JSON log file inside `log_dir`. `None` if that fails.
fn open_log_file(log_dir: &Path) -> Option<(std::fs::File, PathBuf)> {
    std::fs::create_dir_all(log_dir).ok()?;
    let path = log_dir.join(LOG_FILE_NAME);
    let file = std::fs::File::create(&path).ok()?;
    Some((file, path))
}

/// Install the global subscriber. Call once, early in `main`.
///
/// `log_dir` is only used when `debug_build` is set.
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console_layer);

    if debug_build && let Some((log_file, path)) = log_dir.and_then(open_log_file) {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();
        subscriber.with(file_layer).init();
        tracing::debug!("Writing JSON log to {}", path.display());
        return;
    }

    subscriber.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_without_config() {
        assert_eq!(filter_directive(None), "info");
    }

    #[test]
    fn test_config_level_is_used() {
        let mut config = Config::default();
        config.debug.log_level = "info,parade_net=trace".into();
        assert_eq!(filter_directive(Some(&config)), "info,parade_net=trace");
    }

    #[test]
    fn test_blank_config_level_falls_back() {
        let mut config = Config::default();
        config.debug.log_level = "  ".into();
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
    }

    #[test]
    fn test_subsystem_filters_parse() {
        for directive in ["info", "debug,parade_session=trace", "warn,parade_net=debug"] {
            assert!(EnvFilter::try_new(directive).is_ok(), "{directive}");
        }
    }

    #[test]
    fn test_log_file_created_in_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs").join("today");
        let (_file, path) = open_log_file(&nested).unwrap();
        assert_eq!(path.file_name().unwrap(), LOG_FILE_NAME);
        assert!(path.exists());
    }
}
