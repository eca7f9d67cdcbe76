//! Logging bootstrap built on `tracing-subscriber`

use crate::config::DebugConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this more than once
/// is harmless; later calls are ignored.
pub fn init(config: &DebugConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    let result = if config.log_to_file {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
        {
            Ok(file) => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init(),
            Err(e) => {
                eprintln!(
                    "Unable to open log file {}: {}",
                    config.log_path.display(),
                    e
                );
                tracing_subscriber::fmt().with_env_filter(filter).try_init()
            }
        }
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if result.is_ok() {
        tracing::debug!("Logging initialized at level {:?}", config.log_level);
    }
}

/// Install a test-friendly subscriber that writes through the test harness
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_opens_configured_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DebugConfig {
            log_level: LogLevel::Debug,
            log_to_file: true,
            log_path: dir.path().join("xenon.log"),
        };
        init(&config);
        init(&config);
        assert!(config.log_path.exists());
    }
}
