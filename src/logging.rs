//! Tracing setup for the command-line tool.
//!
//! `RUST_LOG` takes precedence over the configured level. When
//! `application.log_file` is set, log lines are appended to that file without
//! ANSI colouring; otherwise they go to stderr so stdout stays clean for
//! command output.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{PumpError, PumpResult};

/// Filter built from `RUST_LOG`, falling back to `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Plain-text subscriber appending to `path`.
fn file_subscriber(
    path: &Path,
    filter: EnvFilter,
) -> PumpResult<impl tracing::Subscriber + Send + Sync + 'static> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .finish())
}

/// Install the global subscriber.
///
/// # Errors
/// [`PumpError::Io`] if the log file cannot be opened, [`PumpError::Logging`]
/// if a subscriber is already installed.
pub fn init(config: &ApplicationConfig) -> PumpResult<()> {
    let filter = env_filter(&config.log_level);

    let installed = match &config.log_file {
        Some(path) => file_subscriber(path, filter)?.try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish()
            .try_init(),
    };

    installed.map_err(|e| PumpError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_appends_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pump.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let subscriber = file_subscriber(&path, EnvFilter::new("info")).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(volume_ul = 250.0, "appended line");
            tracing::debug!("filtered out");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("earlier run\n"));
        assert!(contents.contains("appended line"));
        assert!(contents.contains("volume_ul=250"));
        assert!(!contents.contains("filtered out"));
        assert!(!contents.contains('\u{1b}'));
    }

    #[test]
    fn test_missing_log_directory_is_an_io_error() {
        let config = ApplicationConfig {
            log_file: Some("/nonexistent/dir/pump.log".into()),
            ..ApplicationConfig::default()
        };
        assert!(matches!(init(&config), Err(PumpError::Io(_))));
    }
}
