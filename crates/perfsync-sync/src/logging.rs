use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Dispatch;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "etl.log";

/// Console plus file sinks, built as a value rather than installed globally.
pub struct LogSinks {
    pub dispatch: Dispatch,
    pub file_path: PathBuf,
}

/// `RUST_LOG` if set, otherwise `info`.
pub fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn build_log_sinks(log_dir: &Path, filter: EnvFilter) -> std::io::Result<LogSinks> {
    std::fs::create_dir_all(log_dir)?;
    let file_path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file_path)?;

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

    Ok(LogSinks {
        dispatch: Dispatch::new(subscriber),
        file_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_sink_receives_events_and_creates_directory() {
        let dir = tempdir().expect("tempdir");
        let log_dir = dir.path().join("nested").join("logs");
        let sinks = build_log_sinks(&log_dir, EnvFilter::new("info")).expect("sinks");

        tracing::dispatcher::with_default(&sinks.dispatch, || {
            tracing::info!(records = 3, "upsert committed");
            tracing::debug!("filtered out");
        });

        let text = std::fs::read_to_string(&sinks.file_path).expect("log file");
        assert!(text.contains("upsert committed"));
        assert!(text.contains("records=3"));
        assert!(!text.contains("filtered out"));
        assert!(!text.contains('\u{1b}'), "file sink must not contain ANSI escapes");
    }

    #[test]
    fn reopening_appends() {
        let dir = tempdir().expect("tempdir");
        for message in ["first pass", "second pass"] {
            let sinks = build_log_sinks(dir.path(), EnvFilter::new("info")).expect("sinks");
            tracing::dispatcher::with_default(&sinks.dispatch, || tracing::info!("{message}"));
        }
        let text = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).expect("log file");
        assert!(text.contains("first pass"));
        assert!(text.contains("second pass"));
    }
}
