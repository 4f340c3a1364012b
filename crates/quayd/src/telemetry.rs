//! Structured telemetry initialisation for the daemon.
//!
//! Events go to stderr unless a log directory is configured, in which case
//! each start opens a new timestamped file in that directory. Files older
//! than the retention window are pruned at start-up.

use std::fs::{self, File, OpenOptions};
use std::io::{self, IsTerminal};
use std::sync::Mutex;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use once_cell::sync::OnceCell;
use quay_config::{Config, LogFileLayout, LogFormat};
use time::OffsetDateTime;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

const TELEMETRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::telemetry");

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// The log file could not be opened.
    #[error("failed to open log file '{path}': {source}")]
    LogFile {
        /// File being opened.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Configures the global tracing subscriber when invoked for the first time.
///
/// Later calls return a fresh [`TelemetryHandle`] without touching the
/// installed subscriber, so tests can bootstrap repeatedly.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;
    let (writer, ansi) = match config.log_layout() {
        Some(layout) => (BoxMakeWriter::new(Mutex::new(open_log_file(&layout)?)), false),
        None => (BoxMakeWriter::new(io::stderr), io::stderr().is_terminal()),
    };

    let builder = |filter: EnvFilter, writer: BoxMakeWriter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .with_writer(writer)
            .with_ansi(ansi)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(builder(filter, writer).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter, writer).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

fn open_log_file(layout: &LogFileLayout) -> Result<File, TelemetryError> {
    let path = layout.file_for(OffsetDateTime::now_utc());
    fs::create_dir_all(layout.directory())
        .and_then(|()| OpenOptions::new().create(true).append(true).open(&path))
        .map_err(|source| TelemetryError::LogFile { path, source })
}

/// Removes log files owned by `layout` whose modification time falls
/// outside the retention window. Returns the number removed.
///
/// Unreadable entries are skipped; pruning never blocks start-up.
pub fn prune_logs(layout: &LogFileLayout) -> usize {
    prune_logs_at(layout, SystemTime::now())
}

fn prune_logs_at(layout: &LogFileLayout, now: SystemTime) -> usize {
    let Some(cutoff) = layout.expiry_cutoff(now) else {
        return 0;
    };
    let entries = match fs::read_dir(layout.directory()) {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    target: TELEMETRY_TARGET,
                    directory = %layout.directory(),
                    error = %error,
                    "log directory unreadable; skipping pruning"
                );
            }
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let owned = entry
            .file_name()
            .to_str()
            .is_some_and(|name| layout.owns(name));
        if !owned {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .is_ok_and(|modified| modified < cutoff);
        if !expired {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(error) => tracing::warn!(
                target: TELEMETRY_TARGET,
                file = %entry.path().display(),
                error = %error,
                "failed to remove expired log file"
            ),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(86_400);

    fn touch(layout_dir: &std::path::Path, name: &str, modified: SystemTime) {
        let path = layout_dir.join(name);
        let file = File::create(&path).expect("create log file");
        file.set_modified(modified).expect("backdate");
    }

    #[test]
    fn pruning_removes_only_expired_owned_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        let layout = LogFileLayout::new(root, "quayd", 7);
        let now = SystemTime::now();

        touch(dir.path(), "quayd-2020-01-01-00-00-00-log.txt", now - DAY * 10);
        touch(dir.path(), "quayd-2020-01-09-00-00-00-log.txt", now - DAY * 2);
        touch(dir.path(), "other-2020-01-01-00-00-00-log.txt", now - DAY * 10);
        touch(dir.path(), "quayd.pid", now - DAY * 10);

        assert_eq!(prune_logs_at(&layout, now), 1);
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "other-2020-01-01-00-00-00-log.txt",
                "quayd-2020-01-09-00-00-00-log.txt",
                "quayd.pid",
            ]
        );
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        let layout = LogFileLayout::new(root, "quayd", 0);
        touch(
            dir.path(),
            "quayd-2000-01-01-00-00-00-log.txt",
            SystemTime::UNIX_EPOCH + DAY,
        );
        assert_eq!(prune_logs(&layout), 0);
    }

    #[test]
    fn missing_directory_prunes_nothing() {
        let layout = LogFileLayout::new("/nonexistent/quay-logs", "quayd", 7);
        assert_eq!(prune_logs(&layout), 0);
    }
}
