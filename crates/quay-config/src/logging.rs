use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    #[default]
    Json,
    /// Human-readable single line output.
    Compact,
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;

const LOG_SUFFIX: &str = "-log.txt";
const SECONDS_PER_DAY: u64 = 86_400;

/// Naming and retention policy for log files written to a directory.
///
/// Files are named `{dir}/{name}-{YYYY-mm-dd-HH-MM-SS}-log.txt`. Pruning
/// only ever considers files carrying the same prefix and suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileLayout {
    directory: Utf8PathBuf,
    name: String,
    retain_days: u32,
}

impl LogFileLayout {
    /// Builds a layout for `name` inside `directory`.
    #[must_use]
    pub fn new(directory: impl Into<Utf8PathBuf>, name: impl Into<String>, retain_days: u32) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            retain_days,
        }
    }

    /// Directory holding the log files.
    #[must_use]
    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    /// Path of the log file opened at `started`.
    #[must_use]
    pub fn file_for(&self, started: OffsetDateTime) -> Utf8PathBuf {
        let stamp = format!(
            "{:04}-{:02}-{:02}-{:02}-{:02}-{:02}",
            started.year(),
            u8::from(started.month()),
            started.day(),
            started.hour(),
            started.minute(),
            started.second()
        );
        self.directory
            .join(format!("{}-{stamp}{LOG_SUFFIX}", self.name))
    }

    /// Returns true when `file_name` was produced by this layout.
    #[must_use]
    pub fn owns(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|rest| rest.ends_with(LOG_SUFFIX))
    }

    /// Modification times older than the returned instant are expired.
    ///
    /// Returns `None` when retention is disabled (`retain_days == 0`).
    #[must_use]
    pub fn expiry_cutoff(&self, now: SystemTime) -> Option<SystemTime> {
        if self.retain_days == 0 {
            return None;
        }
        let window = Duration::from_secs(u64::from(self.retain_days) * SECONDS_PER_DAY);
        now.checked_sub(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn layout() -> LogFileLayout {
        LogFileLayout::new("/var/log/quay", "quayd", 7)
    }

    #[test]
    fn file_names_embed_the_start_time() {
        let started = OffsetDateTime::from_unix_timestamp(1_709_622_489).expect("valid timestamp");
        let path = layout().file_for(started);
        assert_eq!(path.as_str(), "/var/log/quay/quayd-2024-03-05-07-08-09-log.txt");
    }

    #[rstest]
    #[case("quayd-2024-03-05-07-08-09-log.txt", true)]
    #[case("quayd-anything-log.txt", true)]
    #[case("quayd.pid", false)]
    #[case("other-2024-03-05-07-08-09-log.txt", false)]
    #[case("quaydx-2024-03-05-log.txt", false)]
    fn ownership_matches_prefix_and_suffix(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(layout().owns(name), expected);
    }

    #[test]
    fn zero_retention_disables_pruning() {
        let layout = LogFileLayout::new("/tmp", "quayd", 0);
        assert!(layout.expiry_cutoff(SystemTime::now()).is_none());
    }

    #[test]
    fn cutoff_lies_retention_window_in_the_past() {
        let now = SystemTime::now();
        let cutoff = layout().expiry_cutoff(now).expect("cutoff");
        let window = now.duration_since(cutoff).expect("cutoff precedes now");
        assert_eq!(window, Duration::from_secs(7 * SECONDS_PER_DAY));
    }
}
