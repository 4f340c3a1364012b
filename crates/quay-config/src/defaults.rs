//! Built-in defaults shared by the daemon and its tests.

use crate::logging::LogFormat;

/// Host the listener binds when none is configured: the IPv6 any-address.
pub const DEFAULT_BIND_HOST: &str = "::";

/// Default TCP port for the listener.
pub const DEFAULT_PORT: u16 = 8080;

/// Default accept backlog.
pub const DEFAULT_LISTEN_BACKLOG: u32 = 1024;

/// Default number of resident workers spawned at start-up.
pub const DEFAULT_RESIDENT_WORKERS: usize = 1;

/// Handler resolved when the configuration names none.
pub const DEFAULT_HANDLER: &str = "echo";

/// Seconds the daemon waits for a worker channel to accept a handoff.
pub const DEFAULT_HANDOFF_TIMEOUT_SECS: u64 = 10;

/// Session read/write/connect timeout, in seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 20;

/// Default log filter expression used by the daemon.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Prefix of log files written to a configured log directory.
pub const DEFAULT_LOG_NAME: &str = "quayd";

/// Days a log file is retained before start-up pruning removes it.
pub const DEFAULT_LOG_RETAIN_DAYS: u32 = 7;

/// Default bind host as an owned value for serde defaults.
pub fn default_bind_host() -> String {
    DEFAULT_BIND_HOST.to_owned()
}

/// Default listener port.
pub fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Default accept backlog.
pub fn default_listen_backlog() -> u32 {
    DEFAULT_LISTEN_BACKLOG
}

/// Default resident worker count.
pub fn default_resident_workers() -> usize {
    DEFAULT_RESIDENT_WORKERS
}

/// Default handler name as an owned value.
pub fn default_handler() -> String {
    DEFAULT_HANDLER.to_owned()
}

/// Default handoff timeout in seconds.
pub fn default_handoff_timeout() -> u64 {
    DEFAULT_HANDOFF_TIMEOUT_SECS
}

/// Default session timeout in seconds.
pub fn default_session_timeout() -> i64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

/// Default log filter expression used by the daemon.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the daemon.
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default log file prefix as an owned value.
pub fn default_log_name() -> String {
    DEFAULT_LOG_NAME.to_owned()
}

/// Default log retention window in days.
pub fn default_log_retain_days() -> u32 {
    DEFAULT_LOG_RETAIN_DAYS
}
