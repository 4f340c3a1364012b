//! Layered configuration for the quay dispatch daemon.
//!
//! Values resolve from built-in defaults, then an optional configuration
//! file (`--config-path` or `QUAY_CONFIG_PATH`), then `QUAY_*` environment
//! variables, then command-line flags. The daemon reads the result once at
//! start-up; nothing here is reloaded at runtime.

mod defaults;
mod limits;
mod logging;
mod runtime;
mod tls;

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_BIND_HOST, DEFAULT_HANDLER, DEFAULT_HANDOFF_TIMEOUT_SECS, DEFAULT_LISTEN_BACKLOG,
    DEFAULT_LOG_FILTER, DEFAULT_LOG_NAME, DEFAULT_LOG_RETAIN_DAYS, DEFAULT_PORT,
    DEFAULT_RESIDENT_WORKERS, DEFAULT_SESSION_TIMEOUT_SECS, default_bind_host, default_handler,
    default_handoff_timeout, default_listen_backlog, default_log_filter,
    default_log_filter_string, default_log_format, default_log_name, default_log_retain_days,
    default_port, default_resident_workers, default_session_timeout,
};
pub use limits::{LimitAdjustment, PoolLimits};
pub use logging::{LogFileLayout, LogFormat, LogFormatParseError};
pub use runtime::{RuntimePaths, RuntimePathsError};
pub use tls::{TlsRole, TlsRoleParseError};

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "QUAY")]
pub struct Config {
    /// Host or address the listener binds.
    #[ortho_config(default = default_bind_host())]
    pub bind_host: String,
    /// Listener port; zero asks the kernel for an ephemeral port.
    #[ortho_config(default = default_port())]
    pub port: u16,
    /// Accept backlog passed to `listen`.
    #[ortho_config(default = default_listen_backlog())]
    pub listen_backlog: u32,
    /// Workers spawned at start-up and kept for the daemon's lifetime.
    #[ortho_config(default = default_resident_workers())]
    pub resident_workers: usize,
    /// Ceiling on concurrently live workers, transient ones included.
    pub max_workers: Option<usize>,
    /// Name of the connection handler resolved at start-up.
    #[ortho_config(default = default_handler())]
    pub handler: String,
    /// Optional configuration file passed through to the handler.
    pub handler_config: Option<Utf8PathBuf>,
    /// Seconds to wait for a worker channel to accept a handoff.
    #[ortho_config(default = default_handoff_timeout())]
    pub handoff_timeout: u64,
    /// Session read timeout in seconds; negative waits indefinitely.
    #[ortho_config(default = default_session_timeout())]
    pub read_timeout: i64,
    /// Session write timeout in seconds; negative waits indefinitely.
    #[ortho_config(default = default_session_timeout())]
    pub write_timeout: i64,
    /// Outbound connect timeout in seconds; negative waits indefinitely.
    #[ortho_config(default = default_session_timeout())]
    pub connect_timeout: i64,
    /// TLS role; plaintext when absent.
    pub tls_role: Option<TlsRole>,
    /// PEM certificate chain presented to peers.
    pub tls_certificate: Option<Utf8PathBuf>,
    /// PEM private key matching `tls_certificate`.
    pub tls_private_key: Option<Utf8PathBuf>,
    /// PEM bundle of trusted certificates.
    pub tls_trust_file: Option<Utf8PathBuf>,
    /// Directory of PEM trusted certificates.
    pub tls_trust_dir: Option<Utf8PathBuf>,
    /// Whether peers must present a valid certificate.
    pub tls_validate_peer: Option<bool>,
    /// Longest accepted peer chain, end-entity included.
    pub tls_verify_depth: Option<u8>,
    /// Tracing filter expression.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Tracing output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Directory receiving log files; stderr when absent.
    pub log_dir: Option<Utf8PathBuf>,
    /// Prefix of log files written to `log_dir`.
    #[ortho_config(default = default_log_name())]
    pub log_name: String,
    /// Days a log file is kept before start-up pruning; zero keeps all.
    #[ortho_config(default = default_log_retain_days())]
    pub log_retain_days: u32,
    /// Directory for lock, pid and health files.
    pub runtime_dir: Option<Utf8PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            listen_backlog: default_listen_backlog(),
            resident_workers: default_resident_workers(),
            max_workers: None,
            handler: default_handler(),
            handler_config: None,
            handoff_timeout: default_handoff_timeout(),
            read_timeout: default_session_timeout(),
            write_timeout: default_session_timeout(),
            connect_timeout: default_session_timeout(),
            tls_role: None,
            tls_certificate: None,
            tls_private_key: None,
            tls_trust_file: None,
            tls_trust_dir: None,
            tls_validate_peer: None,
            tls_verify_depth: None,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            log_dir: None,
            log_name: default_log_name(),
            log_retain_days: default_log_retain_days(),
            runtime_dir: None,
        }
    }
}

impl Config {
    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Tracing output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// File layout for logs, when a log directory is configured.
    #[must_use]
    pub fn log_layout(&self) -> Option<LogFileLayout> {
        self.log_dir
            .as_ref()
            .map(|dir| LogFileLayout::new(dir.clone(), self.log_name.clone(), self.log_retain_days))
    }

    /// Normalised worker pool bounds.
    #[must_use]
    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits::normalise(self.resident_workers, self.max_workers)
    }

    /// Bound on a single descriptor handoff.
    #[must_use]
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout)
    }

    /// Whether connections are served over TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.tls_role.is_some()
    }
}
