//! Test harness utilities shared by the daemon behavioural suites.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use quay_config::{Config, LimitAdjustment, PoolLimits};
use tempfile::TempDir;

use crate::bootstrap::{BootstrapError, ConfigLoader};
use crate::health::HealthReporter;

/// Loader that places runtime artefacts under a temporary directory and
/// binds an ephemeral loopback port.
#[derive(Clone)]
pub struct TestConfigLoader {
    runtime_dir: Arc<Mutex<TempDir>>,
    overrides: fn(&mut Config),
}

impl TestConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::with_overrides(|_| {})
    }

    /// Applies `overrides` to every configuration this loader returns.
    #[must_use]
    pub fn with_overrides(overrides: fn(&mut Config)) -> Self {
        let dir = TempDir::new().expect("failed to create temporary runtime directory");
        Self {
            runtime_dir: Arc::new(Mutex::new(dir)),
            overrides,
        }
    }

    /// Directory receiving lock, pid and health files.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .lock()
            .expect("temporary directory mutex poisoned")
            .path()
            .to_path_buf()
    }

    fn runtime_dir_utf8(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.runtime_dir())
            .expect("temporary runtime path was not valid UTF-8")
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        let mut config = Config {
            bind_host: "127.0.0.1".to_owned(),
            port: 0,
            resident_workers: 1,
            max_workers: Some(4),
            handoff_timeout: 2,
            read_timeout: 5,
            write_timeout: 5,
            log_filter: "info".to_owned(),
            runtime_dir: Some(self.runtime_dir_utf8()),
            ..Config::default()
        };
        (self.overrides)(&mut config);
        Ok(config)
    }
}

/// Loader that intentionally fails by passing an unparsable port.
pub struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        let args = vec![
            OsString::from("quayd"),
            OsString::from("--port"),
            OsString::from("not-a-port"),
        ];
        Config::load_from_iter(args)
    }
}

/// Records health events for assertions.
#[derive(Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// Address reported once dispatch began, if it has.
    pub fn ready_addr(&self) -> Option<SocketAddr> {
        self.events().into_iter().find_map(|event| match event {
            HealthEvent::DispatchReady(addr) => Some(addr),
            _ => None,
        })
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn limits_adjusted(&self, adjustment: LimitAdjustment, _limits: &PoolLimits) {
        self.record(HealthEvent::LimitsAdjusted(adjustment));
    }

    fn logs_pruned(&self, _directory: &Utf8Path, removed: usize) {
        self.record(HealthEvent::LogsPruned(removed));
    }

    fn dispatch_ready(&self, addr: SocketAddr, _limits: &PoolLimits) {
        self.record(HealthEvent::DispatchReady(addr));
    }
}

/// Structured health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Bootstrap started.
    BootstrapStarting,
    /// Bootstrap completed successfully.
    BootstrapSucceeded,
    /// Bootstrap failed with an error description.
    BootstrapFailed(String),
    /// Configured pool bounds were corrected.
    LimitsAdjusted(LimitAdjustment),
    /// Expired log files were removed.
    LogsPruned(usize),
    /// The listener is accepting connections.
    DispatchReady(SocketAddr),
}
