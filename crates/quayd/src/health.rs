//! Structured health reporting for daemon lifecycle events.

use std::net::SocketAddr;
use std::sync::Arc;

use camino::Utf8Path;
use quay_config::{Config, LimitAdjustment, PoolLimits};

use crate::bootstrap::BootstrapError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked for each correction applied to the configured pool bounds.
    fn limits_adjusted(&self, adjustment: LimitAdjustment, limits: &PoolLimits);

    /// Invoked after expired log files were removed.
    fn logs_pruned(&self, directory: &Utf8Path, removed: usize);

    /// Invoked once the listener is bound and the resident workers run.
    fn dispatch_ready(&self, addr: SocketAddr, limits: &PoolLimits);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn limits_adjusted(&self, adjustment: LimitAdjustment, limits: &PoolLimits) {
        (**self).limits_adjusted(adjustment, limits);
    }

    fn logs_pruned(&self, directory: &Utf8Path, removed: usize) {
        (**self).logs_pruned(directory, removed);
    }

    fn dispatch_ready(&self, addr: SocketAddr, limits: &PoolLimits) {
        (**self).dispatch_ready(addr, limits);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting daemon bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        let limits = config.pool_limits();
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            bind_host = %config.bind_host,
            port = config.port,
            handler = %config.handler,
            resident = limits.resident(),
            max = limits.max(),
            secure = config.is_secure(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            "daemon bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "daemon bootstrap failed"
        );
    }

    fn limits_adjusted(&self, adjustment: LimitAdjustment, limits: &PoolLimits) {
        match adjustment {
            LimitAdjustment::ResidentRaised => tracing::warn!(
                target: HEALTH_TARGET,
                event = "limits_adjusted",
                resident = limits.resident(),
                "resident_workers of 0 raised to 1"
            ),
            LimitAdjustment::MaxRaised { configured } => tracing::warn!(
                target: HEALTH_TARGET,
                event = "limits_adjusted",
                configured,
                max = limits.max(),
                "max_workers below resident_workers; raised to match"
            ),
        }
    }

    fn logs_pruned(&self, directory: &Utf8Path, removed: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "logs_pruned",
            directory = %directory,
            removed,
            "expired log files removed"
        );
    }

    fn dispatch_ready(&self, addr: SocketAddr, limits: &PoolLimits) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "dispatch_ready",
            addr = %addr,
            resident = limits.resident(),
            max = limits.max(),
            "accepting connections"
        );
    }
}
