//! Supervises daemon launch sequencing and runtime orchestration.

use std::env;
use std::sync::Arc;

use quay_config::{Config, RuntimePaths, TlsRole};
use quay_transport::{
    ConfigError, Environment, SecureConfig, SessionConfig, SessionTimeouts, TransportError,
};
use tracing::{info, warn};

use crate::bootstrap::{ConfigLoader, StaticConfigLoader, SystemConfigLoader, bootstrap_with};
use crate::dispatch::Dispatcher;
use crate::handler::HandlerRegistry;
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::listener::Listener;
use crate::pool::WorkerPool;
use crate::waker::Waker;
use crate::worker::{ThreadSpawner, WorkerContext};

use super::daemonizer::{Daemonizer, SystemDaemonizer};
use super::errors::LaunchError;
use super::guard::{HealthState, ProcessGuard};
use super::shutdown::{ShutdownSignal, SystemShutdownSignal};
use super::{FOREGROUND_ENV_VAR, PROCESS_TARGET, SHUTDOWN_TIMEOUT};

/// Launch mode for the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fork into the background and detach from the controlling terminal.
    Background,
    /// Remain attached to the terminal; used for debugging and tests.
    Foreground,
}

impl LaunchMode {
    fn detect() -> Self {
        if env::var_os(FOREGROUND_ENV_VAR).is_some() {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}

/// Process-level collaborators needed to control daemon lifecycle.
pub(crate) struct ProcessControl<D, S> {
    pub(crate) mode: LaunchMode,
    pub(crate) daemonizer: D,
    pub(crate) shutdown: S,
}

/// Service dependencies required to construct the daemon runtime.
pub(crate) struct ServiceDeps<L> {
    pub(crate) loader: L,
    pub(crate) reporter: Arc<dyn HealthReporter>,
    pub(crate) registry: HandlerRegistry,
}

/// Collaborators required to launch the daemon runtime.
pub(crate) struct LaunchPlan<L, D, S> {
    pub(crate) process: ProcessControl<D, S>,
    pub(crate) services: ServiceDeps<L>,
}

/// Runs the daemon using the production collaborators.
pub fn run_daemon() -> Result<(), LaunchError> {
    let plan = LaunchPlan {
        process: ProcessControl {
            mode: LaunchMode::detect(),
            daemonizer: SystemDaemonizer::new(),
            shutdown: SystemShutdownSignal::new(SHUTDOWN_TIMEOUT),
        },
        services: ServiceDeps {
            loader: SystemConfigLoader,
            reporter: Arc::new(StructuredHealthReporter::new()),
            registry: HandlerRegistry::with_builtins(),
        },
    };
    run_daemon_with(plan)
}

/// Runs the daemon with injected collaborators.
pub(crate) fn run_daemon_with<L, D, S>(plan: LaunchPlan<L, D, S>) -> Result<(), LaunchError>
where
    L: ConfigLoader,
    D: Daemonizer,
    S: ShutdownSignal,
{
    let LaunchPlan { process, services } = plan;
    let ProcessControl {
        mode,
        daemonizer,
        shutdown,
    } = process;
    let ServiceDeps {
        loader,
        reporter,
        registry,
    } = services;

    info!(
        target: PROCESS_TARGET,
        ?mode,
        "starting daemon runtime"
    );
    let loaded = loader.load()?;
    let mut guard = ProcessGuard::acquire(RuntimePaths::from_config(&loaded)?)?;
    if matches!(mode, LaunchMode::Background) {
        daemonizer.daemonize(guard.paths())?;
    }
    guard.write_pid(std::process::id())?;
    guard.write_health(HealthState::Starting)?;

    let daemon = bootstrap_with(&StaticConfigLoader::new(loaded), Arc::clone(&reporter))?;
    let config = daemon.config();
    let handler = registry.resolve(&config.handler, config.handler_config.as_deref())?;
    let environment = Arc::new(open_environment(config)?);
    let limits = config.pool_limits();

    let listener = Listener::bind(&config.bind_host, config.port, config.listen_backlog)?;
    let waker = Waker::new().map_err(|source| LaunchError::Waker { source })?;
    let spawner = ThreadSpawner::new(WorkerContext::new(
        handler,
        Arc::clone(&environment),
        session_config(config),
    ));
    let mut pool = WorkerPool::new(
        spawner,
        limits.clone(),
        config.handoff_timeout(),
        waker.handle(),
    );
    let dispatcher = match pool.start() {
        Ok(()) => Dispatcher::new(listener, pool, waker).with_shutdown_timeout(SHUTDOWN_TIMEOUT),
        Err(error) => {
            // Residents that did start must not outlive the failed launch.
            pool.terminate_all(SHUTDOWN_TIMEOUT);
            return Err(error.into());
        }
    };
    let dispatch = dispatcher.spawn()?;
    reporter.dispatch_ready(dispatch.local_addr(), &limits);
    guard.write_health(HealthState::Ready)?;

    let loop_exit = dispatch.loop_exit();
    let waited = shutdown.wait(&loop_exit);
    if loop_exit.has_ended() {
        warn!(
            target: PROCESS_TARGET,
            "dispatch loop ended before shutdown was requested"
        );
    }
    guard.write_health(HealthState::Stopping)?;
    dispatch.shutdown();
    let stopped = dispatch.join();
    release_environment(environment);
    waited?;
    stopped?;
    info!(
        target: PROCESS_TARGET,
        "shutdown sequence completed"
    );
    Ok(())
}

/// Builds the shared environment for inbound sessions.
fn open_environment(config: &Config) -> Result<Environment, LaunchError> {
    let environment_error = |source| LaunchError::Environment { source };
    if config.tls_role == Some(TlsRole::Initiator) {
        // The daemon only accepts connections.
        return Err(environment_error(TransportError::Config(
            ConfigError::RoleMismatch {
                role: "initiator",
                direction: "accept",
            },
        )));
    }
    match secure_config(config) {
        None => Ok(Environment::plaintext()),
        Some(secure) => Environment::open(Some(&secure)).map_err(environment_error),
    }
}

/// Maps the `tls_*` settings onto secure transport parameters.
pub(crate) fn secure_config(config: &Config) -> Option<SecureConfig> {
    let mut secure = match config.tls_role? {
        TlsRole::Acceptor => SecureConfig::acceptor(),
        TlsRole::Initiator => SecureConfig::initiator(),
    };
    if let Some(path) = &config.tls_certificate {
        secure = secure.with_certificate(path.as_std_path());
    }
    if let Some(path) = &config.tls_private_key {
        secure = secure.with_private_key(path.as_std_path());
    }
    if let Some(path) = &config.tls_trust_file {
        secure = secure.with_trust_file(path.as_std_path());
    }
    if let Some(path) = &config.tls_trust_dir {
        secure = secure.with_trust_dir(path.as_std_path());
    }
    if let Some(validate) = config.tls_validate_peer {
        secure = secure.with_validate_peer(validate);
    }
    if let Some(depth) = config.tls_verify_depth {
        secure = secure.with_verify_depth(depth);
    }
    Some(secure)
}

/// Session defaults handed to every worker.
pub(crate) fn session_config(config: &Config) -> SessionConfig {
    SessionConfig {
        timeouts: SessionTimeouts::from_seconds(
            config.read_timeout,
            config.write_timeout,
            config.connect_timeout,
        ),
        secure: None,
    }
}

fn release_environment(environment: Arc<Environment>) {
    if let Err(error) = Environment::close(environment) {
        // Detached stragglers still hold a reference.
        warn!(
            target: PROCESS_TARGET,
            error = %error,
            "transport environment still shared at exit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use std::time::Duration;

    #[test]
    fn plaintext_when_no_role_is_configured() {
        let config = Config::default();
        assert!(secure_config(&config).is_none());
        let environment = open_environment(&config).expect("plaintext environment");
        assert!(!environment.is_secure());
    }

    #[test]
    fn acceptor_settings_are_forwarded() {
        let config = Config {
            tls_role: Some(TlsRole::Acceptor),
            tls_certificate: Some(Utf8PathBuf::from("/etc/quay/cert.pem")),
            tls_private_key: Some(Utf8PathBuf::from("/etc/quay/key.pem")),
            tls_validate_peer: Some(true),
            tls_trust_file: Some(Utf8PathBuf::from("/etc/quay/ca.pem")),
            tls_verify_depth: Some(3),
            ..Config::default()
        };
        let secure = secure_config(&config).expect("secure parameters");
        assert_eq!(
            secure.certificate().map(|path| path.to_string_lossy().into_owned()),
            Some("/etc/quay/cert.pem".to_owned())
        );
        assert_eq!(
            secure.private_key().map(|path| path.to_string_lossy().into_owned()),
            Some("/etc/quay/key.pem".to_owned())
        );
        assert!(secure.validates_peer());
        assert_eq!(secure.verify_depth(), Some(3));
    }

    #[test]
    fn acceptor_without_certificate_is_fatal() {
        let config = Config {
            tls_role: Some(TlsRole::Acceptor),
            ..Config::default()
        };
        assert!(matches!(
            open_environment(&config),
            Err(LaunchError::Environment {
                source: TransportError::Config(ConfigError::MissingCertificate)
            })
        ));
    }

    #[test]
    fn initiator_role_cannot_serve() {
        let config = Config {
            tls_role: Some(TlsRole::Initiator),
            ..Config::default()
        };
        assert!(matches!(
            open_environment(&config),
            Err(LaunchError::Environment {
                source: TransportError::Config(ConfigError::RoleMismatch { .. })
            })
        ));
    }

    #[rstest]
    #[case(20, Some(Duration::from_secs(20)))]
    #[case(0, Some(Duration::ZERO))]
    #[case(-1, None)]
    fn session_timeouts_follow_configuration(
        #[case] seconds: i64,
        #[case] expected: Option<Duration>,
    ) {
        let config = Config {
            read_timeout: seconds,
            write_timeout: seconds,
            connect_timeout: seconds,
            ..Config::default()
        };
        let session = session_config(&config);
        assert_eq!(session.timeouts.read, expected);
        assert_eq!(session.timeouts.write, expected);
        assert_eq!(session.timeouts.connect, expected);
        assert!(session.secure.is_none());
    }
}
