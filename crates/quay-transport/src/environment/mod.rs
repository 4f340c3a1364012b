//! Transport environments: the secure-transport context shared by sessions.
//!
//! An environment is built once, then only read. Sessions either borrow a
//! shared environment through an [`Arc`] or open a private one that lives
//! and dies with the session.

mod config;
mod verify;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, info};

pub use config::{EnvironmentRole, SecureConfig};

use crate::error::{ConfigError, TransportError};
use verify::{DepthLimitedClientVerifier, DepthLimitedServerVerifier, UnvalidatedServer};

const ENVIRONMENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::environment");
const TRUST_EXTENSIONS: [&str; 3] = ["pem", "crt", "cer"];

/// TLS context bound to one handshake role.
#[derive(Debug, Clone)]
pub(crate) enum TlsContext {
    Acceptor(Arc<ServerConfig>),
    Initiator(Arc<ClientConfig>),
}

/// Secure-transport configuration referenced by sessions.
#[derive(Debug)]
pub struct Environment {
    tls: Option<TlsContext>,
}

impl Environment {
    /// Opens an environment; without configuration it is plaintext.
    pub fn open(config: Option<&SecureConfig>) -> Result<Self, TransportError> {
        let Some(config) = config else {
            return Ok(Self::plaintext());
        };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = match config.role() {
            EnvironmentRole::Acceptor => {
                TlsContext::Acceptor(Arc::new(acceptor(config, provider)?))
            }
            EnvironmentRole::Initiator => {
                TlsContext::Initiator(Arc::new(initiator(config, provider)?))
            }
        };
        info!(
            target: ENVIRONMENT_TARGET,
            role = config.role().as_str(),
            validate_peer = config.validates_peer(),
            "secure environment opened"
        );
        Ok(Self { tls: Some(tls) })
    }

    /// A non-secure environment.
    #[must_use]
    pub const fn plaintext() -> Self {
        Self { tls: None }
    }

    /// Whether sessions over this environment use TLS.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Handshake role, when secure.
    #[must_use]
    pub const fn role(&self) -> Option<EnvironmentRole> {
        match &self.tls {
            None => None,
            Some(TlsContext::Acceptor(_)) => Some(EnvironmentRole::Acceptor),
            Some(TlsContext::Initiator(_)) => Some(EnvironmentRole::Initiator),
        }
    }

    /// Releases a shared environment.
    ///
    /// Fails with `InvalidState` while other references remain; the
    /// caller's reference is released either way, so nothing is freed twice.
    pub fn close(environment: Arc<Self>) -> Result<(), TransportError> {
        match Arc::try_unwrap(environment) {
            Ok(owned) => {
                debug!(
                    target: ENVIRONMENT_TARGET,
                    secure = owned.is_secure(),
                    "environment closed"
                );
                Ok(())
            }
            Err(_still_shared) => Err(TransportError::InvalidState(
                "environment is still referenced by other holders",
            )),
        }
    }

    pub(crate) const fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }
}

fn acceptor(
    config: &SecureConfig,
    provider: Arc<CryptoProvider>,
) -> Result<ServerConfig, ConfigError> {
    let certificate_path = config.certificate().ok_or(ConfigError::MissingCertificate)?;
    let key_path = config.private_key().ok_or(ConfigError::MissingPrivateKey)?;
    let chain = load_certificates(certificate_path)?;
    let key = load_private_key(key_path)?;

    let versions = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(ConfigError::Context)?;
    let builder = if config.validates_peer() {
        let roots = configured_roots(config)?;
        if roots.is_empty() {
            return Err(ConfigError::MissingTrustStore);
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(ConfigError::Verifier)?;
        versions.with_client_cert_verifier(limit_client_depth(verifier, config.verify_depth()))
    } else {
        versions.with_no_client_auth()
    };
    builder
        .with_single_cert(chain, key)
        .map_err(ConfigError::Context)
}

fn initiator(
    config: &SecureConfig,
    provider: Arc<CryptoProvider>,
) -> Result<ClientConfig, ConfigError> {
    let algorithms = provider.signature_verification_algorithms;
    let versions = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(ConfigError::Context)?;
    let verifier: Arc<dyn ServerCertVerifier> = if config.validates_peer() {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        roots.roots.extend(configured_roots(config)?.roots);
        let webpki: Arc<dyn ServerCertVerifier> =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(ConfigError::Verifier)?;
        match config.verify_depth() {
            Some(depth) => Arc::new(DepthLimitedServerVerifier::new(webpki, depth)),
            None => webpki,
        }
    } else {
        Arc::new(UnvalidatedServer::new(algorithms))
    };
    let builder = versions
        .dangerous()
        .with_custom_certificate_verifier(verifier);
    match (config.certificate(), config.private_key()) {
        (Some(certificate), Some(key)) => builder
            .with_client_auth_cert(load_certificates(certificate)?, load_private_key(key)?)
            .map_err(ConfigError::Context),
        (None, None) => Ok(builder.with_no_client_auth()),
        (Some(_), None) => Err(ConfigError::MissingPrivateKey),
        (None, Some(_)) => Err(ConfigError::MissingCertificate),
    }
}

fn limit_client_depth(
    verifier: Arc<dyn ClientCertVerifier>,
    depth: Option<u8>,
) -> Arc<dyn ClientCertVerifier> {
    match depth {
        Some(depth) => Arc::new(DepthLimitedClientVerifier::new(verifier, depth)),
        None => verifier,
    }
}

fn configured_roots(config: &SecureConfig) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    if let Some(file) = config.trust_file() {
        add_trust_file(&mut roots, file)?;
    }
    if let Some(dir) = config.trust_dir() {
        // Directory members without certificates (keys, CRLs) are skipped.
        for file in trust_dir_entries(dir)? {
            match add_trust_file(&mut roots, &file) {
                Err(ConfigError::NoCertificates { .. }) => {}
                other => other?,
            }
        }
    }
    Ok(roots)
}

fn trust_dir_entries(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let read_error = |source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        let trusted_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| TRUST_EXTENSIONS.contains(&ext));
        if trusted_extension && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn add_trust_file(roots: &mut RootCertStore, path: &Path) -> Result<(), ConfigError> {
    for certificate in load_certificates(path)? {
        roots
            .add(certificate)
            .map_err(|source| ConfigError::TrustAnchor {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem = read(path)?;
    let certificates = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Pem {
            path: path.to_path_buf(),
            source,
        })?;
    if certificates.is_empty() {
        return Err(ConfigError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let pem = read(path)?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|source| ConfigError::Pem {
        path: path.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestCertificates;

    fn config_error(result: Result<Environment, TransportError>) -> ConfigError {
        match result {
            Err(TransportError::Config(error)) => error,
            Err(other) => panic!("expected a configuration error, got {other}"),
            Ok(_) => panic!("expected a configuration error, got an environment"),
        }
    }

    #[test]
    fn absent_configuration_is_plaintext() {
        let environment = Environment::open(None).expect("plaintext environment");
        assert!(!environment.is_secure());
        assert_eq!(environment.role(), None);
    }

    #[test]
    fn acceptor_requires_a_certificate() {
        let error = config_error(Environment::open(Some(&SecureConfig::acceptor())));
        assert!(matches!(error, ConfigError::MissingCertificate));
    }

    #[test]
    fn acceptor_requires_a_private_key() {
        let certs = TestCertificates::generate().expect("test certificates");
        let config = SecureConfig::acceptor().with_certificate(certs.certificate_path());
        let error = config_error(Environment::open(Some(&config)));
        assert!(matches!(error, ConfigError::MissingPrivateKey));
    }

    #[test]
    fn unreadable_certificate_is_a_configuration_error() {
        let config = SecureConfig::acceptor()
            .with_certificate("/nonexistent/quay/cert.pem")
            .with_private_key("/nonexistent/quay/key.pem");
        let error = config_error(Environment::open(Some(&config)));
        assert!(matches!(error, ConfigError::Read { .. }));
    }

    #[test]
    fn validating_acceptor_needs_trust_anchors() {
        let certs = TestCertificates::generate().expect("test certificates");
        let config = certs.acceptor_config().with_validate_peer(true);
        let error = config_error(Environment::open(Some(&config)));
        assert!(matches!(error, ConfigError::MissingTrustStore));
    }

    #[test]
    fn acceptor_opens_with_certificate_and_key() {
        let certs = TestCertificates::generate().expect("test certificates");
        let environment =
            Environment::open(Some(&certs.acceptor_config())).expect("acceptor environment");
        assert!(environment.is_secure());
        assert_eq!(environment.role(), Some(EnvironmentRole::Acceptor));
    }

    #[test]
    fn initiator_validates_with_default_roots() {
        let environment =
            Environment::open(Some(&SecureConfig::initiator())).expect("initiator environment");
        assert_eq!(environment.role(), Some(EnvironmentRole::Initiator));
    }

    #[test]
    fn trust_directory_is_loaded() {
        let certs = TestCertificates::generate().expect("test certificates");
        let config = SecureConfig::initiator().with_trust_dir(certs.directory());
        assert!(Environment::open(Some(&config)).is_ok());
    }

    #[test]
    fn shared_environment_refuses_to_close_while_referenced() {
        let shared = Arc::new(Environment::plaintext());
        let session_copy = Arc::clone(&shared);
        let error = Environment::close(shared).expect_err("still referenced");
        assert!(matches!(error, TransportError::InvalidState(_)));
        Environment::close(session_copy).expect("last reference closes");
    }
}
