//! Self-signed certificate fixtures for secure-session tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DnType, KeyPair};
use tempfile::TempDir;

use crate::environment::SecureConfig;

/// A self-signed `localhost` certificate and key written to a temporary
/// directory that lives as long as this value.
#[derive(Debug)]
pub struct TestCertificates {
    directory: TempDir,
    certificate: PathBuf,
    private_key: PathBuf,
}

impl TestCertificates {
    /// Generates a fresh certificate valid for `localhost` and `127.0.0.1`.
    pub fn generate() -> io::Result<Self> {
        let mut params = CertificateParams::new(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])
            .map_err(io::Error::other)?;
        params
            .distinguished_name
            .push(DnType::CommonName, "quay test endpoint");
        let key = KeyPair::generate().map_err(io::Error::other)?;
        let certificate = params.self_signed(&key).map_err(io::Error::other)?;

        let directory = tempfile::tempdir()?;
        let certificate_path = directory.path().join("endpoint.pem");
        let key_path = directory.path().join("endpoint.key");
        fs::write(&certificate_path, certificate.pem())?;
        fs::write(&key_path, key.serialize_pem())?;
        Ok(Self {
            directory,
            certificate: certificate_path,
            private_key: key_path,
        })
    }

    /// Directory holding the certificate (usable as a trust directory).
    #[must_use]
    pub fn directory(&self) -> &Path {
        self.directory.path()
    }

    /// PEM certificate path.
    #[must_use]
    pub fn certificate_path(&self) -> &Path {
        &self.certificate
    }

    /// PEM private key path.
    #[must_use]
    pub fn private_key_path(&self) -> &Path {
        &self.private_key
    }

    /// Acceptor parameters presenting this certificate.
    #[must_use]
    pub fn acceptor_config(&self) -> SecureConfig {
        SecureConfig::acceptor()
            .with_certificate(&self.certificate)
            .with_private_key(&self.private_key)
    }

    /// Initiator parameters trusting this certificate.
    #[must_use]
    pub fn initiator_config(&self) -> SecureConfig {
        SecureConfig::initiator().with_trust_file(&self.certificate)
    }
}
