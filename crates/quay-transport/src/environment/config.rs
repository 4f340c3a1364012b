use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Which side of the TLS handshake an environment plays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvironmentRole {
    /// Accepts inbound connections; a certificate and key are mandatory.
    #[default]
    Acceptor,
    /// Initiates outbound connections; validates peers by default.
    Initiator,
}

impl EnvironmentRole {
    /// Lower-case name used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acceptor => "acceptor",
            Self::Initiator => "initiator",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "acceptor" | "server" => Some(Self::Acceptor),
            "initiator" | "client" => Some(Self::Initiator),
            _ => None,
        }
    }
}

/// Secure-transport parameters consumed by
/// [`Environment::open`](super::Environment::open).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureConfig {
    role: EnvironmentRole,
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
    trust_file: Option<PathBuf>,
    trust_dir: Option<PathBuf>,
    validate_peer: Option<bool>,
    verify_depth: Option<u8>,
}

impl SecureConfig {
    /// Parameters for an accepting environment.
    #[must_use]
    pub fn acceptor() -> Self {
        Self::default()
    }

    /// Parameters for an initiating environment.
    #[must_use]
    pub fn initiator() -> Self {
        Self {
            role: EnvironmentRole::Initiator,
            ..Self::default()
        }
    }

    /// Builds parameters from key/value pairs.
    ///
    /// Recognised keys are `role`, `certificate`, `private_key`,
    /// `trust_file`, `trust_dir`, `validate_peer` and `verify_depth`.
    pub fn from_params<I, K, V>(params: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (raw_key, raw_value) in params {
            let (key, value) = (raw_key.as_ref(), raw_value.as_ref().trim());
            let invalid = || ConfigError::InvalidValue {
                key: key.to_owned(),
                value: value.to_owned(),
            };
            match key {
                "role" => config.role = EnvironmentRole::parse(value).ok_or_else(invalid)?,
                "certificate" => config.certificate = Some(PathBuf::from(value)),
                "private_key" => config.private_key = Some(PathBuf::from(value)),
                "trust_file" => config.trust_file = Some(PathBuf::from(value)),
                "trust_dir" => config.trust_dir = Some(PathBuf::from(value)),
                "validate_peer" => {
                    config.validate_peer = Some(parse_flag(value).ok_or_else(invalid)?);
                }
                "verify_depth" => {
                    config.verify_depth = Some(value.parse::<u8>().map_err(|_| invalid())?);
                }
                other => {
                    return Err(ConfigError::UnknownParameter {
                        key: other.to_owned(),
                    });
                }
            }
        }
        Ok(config)
    }

    /// Sets the PEM certificate chain.
    #[must_use]
    pub fn with_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate = Some(path.into());
        self
    }

    /// Sets the PEM private key.
    #[must_use]
    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Adds a PEM bundle of trust anchors.
    #[must_use]
    pub fn with_trust_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_file = Some(path.into());
        self
    }

    /// Adds a directory of PEM trust anchors.
    #[must_use]
    pub fn with_trust_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_dir = Some(path.into());
        self
    }

    /// Enables or disables peer validation.
    #[must_use]
    pub fn with_validate_peer(mut self, validate: bool) -> Self {
        self.validate_peer = Some(validate);
        self
    }

    /// Bounds the accepted peer chain length, end-entity included.
    #[must_use]
    pub fn with_verify_depth(mut self, depth: u8) -> Self {
        self.verify_depth = Some(depth);
        self
    }

    /// Handshake role.
    #[must_use]
    pub const fn role(&self) -> EnvironmentRole {
        self.role
    }

    /// Certificate chain path.
    #[must_use]
    pub fn certificate(&self) -> Option<&Path> {
        self.certificate.as_deref()
    }

    /// Private key path.
    #[must_use]
    pub fn private_key(&self) -> Option<&Path> {
        self.private_key.as_deref()
    }

    /// Trust bundle path.
    #[must_use]
    pub fn trust_file(&self) -> Option<&Path> {
        self.trust_file.as_deref()
    }

    /// Trust directory path.
    #[must_use]
    pub fn trust_dir(&self) -> Option<&Path> {
        self.trust_dir.as_deref()
    }

    /// Whether peers are validated: off by default for acceptors, on for
    /// initiators.
    #[must_use]
    pub fn validates_peer(&self) -> bool {
        self.validate_peer
            .unwrap_or(matches!(self.role, EnvironmentRole::Initiator))
    }

    /// Chain length bound, when configured.
    #[must_use]
    pub const fn verify_depth(&self) -> Option<u8> {
        self.verify_depth
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}
