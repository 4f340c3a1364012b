use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which side of the TLS handshake the daemon's environment plays.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TlsRole {
    /// Accepts inbound connections; needs a certificate and private key.
    #[strum(serialize = "acceptor", serialize = "server")]
    Acceptor,
    /// Initiates outbound connections; validates peers by default.
    #[strum(serialize = "initiator", serialize = "client")]
    Initiator,
}

/// Errors encountered while parsing a [`TlsRole`] from text.
pub type TlsRoleParseError = strum::ParseError;
