//! SMTP engine errors.

use thiserror::Error;

/// Parse and transport failures inside a session.
///
/// The syntax variants are reported to the client on the open connection;
/// only `Io` tears a session down.
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("invalid command syntax")]
    InvalidSyntax,
    #[error("failed to decode credentials")]
    CredentialDecode,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
