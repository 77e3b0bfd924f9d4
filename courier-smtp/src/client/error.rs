//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur when talking to an SMTP relay.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server replied with a code the current step does not accept.
    #[error("Unexpected SMTP status code: {code} - {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// The server returned an error status code (4xx or 5xx).
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The server does not offer an authentication mechanism we support.
    #[error("No supported AUTH mechanism offered (server offers: {0})")]
    AuthUnsupported(String),

    /// A message could not be rendered.
    #[error("Invalid message: {0}")]
    BuilderError(String),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// The reply code carried by the error, if the server sent one.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedResponse { code, .. } | Self::SmtpError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The server's reply text, if any.
    #[must_use]
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::UnexpectedResponse { message, .. } | Self::SmtpError { message, .. } => {
                Some(message)
            }
            _ => None,
        }
    }

    /// Failures of the transport itself rather than a server verdict.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::TlsError(_)
        )
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
