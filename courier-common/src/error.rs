//! Error types for the courier-common crate.

use thiserror::Error;

/// Reasons a message is rejected before any delivery is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The message has nobody to deliver to.
    #[error("Message has no recipients")]
    NoRecipients,

    /// A recipient is missing its user reference.
    #[error("Recipient {0} has no user id")]
    MissingUser(usize),

    /// Two recipients point at the same user.
    #[error("Recipient {0} appears more than once")]
    DuplicateRecipient(String),

    /// A delay rule without a positive delay.
    #[error("Rule {0} delays without a delay")]
    MissingDelay(String),

    /// Content does not fit the channel.
    #[error("Content too long for {channel}: {length} > {max}")]
    TooLong {
        channel: &'static str,
        length: usize,
        max: usize,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
