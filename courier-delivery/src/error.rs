//! Error types for the delivery pipeline.
//!
//! Two families live here:
//! - [`SendError`]: why a single transport exchange failed. It never leaves a
//!   provider; the classifier turns it into an `AttemptError` on the attempt.
//! - [`ServiceError`]: why a service call itself could not be carried out.

use std::time::Duration;

use courier_common::error::ValidationError;
use courier_smtp::ClientError;
use thiserror::Error;
use ulid::Ulid;

use crate::{repository::RepositoryError, templates::TemplateError};

/// A failed SMTP exchange.
#[derive(Debug, Error)]
pub enum SendError {
    /// One protocol step overran its own deadline.
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },

    /// The caller's overall deadline elapsed.
    #[error("Delivery deadline of {0:?} exceeded")]
    Deadline(Duration),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl SendError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Deadline(_))
    }
}

/// Errors returned by the message and notification services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Message {0} not found")]
    MessageNotFound(Ulid),

    #[error("Notification {0} not found")]
    NotificationNotFound(Ulid),

    #[error("Notification {id} does not belong to {user_id}")]
    NotOwner { id: Ulid, user_id: String },

    #[error("Cannot schedule {id} in the past")]
    ScheduledInPast { id: Ulid },
}

impl ServiceError {
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::ScheduledInPast { .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::MessageNotFound(_) | Self::NotificationNotFound(_) => true,
            Self::Repository(err) => err.is_not_found(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self, Self::NotOwner { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        assert!(ServiceError::from(ValidationError::NoRecipients).is_validation());
        assert!(ServiceError::MessageNotFound(Ulid::new()).is_not_found());
        assert!(ServiceError::from(RepositoryError::not_found("message", "x")).is_not_found());
        assert!(
            ServiceError::NotOwner {
                id: Ulid::new(),
                user_id: "reader".to_string()
            }
            .is_forbidden()
        );
        assert!(!ServiceError::from(RepositoryError::Backend("down".to_string())).is_not_found());
    }

    #[test]
    fn step_timeouts_name_the_step() {
        let err = SendError::Timeout {
            step: "RCPT TO",
            after: Duration::from_secs(30),
        };

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "RCPT TO timed out after 30s");
    }
}
