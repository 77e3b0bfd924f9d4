//! Storage interfaces consumed by the delivery pipeline.
//!
//! The engine never owns persistence; it talks to these traits. The
//! [`memory`] module provides the in-process implementations used by the
//! binary and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{
    internal,
    model::{
        DeliveryAttempt, Message, MessageStatus, NotificationDigest, NotificationItem,
        NotificationRule, UserNotificationSettings,
    },
};
use thiserror::Error;
use ulid::Ulid;

pub use memory::{
    MemoryAttemptRepository, MemoryDigestRepository, MemoryMessageRepository,
    MemoryNotificationRepository, MemoryPreferenceRepository, MemoryRuleSource,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if a message with the same id is already stored.
    async fn create(&self, message: &Message) -> Result<()>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn get(&self, id: Ulid) -> Result<Message>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn update_status(&self, id: Ulid, status: MessageStatus) -> Result<()>;

    /// Pending messages whose scheduled time is at or before `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Message>>;

    /// Moves a pending message to `processing`.
    ///
    /// Returns `false` when the message was not pending, so that only one
    /// dispatcher ever owns a message.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn claim(&self, id: Ulid) -> Result<bool>;
}

#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if an attempt with the same id is already stored.
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// Stores the attempt, replacing any previous version with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn update(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// Every attempt for a message, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn list_for_message(&self, message_id: Ulid) -> Result<Vec<DeliveryAttempt>>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn get(&self, id: Ulid) -> Result<DeliveryAttempt>;
}

#[async_trait]
pub trait DigestRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if a digest with the same id is already stored.
    async fn create(&self, digest: &NotificationDigest) -> Result<()>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn update(&self, digest: &NotificationDigest) -> Result<()>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn get(&self, id: Ulid) -> Result<NotificationDigest>;

    /// Digests still waiting to be sent, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn list_pending(&self, limit: usize) -> Result<Vec<NotificationDigest>>;
}

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    /// `None` when the user never saved any settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn get(&self, user_id: &str) -> Result<Option<UserNotificationSettings>>;

    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn save(&self, settings: &UserNotificationSettings) -> Result<()>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if an item with the same id is already stored.
    async fn create(&self, item: &NotificationItem) -> Result<()>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn get(&self, id: Ulid) -> Result<NotificationItem>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn update(&self, item: &NotificationItem) -> Result<()>;

    /// A user's notifications, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NotificationItem>>;
}

/// The user's saved settings, or the defaults when there are none or they
/// cannot be loaded.
pub async fn settings_or_default(
    preferences: &dyn PreferenceRepository,
    user_id: &str,
) -> UserNotificationSettings {
    match preferences.get(user_id).await {
        Ok(Some(settings)) => settings,
        Ok(None) => UserNotificationSettings::defaults_for(user_id),
        Err(err) => {
            internal!(
                level = WARN,
                "Failed to load settings for {user_id}, using defaults: {err}"
            );
            UserNotificationSettings::defaults_for(user_id)
        }
    }
}

/// Where the rule engine reads a user's rules from.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Active rules only, in any order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn active_rules(&self, user_id: &str) -> Result<Vec<NotificationRule>>;
}
