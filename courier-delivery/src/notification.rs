//! Turning application events into deliveries.
//!
//! [`NotificationService::submit`] is the entry point: preference lookup,
//! smart filtering, user rules, persistence, and finally routing by the
//! event's configured frequency.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use courier_common::{
    internal,
    model::{
        Channel, Frequency, Message, MessageContent, NotificationItem, Recipient, RuleAction,
        UserNotificationSettings,
    },
};
use ulid::Ulid;

use crate::{
    batch::{BatchProcessor, FlushOutcome},
    error::ServiceError,
    filter::{FilterDecision, SmartFilter, Suppression},
    repository::{NotificationRepository, PreferenceRepository, settings_or_default},
    rules::RuleEngine,
    service::{MessageService, SendOutcome},
};

/// Where a submitted item ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The user does not want this event.
    Disabled,
    Filtered(Suppression),
    /// A user rule suppressed it.
    Suppressed { reason: String },
    Delivered(SendOutcome),
    Scheduled { message_id: Ulid, at: DateTime<Utc> },
    Batched(Option<FlushOutcome>),
    /// Stored for the in-app list only.
    Stored,
}

pub struct NotificationService {
    preferences: Arc<dyn PreferenceRepository>,
    notifications: Arc<dyn NotificationRepository>,
    filter: SmartFilter,
    rules: RuleEngine,
    messages: Arc<MessageService>,
    batch: Arc<BatchProcessor>,
}

impl std::fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationService")
            .field("filter", &self.filter)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl NotificationService {
    #[must_use]
    pub fn new(
        preferences: Arc<dyn PreferenceRepository>,
        notifications: Arc<dyn NotificationRepository>,
        filter: SmartFilter,
        rules: RuleEngine,
        messages: Arc<MessageService>,
        batch: Arc<BatchProcessor>,
    ) -> Self {
        Self {
            preferences,
            notifications,
            filter,
            rules,
            messages,
            batch,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the item cannot be stored, the user's rules cannot
    /// be loaded, or an immediate delivery is rejected before any attempt.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(user_id = %item.user_id, event = %item.event)
    )]
    pub async fn submit(&self, mut item: NotificationItem) -> Result<SubmitOutcome, ServiceError> {
        let settings = settings_or_default(self.preferences.as_ref(), &item.user_id).await;

        let Some(preference) = settings
            .event_preference(item.event)
            .filter(|preference| preference.enabled)
            .cloned()
        else {
            internal!(level = DEBUG, "{} has {} disabled", item.user_id, item.event);
            return Ok(SubmitOutcome::Disabled);
        };
        item.priority = preference.priority;

        let mut item = match self.filter.should_notify(&settings, &item) {
            FilterDecision::Notify(enhanced) => enhanced,
            FilterDecision::Suppress(reason) => return Ok(SubmitOutcome::Filtered(reason)),
        };

        let decision = self.rules.evaluate(&settings, &item).await?;
        if let Some(modified) = decision.item {
            item = modified;
        }

        let frequency = match decision.action {
            RuleAction::Suppress => {
                internal!(
                    level = DEBUG,
                    "Notification {} suppressed: {}",
                    item.id,
                    decision.reason
                );
                return Ok(SubmitOutcome::Suppressed {
                    reason: decision.reason,
                });
            }
            RuleAction::Batch => batch_frequency(preference.frequency, &settings),
            _ => preference.frequency,
        };

        self.notifications.create(&item).await?;

        if let (RuleAction::Delay, Some(delay)) = (decision.action, decision.delay) {
            let at = Utc::now() + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::days(1));
            let message = message_for(&item, &settings, &preference.channels)
                .with_metadata("notification_id", item.id.to_string());
            let message_id = self.messages.schedule(message, at).await?;
            return Ok(SubmitOutcome::Scheduled { message_id, at });
        }

        match frequency {
            Frequency::Never => Ok(SubmitOutcome::Stored),
            frequency if frequency.is_batched() && self.batch.config().enabled => {
                self.batch.add_to_batch(item).await.map(SubmitOutcome::Batched)
            }
            _ => self
                .deliver_now(item, &settings, &preference.channels)
                .await
                .map(SubmitOutcome::Delivered),
        }
    }

    async fn deliver_now(
        &self,
        mut item: NotificationItem,
        settings: &UserNotificationSettings,
        channels: &[Channel],
    ) -> Result<SendOutcome, ServiceError> {
        let message = message_for(&item, settings, channels)
            .with_metadata("notification_id", item.id.to_string());
        let outcome = self.messages.send(message).await?;

        if outcome.any_succeeded() {
            item.mark_delivered(None);
            if let Err(err) = self.notifications.update(&item).await {
                internal!(
                    level = WARN,
                    "Failed to mark notification {} delivered: {err}",
                    item.id
                );
            }
        }

        Ok(outcome)
    }

    /// # Errors
    ///
    /// Returns `NotificationNotFound` for an unknown id and `NotOwner` when the
    /// item belongs to someone else.
    pub async fn mark_read(&self, id: Ulid, user_id: &str) -> Result<NotificationItem, ServiceError> {
        let mut item = self.notifications.get(id).await.map_err(|err| {
            if err.is_not_found() {
                ServiceError::NotificationNotFound(id)
            } else {
                err.into()
            }
        })?;

        if item.user_id != user_id {
            return Err(ServiceError::NotOwner {
                id,
                user_id: user_id.to_string(),
            });
        }

        if item.read_at.is_none() {
            item.read_at = Some(Utc::now());
            self.notifications.update(&item).await?;
        }

        Ok(item)
    }

    /// A page of the user's notifications, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the notifications cannot be listed.
    pub async fn user_notifications(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NotificationItem>, ServiceError> {
        Ok(self
            .notifications
            .list_for_user(user_id, limit, offset)
            .await?)
    }
}

/// The frequency a batch rule forces: the event's own when it already
/// batches, then the user's digest frequency, then daily.
fn batch_frequency(event: Frequency, settings: &UserNotificationSettings) -> Frequency {
    [event, settings.batch_frequency]
        .into_iter()
        .find(|frequency| frequency.is_batched())
        .unwrap_or(Frequency::Daily)
}

/// A single-recipient message carrying `item`.
fn message_for(
    item: &NotificationItem,
    settings: &UserNotificationSettings,
    channels: &[Channel],
) -> Message {
    let text = if item.description.trim().is_empty() {
        item.title.clone()
    } else {
        item.description.clone()
    };

    let mut content = MessageContent::new(item.title.clone(), text)
        .with_variable("title", item.title.as_str())
        .with_variable("description", item.description.as_str());
    if let Some(url) = &item.action_url {
        content = content.with_action_url(url.clone());
    }
    if let Some(actor) = &item.actor_name {
        content = content.with_variable("actor_name", actor.as_str());
    }
    content
        .variables
        .extend(item.extra.iter().map(|(key, value)| (key.clone(), value.clone())));

    let mut recipient = Recipient::new(settings.clone());
    if !channels.is_empty() {
        recipient = recipient.with_channels(channels.to_vec());
    }

    Message::new(item.event.message_type(), content, vec![recipient])
}
