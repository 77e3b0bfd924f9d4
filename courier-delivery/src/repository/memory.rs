//! In-process repositories backed by `DashMap`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{
    error::ValidationError,
    model::{
        DeliveryAttempt, DigestStatus, Message, MessageStatus, NotificationDigest,
        NotificationItem, NotificationRule, UserNotificationSettings,
    },
};
use dashmap::{DashMap, mapref::entry::Entry};
use ulid::Ulid;

use super::{
    AttemptRepository, DigestRepository, MessageRepository, NotificationRepository,
    PreferenceRepository, RepositoryError, Result, RuleSource,
};

fn insert_new<T: Clone>(
    map: &DashMap<Ulid, T>,
    entity: &'static str,
    id: Ulid,
    value: &T,
) -> Result<()> {
    match map.entry(id) {
        Entry::Occupied(_) => Err(RepositoryError::Conflict {
            entity,
            id: id.to_string(),
        }),
        Entry::Vacant(slot) => {
            slot.insert(value.clone());
            Ok(())
        }
    }
}

fn replace<T: Clone>(map: &DashMap<Ulid, T>, entity: &'static str, id: Ulid, value: &T) -> Result<()> {
    let mut current = map
        .get_mut(&id)
        .ok_or_else(|| RepositoryError::not_found(entity, id))?;
    *current = value.clone();
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryMessageRepository {
    messages: DashMap<Ulid, Message>,
}

impl MemoryMessageRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, message: &Message) -> Result<()> {
        insert_new(&self.messages, "message", message.id, message)
    }

    async fn get(&self, id: Ulid) -> Result<Message> {
        self.messages
            .get(&id)
            .map(|message| message.clone())
            .ok_or_else(|| RepositoryError::not_found("message", id))
    }

    async fn update_status(&self, id: Ulid, status: MessageStatus) -> Result<()> {
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::not_found("message", id))?;
        message.status = status;
        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Message>> {
        let mut due: Vec<Message> = self
            .messages
            .iter()
            .filter(|message| {
                message.status == MessageStatus::Pending
                    && message.scheduled_at.is_some_and(|at| at <= now)
            })
            .map(|message| message.clone())
            .collect();

        due.sort_by_key(|message| (message.scheduled_at, message.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: Ulid) -> Result<bool> {
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::not_found("message", id))?;

        if message.status == MessageStatus::Pending {
            message.status = MessageStatus::Processing;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryAttemptRepository {
    attempts: DashMap<Ulid, DeliveryAttempt>,
}

impl MemoryAttemptRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[async_trait]
impl AttemptRepository for MemoryAttemptRepository {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<()> {
        insert_new(&self.attempts, "attempt", attempt.id, attempt)
    }

    async fn update(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn list_for_message(&self, message_id: Ulid) -> Result<Vec<DeliveryAttempt>> {
        let mut attempts: Vec<DeliveryAttempt> = self
            .attempts
            .iter()
            .filter(|attempt| attempt.message_id == message_id)
            .map(|attempt| attempt.clone())
            .collect();

        attempts.sort_by_key(|attempt| attempt.id);
        Ok(attempts)
    }

    async fn get(&self, id: Ulid) -> Result<DeliveryAttempt> {
        self.attempts
            .get(&id)
            .map(|attempt| attempt.clone())
            .ok_or_else(|| RepositoryError::not_found("attempt", id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryDigestRepository {
    digests: DashMap<Ulid, NotificationDigest>,
}

impl MemoryDigestRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DigestRepository for MemoryDigestRepository {
    async fn create(&self, digest: &NotificationDigest) -> Result<()> {
        insert_new(&self.digests, "digest", digest.id, digest)
    }

    async fn update(&self, digest: &NotificationDigest) -> Result<()> {
        replace(&self.digests, "digest", digest.id, digest)
    }

    async fn get(&self, id: Ulid) -> Result<NotificationDigest> {
        self.digests
            .get(&id)
            .map(|digest| digest.clone())
            .ok_or_else(|| RepositoryError::not_found("digest", id))
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<NotificationDigest>> {
        let mut pending: Vec<NotificationDigest> = self
            .digests
            .iter()
            .filter(|digest| digest.status == DigestStatus::Pending)
            .map(|digest| digest.clone())
            .collect();

        pending.sort_by_key(|digest| digest.id);
        pending.truncate(limit);
        Ok(pending)
    }
}

#[derive(Debug, Default)]
pub struct MemoryPreferenceRepository {
    settings: DashMap<String, UserNotificationSettings>,
}

impl MemoryPreferenceRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceRepository for MemoryPreferenceRepository {
    async fn get(&self, user_id: &str) -> Result<Option<UserNotificationSettings>> {
        Ok(self.settings.get(user_id).map(|settings| settings.clone()))
    }

    async fn save(&self, settings: &UserNotificationSettings) -> Result<()> {
        self.settings
            .insert(settings.user_id.clone(), settings.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryNotificationRepository {
    items: DashMap<Ulid, NotificationItem>,
}

impl MemoryNotificationRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(&self, item: &NotificationItem) -> Result<()> {
        insert_new(&self.items, "notification", item.id, item)
    }

    async fn get(&self, id: Ulid) -> Result<NotificationItem> {
        self.items
            .get(&id)
            .map(|item| item.clone())
            .ok_or_else(|| RepositoryError::not_found("notification", id))
    }

    async fn update(&self, item: &NotificationItem) -> Result<()> {
        replace(&self.items, "notification", item.id, item)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NotificationItem>> {
        let mut items: Vec<NotificationItem> = self
            .items
            .iter()
            .filter(|item| item.user_id == user_id)
            .map(|item| item.clone())
            .collect();

        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }
}

/// Rules keyed by owner.
#[derive(Debug, Default)]
pub struct MemoryRuleSource {
    rules: DashMap<String, Vec<NotificationRule>>,
}

impl MemoryRuleSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns an error if the rule is incomplete, e.g. a delay rule without
    /// a delay.
    pub fn add(&self, rule: NotificationRule) -> std::result::Result<(), ValidationError> {
        rule.validate()?;
        self.rules.entry(rule.user_id.clone()).or_default().push(rule);
        Ok(())
    }
}

#[async_trait]
impl RuleSource for MemoryRuleSource {
    async fn active_rules(&self, user_id: &str) -> Result<Vec<NotificationRule>> {
        Ok(self
            .rules
            .get(user_id)
            .map(|rules| rules.iter().filter(|rule| rule.active).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeDelta;
    use courier_common::model::{MessageContent, MessageType};

    use super::*;

    fn message() -> Message {
        Message::new(
            MessageType::SystemAlert,
            MessageContent::new("Subject", "Body"),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let repo = MemoryMessageRepository::new();
        let message = message();

        repo.create(&message).await.unwrap();
        let err = repo.create(&message).await.unwrap_err();

        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let repo = MemoryMessageRepository::new();
        let message = message();
        repo.create(&message).await.unwrap();

        assert!(repo.claim(message.id).await.unwrap());
        assert!(!repo.claim(message.id).await.unwrap());
        assert!(repo.claim(Ulid::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn only_due_pending_messages_are_listed() {
        let repo = MemoryMessageRepository::new();
        let now = Utc::now();

        let mut due = message();
        due.scheduled_at = Some(now - TimeDelta::minutes(1));
        let mut later = message();
        later.scheduled_at = Some(now + TimeDelta::minutes(10));
        let immediate = message();

        for message in [&due, &later, &immediate] {
            repo.create(message).await.unwrap();
        }

        let listed = repo.list_due(now, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);
    }

    #[tokio::test]
    async fn attempt_updates_are_idempotent() {
        let repo = MemoryAttemptRepository::new();
        let message_id = Ulid::new();
        let mut attempt =
            DeliveryAttempt::pending(message_id, "reader", courier_common::model::Channel::Email);

        repo.create(&attempt).await.unwrap();
        attempt.complete(courier_common::model::DeliveryStatus::Sent, None);
        repo.update(&attempt).await.unwrap();
        repo.update(&attempt).await.unwrap();

        let stored = repo.list_for_message(message_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, courier_common::model::DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn notifications_page_newest_first() {
        let repo = MemoryNotificationRepository::new();
        let event = courier_common::model::EventType::KudosReceived;

        for n in 0..5 {
            let mut item = NotificationItem::new("reader", event, "work", format!("w{n}"), "Kudos");
            item.created_at = Utc::now() + TimeDelta::seconds(n);
            repo.create(&item).await.unwrap();
        }
        repo.create(&NotificationItem::new("other", event, "work", "w", "Kudos"))
            .await
            .unwrap();

        let page = repo.list_for_user("reader", 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].source_id, "w3");
        assert_eq!(page[1].source_id, "w2");
    }

    #[tokio::test]
    async fn inactive_rules_are_hidden() {
        let source = MemoryRuleSource::new();
        let event = courier_common::model::EventType::CommentReceived;
        let action = courier_common::model::RuleAction::Suppress;

        source
            .add(NotificationRule::new("reader", "on", vec![event], action))
            .unwrap();
        let mut off = NotificationRule::new("reader", "off", vec![event], action);
        off.active = false;
        source.add(off).unwrap();

        let rules = source.active_rules("reader").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "on");
        assert!(source.active_rules("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delay_rules_without_a_delay_are_rejected() {
        let source = MemoryRuleSource::new();
        let event = courier_common::model::EventType::CommentReceived;
        let action = courier_common::model::RuleAction::Delay;

        let err = source
            .add(NotificationRule::new("reader", "later", vec![event], action))
            .unwrap_err();

        assert_eq!(err, ValidationError::MissingDelay("later".to_string()));
        assert!(source.active_rules("reader").await.unwrap().is_empty());
    }
}
