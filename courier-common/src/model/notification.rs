use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{EventType, Frequency, Priority};

/// A candidate notification, before it is delivered directly or folded into a digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub id: Ulid,
    pub user_id: String,
    pub event: EventType,
    #[serde(default)]
    pub priority: Priority,
    pub source_id: String,
    pub source_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub actor_name: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub digest_id: Option<Ulid>,
    pub created_at: DateTime<Utc>,
}

impl NotificationItem {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        event: EventType,
        source_type: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            user_id: user_id.into(),
            event,
            priority: Priority::default(),
            source_id: source_id.into(),
            source_type: source_type.into(),
            title: title.into(),
            description: String::new(),
            action_url: None,
            actor_id: None,
            actor_name: None,
            extra: BTreeMap::new(),
            delivered: false,
            delivered_at: None,
            read_at: None,
            digest_id: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_actor(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.actor_id = Some(id.into());
        self.actor_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// A string value from the extra data.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(serde_json::Value::as_str)
    }

    /// The `tags` array from the extra data, if any.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        self.extra
            .get("tags")
            .and_then(serde_json::Value::as_array)
            .map(|tags| tags.iter().filter_map(serde_json::Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn mark_delivered(&mut self, digest_id: Option<Ulid>) {
        self.delivered = true;
        self.delivered_at = Some(Utc::now());
        if digest_id.is_some() {
            self.digest_id = digest_id;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
    #[default]
    Pending,
    Sent,
    /// Gave up after the configured number of attempts.
    Failed,
}

/// Several notifications for one user, delivered as a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationDigest {
    pub id: Ulid,
    pub user_id: String,
    pub digest_type: Frequency,
    /// Ordered as rendered.
    pub items: Vec<NotificationItem>,
    pub status: DigestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl NotificationDigest {
    #[must_use]
    pub fn new(user_id: impl Into<String>, digest_type: Frequency, items: Vec<NotificationItem>) -> Self {
        Self {
            id: Ulid::new(),
            user_id: user_id.into(),
            digest_type,
            items,
            status: DigestStatus::Pending,
            created_at: Utc::now(),
            sent_at: None,
            attempts: 0,
        }
    }

    pub fn mark_sent(&mut self) {
        self.status = DigestStatus::Sent;
        self.sent_at = Some(Utc::now());
    }

    pub const fn mark_failed(&mut self) {
        self.status = DigestStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_come_from_extra() {
        let item = NotificationItem::new("u", EventType::NewWork, "work", "w1", "title")
            .with_extra("tags", serde_json::json!(["angst", "fluff", 3]));

        assert_eq!(item.tags(), vec!["angst", "fluff"]);
    }

    #[test]
    fn missing_tags_are_empty() {
        let item = NotificationItem::new("u", EventType::NewWork, "work", "w1", "title");
        assert!(item.tags().is_empty());
    }
}
