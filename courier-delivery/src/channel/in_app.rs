//! In-app delivery: messages land in a per-user inbox the application reads.

use std::{collections::BTreeMap, collections::VecDeque, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::model::{
    AttemptError, Channel, DeliveryAttempt, DeliveryStatus, MessageType,
};
use dashmap::DashMap;
use serde::Serialize;
use ulid::Ulid;

use super::{ChannelProvider, ChannelStats, DeliveryReport, DeliveryRequest, StatsCounter};

/// How many entries each user's inbox keeps before the oldest are dropped.
pub const INBOX_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxEntry {
    pub message_id: Ulid,
    pub kind: MessageType,
    pub subject: String,
    pub text: String,
    pub action_url: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Inbox {
    entries: DashMap<String, VecDeque<InboxEntry>>,
}

impl Inbox {
    fn push(&self, user_id: &str, entry: InboxEntry) {
        let mut entries = self.entries.entry(user_id.to_string()).or_default();
        if entries.len() == INBOX_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// A user's entries, newest first.
    #[must_use]
    pub fn entries(&self, user_id: &str) -> Vec<InboxEntry> {
        self.entries
            .get(user_id)
            .map(|entries| entries.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct InAppProvider {
    inbox: Arc<Inbox>,
    stats: StatsCounter,
}

impl InAppProvider {
    #[must_use]
    pub fn new(inbox: Arc<Inbox>) -> Self {
        Self {
            inbox,
            stats: StatsCounter::default(),
        }
    }
}

#[async_trait]
impl ChannelProvider for InAppProvider {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn deliver(&self, request: DeliveryRequest<'_>) -> DeliveryReport {
        let started = Instant::now();
        let message = request.message;

        self.inbox.push(
            &request.recipient.user_id,
            InboxEntry {
                message_id: message.id,
                kind: message.kind,
                subject: message.content.subject.clone(),
                text: message.content.plain_text.clone(),
                action_url: message.content.action_url.clone(),
                received_at: Utc::now(),
            },
        );

        let report = DeliveryReport::new(
            DeliveryStatus::Delivered,
            BTreeMap::from([("user_id".to_string(), request.recipient.user_id.clone())]),
        )
        .with_duration(started.elapsed());
        self.stats.record(&report);
        report
    }

    fn validate_address(&self, address: &str) -> Result<(), AttemptError> {
        if address.trim().is_empty() {
            Err(AttemptError::invalid_address("Empty user id"))
        } else {
            Ok(())
        }
    }

    async fn send_verification(&self, address: &str, _code: &str) -> DeliveryReport {
        match self.validate_address(address) {
            Ok(()) => DeliveryReport::new(DeliveryStatus::Delivered, BTreeMap::new()),
            Err(err) => DeliveryReport::failed(err, BTreeMap::new()),
        }
    }

    async fn delivery_status(&self, attempt: &DeliveryAttempt) -> DeliveryStatus {
        attempt.status
    }

    fn metrics(&self) -> ChannelStats {
        self.stats.snapshot()
    }

    async fn is_available(&self) -> bool {
        true
    }
}
