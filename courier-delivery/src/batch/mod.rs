//! Folding low-urgency notifications into periodic digests.
//!
//! Items wait in a per-user queue until either the sweep timer fires or the
//! queue reaches `max_batch_size`. A flush detaches the whole queue under the
//! lock, so an item is either flushed or still pending, never both.

pub mod digest;

use std::{sync::Arc, time::Duration};

use ahash::{AHashMap, AHashSet};
use courier_common::{
    internal,
    model::{
        CallerIdentity, Message, MessageContent, MessageType, NotificationDigest,
        NotificationItem, Recipient, UserNotificationSettings,
    },
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::{
    error::ServiceError,
    repository::{
        DigestRepository, NotificationRepository, PreferenceRepository, settings_or_default,
    },
    service::MessageService,
    templates::TemplateRegistry,
};

/// Caller identity digests are sent under.
const SERVICE_NAME: &str = "courier-batch";

mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub const fn interval_secs() -> u64 {
        3600
    }

    pub const fn max_batch_size() -> usize {
        50
    }

    pub const fn max_digest_attempts() -> u32 {
        5
    }

    pub fn brand() -> String {
        String::from("Courier")
    }

    pub fn settings_url() -> String {
        String::from("https://localhost/settings/notifications")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// When disabled, batched events are delivered immediately instead.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "defaults::interval_secs")]
    pub interval_secs: u64,

    /// A queue this long is flushed straight away.
    #[serde(default = "defaults::max_batch_size")]
    pub max_batch_size: usize,

    /// Sends a digest gets before it is marked failed.
    #[serde(default = "defaults::max_digest_attempts")]
    pub max_digest_attempts: u32,

    /// Shown in digest subjects, e.g. `[Courier] 3 new notifications`.
    #[serde(default = "defaults::brand")]
    pub brand: String,

    #[serde(default = "defaults::settings_url")]
    pub settings_url: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            interval_secs: defaults::interval_secs(),
            max_batch_size: defaults::max_batch_size(),
            max_digest_attempts: defaults::max_digest_attempts(),
            brand: defaults::brand(),
            settings_url: defaults::settings_url(),
        }
    }
}

/// What happened to one digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub digest_id: Ulid,
    pub user_id: String,
    pub items: usize,
    /// At least one channel accepted the digest.
    pub sent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub flushed: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct BatchProcessor {
    config: BatchConfig,
    queues: Mutex<AHashMap<String, Vec<NotificationItem>>>,
    in_flight: Mutex<AHashSet<Ulid>>,
    messages: Arc<MessageService>,
    digests: Arc<dyn DigestRepository>,
    notifications: Arc<dyn NotificationRepository>,
    preferences: Arc<dyn PreferenceRepository>,
    templates: Arc<TemplateRegistry>,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("pending", &self.pending_total())
            .finish_non_exhaustive()
    }
}

impl BatchProcessor {
    #[must_use]
    pub fn new(
        config: BatchConfig,
        messages: Arc<MessageService>,
        digests: Arc<dyn DigestRepository>,
        notifications: Arc<dyn NotificationRepository>,
        preferences: Arc<dyn PreferenceRepository>,
        templates: Arc<TemplateRegistry>,
    ) -> Self {
        Self {
            config,
            queues: Mutex::new(AHashMap::new()),
            in_flight: Mutex::new(AHashSet::new()),
            messages,
            digests,
            notifications,
            preferences,
            templates,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Items waiting for `user_id`.
    #[must_use]
    pub fn pending(&self, user_id: &str) -> usize {
        self.queues.lock().get(user_id).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.queues.lock().values().map(Vec::len).sum()
    }

    /// Queues `item`, flushing its user's queue if it is now full.
    ///
    /// # Errors
    ///
    /// Returns an error if an immediate flush could not store or render its
    /// digest.
    pub async fn add_to_batch(
        &self,
        item: NotificationItem,
    ) -> Result<Option<FlushOutcome>, ServiceError> {
        let user_id = item.user_id.clone();
        let full = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(user_id.clone()).or_default();
            queue.push(item);

            if queue.len() >= self.config.max_batch_size.max(1) {
                queues.remove(&user_id)
            } else {
                None
            }
        };
        self.publish_pending();

        match full {
            Some(items) => {
                internal!(
                    level = DEBUG,
                    "Queue for {user_id} reached {}, flushing",
                    items.len()
                );
                self.flush_items(&user_id, items).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Flushes whatever is queued for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest could not be stored or rendered.
    pub async fn flush_user(&self, user_id: &str) -> Result<Option<FlushOutcome>, ServiceError> {
        let detached = self
            .queues
            .lock()
            .remove(user_id)
            .filter(|items| !items.is_empty());
        self.publish_pending();

        match detached {
            Some(items) => self.flush_items(user_id, items).await.map(Some),
            None => Ok(None),
        }
    }

    /// Retries pending digests, then flushes every non-empty queue.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.retry_pending(&mut report).await;

        let users: Vec<String> = self
            .queues
            .lock()
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(user, _)| user.clone())
            .collect();

        for user_id in users {
            match self.flush_user(&user_id).await {
                Ok(Some(outcome)) if outcome.sent => report.flushed += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => {}
                Err(err) => {
                    report.failed += 1;
                    internal!(level = ERROR, "Failed to flush batch for {user_id}: {err}");
                }
            }
        }

        report
    }

    /// Sweeps every `interval_secs` until `token` is cancelled.
    ///
    /// A sweep already running when the token fires is allowed to finish.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        internal!("Batch processor starting");

        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        // Skip the first tick to avoid immediate execution
        timer.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    internal!("Batch processor received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let report = self.sweep().await;
                    if report == SweepReport::default() {
                        tracing::debug!("Batch sweep found nothing to send");
                    } else {
                        tracing::info!(
                            flushed = report.flushed,
                            retried = report.retried,
                            failed = report.failed,
                            "Batch sweep complete"
                        );
                    }
                }
            }
        }

        internal!("Batch processor shutdown complete");
    }

    async fn retry_pending(&self, report: &mut SweepReport) {
        let pending = match self.digests.list_pending(self.config.max_batch_size.max(1)).await {
            Ok(pending) => pending,
            Err(err) => {
                internal!(level = ERROR, "Unable to list pending digests: {err}");
                return;
            }
        };

        for mut digest in pending {
            if digest.attempts >= self.config.max_digest_attempts {
                digest.mark_failed();
                if let Err(err) = self.digests.update(&digest).await {
                    internal!(level = ERROR, "Failed to update digest {}: {err}", digest.id);
                }
                continue;
            }

            let settings = self.settings_for(&digest.user_id).await;
            match self.deliver(&mut digest, &settings).await {
                Ok(Some(outcome)) if outcome.sent => report.retried += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => {}
                Err(err) => {
                    report.failed += 1;
                    internal!(level = ERROR, "Retry of digest {} failed: {err}", digest.id);
                }
            }
        }
    }

    async fn flush_items(
        &self,
        user_id: &str,
        mut items: Vec<NotificationItem>,
    ) -> Result<FlushOutcome, ServiceError> {
        let settings = self.settings_for(user_id).await;
        digest::order_items(&mut items);

        let mut digest = NotificationDigest::new(user_id, settings.batch_frequency, items);
        if let Err(err) = self.digests.create(&digest).await {
            self.requeue(user_id, digest.items);
            return Err(err.into());
        }

        let outcome = self.deliver(&mut digest, &settings).await?;
        Ok(outcome.unwrap_or(FlushOutcome {
            digest_id: digest.id,
            user_id: user_id.to_string(),
            items: digest.items.len(),
            sent: false,
        }))
    }

    /// Sends a stored digest. `None` if another task is already sending it.
    async fn deliver(
        &self,
        digest: &mut NotificationDigest,
        settings: &UserNotificationSettings,
    ) -> Result<Option<FlushOutcome>, ServiceError> {
        if !self.in_flight.lock().insert(digest.id) {
            return Ok(None);
        }

        let result = self.send_digest(digest, settings).await;
        self.in_flight.lock().remove(&digest.id);
        result.map(Some)
    }

    async fn send_digest(
        &self,
        digest: &mut NotificationDigest,
        settings: &UserNotificationSettings,
    ) -> Result<FlushOutcome, ServiceError> {
        let groups = digest::group_items(&digest.items);
        let count = digest.items.len();
        let html = digest::render_html(
            &self.templates,
            &self.config.brand,
            &self.config.settings_url,
            &groups,
        )?;

        let content = MessageContent::new(
            digest::subject(&self.config.brand, count),
            digest::render_text(&groups),
        )
        .with_html(html)
        .with_variable("digest_type", digest.digest_type.as_str())
        .with_variable("notification_count", count)
        .with_variable("user_id", digest.user_id.as_str())
        .with_variable("digest_id", digest.id.to_string());

        let recipient = Recipient::new(settings.clone()).with_channels(settings.digest_channels());
        let message = Message::new(MessageType::SystemAlert, content, vec![recipient])
            .with_caller(CallerIdentity::internal(SERVICE_NAME))
            .with_metadata("digest_id", digest.id.to_string());

        digest.attempts += 1;
        let sent = match self.messages.send(message).await {
            Ok(outcome) => outcome.any_succeeded(),
            Err(err) => {
                internal!(level = WARN, "Digest {} could not be sent: {err}", digest.id);
                false
            }
        };

        if sent {
            for item in &mut digest.items {
                item.mark_delivered(Some(digest.id));
            }
            digest.mark_sent();
        } else if digest.attempts >= self.config.max_digest_attempts {
            internal!(
                level = WARN,
                "Giving up on digest {} after {} attempts",
                digest.id,
                digest.attempts
            );
            digest.mark_failed();
        }

        if let Err(err) = self.digests.update(digest).await {
            internal!(level = ERROR, "Failed to update digest {}: {err}", digest.id);
        }

        let outcome_tag = if sent { "sent" } else { "failed" };
        if let Err(err) = self.messages.telemetry().increment_counter(
            "digest.flushed",
            &[
                ("type", digest.digest_type.as_str()),
                ("outcome", outcome_tag),
            ],
        ) {
            internal!(level = WARN, "Telemetry rejected a record: {err}");
        }

        if sent {
            for item in &digest.items {
                if let Err(err) = self.notifications.update(item).await {
                    internal!(
                        level = WARN,
                        "Failed to mark notification {} delivered: {err}",
                        item.id
                    );
                }
            }
            internal!(
                level = INFO,
                "Sent {} digest {} to {} with {count} items",
                digest.digest_type,
                digest.id,
                digest.user_id
            );
        } else {
            internal!(
                level = WARN,
                "Digest {} for {} left pending after {} attempts",
                digest.id,
                digest.user_id,
                digest.attempts
            );
        }

        Ok(FlushOutcome {
            digest_id: digest.id,
            user_id: digest.user_id.clone(),
            items: count,
            sent,
        })
    }

    async fn settings_for(&self, user_id: &str) -> UserNotificationSettings {
        settings_or_default(self.preferences.as_ref(), user_id).await
    }

    fn requeue(&self, user_id: &str, items: Vec<NotificationItem>) {
        self.queues
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .splice(0..0, items);
        self.publish_pending();
    }

    fn publish_pending(&self) {
        let pending = self.pending_total();

        if let Some(metrics) = courier_metrics::metrics() {
            metrics
                .notification
                .set_batch_pending(u64::try_from(pending).unwrap_or(u64::MAX));
        }

        #[allow(clippy::cast_precision_loss)]
        let gauge = pending as f64;
        if let Err(err) = self
            .messages
            .telemetry()
            .record_gauge("batch.pending", gauge, &[])
        {
            internal!(level = WARN, "Telemetry rejected a record: {err}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use courier_common::model::{DigestStatus, EventType, Priority};
    use courier_metrics::InMemoryTelemetry;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        channel::{InAppProvider, Inbox},
        rate_limiter::{RateLimitConfig, RateLimiter},
        repository::{
            MemoryAttemptRepository, MemoryDigestRepository, MemoryMessageRepository,
            MemoryNotificationRepository, MemoryPreferenceRepository,
        },
        service::ServiceConfig,
    };

    struct Harness {
        processor: Arc<BatchProcessor>,
        service: Arc<MessageService>,
        inbox: Arc<Inbox>,
        digests: Arc<MemoryDigestRepository>,
        notifications: Arc<MemoryNotificationRepository>,
    }

    fn harness(max_batch_size: usize, with_provider: bool) -> Harness {
        harness_with(
            BatchConfig {
                max_batch_size,
                interval_secs: 60,
                ..BatchConfig::default()
            },
            with_provider,
        )
    }

    fn harness_with(config: BatchConfig, with_provider: bool) -> Harness {
        let service = Arc::new(MessageService::new(
            ServiceConfig::default(),
            Arc::new(MemoryMessageRepository::new()),
            Arc::new(MemoryAttemptRepository::new()),
            RateLimiter::in_memory(RateLimitConfig::default()),
            Arc::new(InMemoryTelemetry::default()),
        ));
        let inbox = Arc::new(Inbox::default());
        if with_provider {
            service.register_provider(Arc::new(InAppProvider::new(inbox.clone())));
        }

        let digests = Arc::new(MemoryDigestRepository::new());
        let notifications = Arc::new(MemoryNotificationRepository::new());
        let processor = Arc::new(BatchProcessor::new(
            config,
            service.clone(),
            digests.clone(),
            notifications.clone(),
            Arc::new(MemoryPreferenceRepository::new()),
            Arc::new(TemplateRegistry::new()),
        ));

        Harness {
            processor,
            service,
            inbox,
            digests,
            notifications,
        }
    }

    fn item(title: &str) -> NotificationItem {
        NotificationItem::new("reader", EventType::KudosReceived, "work", title, title)
            .with_priority(Priority::Low)
    }

    #[tokio::test]
    async fn full_queue_flushes_immediately() {
        let h = harness(3, true);
        let items: Vec<_> = ["a", "b", "c"].into_iter().map(item).collect();
        for item in &items {
            h.notifications.create(item).await.unwrap();
        }

        assert_eq!(h.processor.add_to_batch(items[0].clone()).await.unwrap(), None);
        assert_eq!(h.processor.add_to_batch(items[1].clone()).await.unwrap(), None);
        assert_eq!(h.processor.pending("reader"), 2);

        let outcome = h
            .processor
            .add_to_batch(items[2].clone())
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.sent);
        assert_eq!(outcome.items, 3);
        assert_eq!(h.processor.pending("reader"), 0);

        let digest = h.digests.get(outcome.digest_id).await.unwrap();
        assert_eq!(digest.status, DigestStatus::Sent);
        assert!(digest.items.iter().all(|item| item.delivered));

        let stored = h.notifications.get(items[0].id).await.unwrap();
        assert!(stored.delivered);
        assert_eq!(stored.digest_id, Some(outcome.digest_id));

        let entries = h.inbox.entries("reader");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "[Courier] 3 new notifications");
        let parsed = digest::parse_digest_text(&entries[0].text).unwrap();
        assert_eq!(parsed.total, 3);
        assert_eq!(parsed.groups[0].label, "❤️ Kudos");
    }

    #[tokio::test]
    async fn failed_digest_stays_pending_and_is_retried() {
        let h = harness(10, false);
        h.processor.add_to_batch(item("a")).await.unwrap();

        let outcome = h.processor.flush_user("reader").await.unwrap().unwrap();
        assert!(!outcome.sent);
        assert_eq!(h.processor.pending("reader"), 0);

        let digest = h.digests.get(outcome.digest_id).await.unwrap();
        assert_eq!(digest.status, DigestStatus::Pending);
        assert_eq!(digest.attempts, 1);

        h.service
            .register_provider(Arc::new(InAppProvider::new(h.inbox.clone())));
        let report = h.processor.sweep().await;

        assert_eq!(report.retried, 1);
        assert_eq!(
            h.digests.get(outcome.digest_id).await.unwrap().status,
            DigestStatus::Sent
        );
        assert_eq!(h.inbox.entries("reader").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_digests_do_not_block_newer_retries() {
        let h = harness_with(
            BatchConfig {
                max_batch_size: 1,
                max_digest_attempts: 2,
                ..BatchConfig::default()
            },
            false,
        );

        let first = h.processor.add_to_batch(item("a")).await.unwrap().unwrap();
        let report = h.processor.sweep().await;
        assert_eq!(report.failed, 1);

        let exhausted = h.digests.get(first.digest_id).await.unwrap();
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.status, DigestStatus::Failed);

        let second = h.processor.add_to_batch(item("b")).await.unwrap().unwrap();
        assert!(!second.sent);

        h.service
            .register_provider(Arc::new(InAppProvider::new(h.inbox.clone())));
        let report = h.processor.sweep().await;

        assert_eq!(report.retried, 1);
        assert_eq!(
            h.digests.get(second.digest_id).await.unwrap().status,
            DigestStatus::Sent
        );
        assert_eq!(
            h.digests.get(first.digest_id).await.unwrap().status,
            DigestStatus::Failed
        );
    }

    #[tokio::test]
    async fn sweep_flushes_every_queue() {
        let h = harness(10, true);
        for user in ["a", "b"] {
            let mut queued = item("x");
            queued.user_id = user.to_string();
            h.processor.add_to_batch(queued).await.unwrap();
        }

        let report = h.processor.sweep().await;

        assert_eq!(report.flushed, 2);
        assert_eq!(h.processor.pending_total(), 0);
        assert_eq!(h.inbox.entries("a").len(), 1);
        assert_eq!(h.inbox.entries("b").len(), 1);
    }

    #[tokio::test]
    async fn flushing_an_empty_queue_does_nothing() {
        let h = harness(10, true);
        assert_eq!(h.processor.flush_user("nobody").await.unwrap(), None);
        assert_eq!(h.processor.sweep().await, SweepReport::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_never_lose_or_duplicate_items() {
        let h = harness(7, true);

        let handles: Vec<_> = (0..100)
            .map(|n| {
                let processor = h.processor.clone();
                tokio::spawn(async move {
                    processor.add_to_batch(item(&format!("item-{n}"))).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let flushed: usize = h
            .inbox
            .entries("reader")
            .iter()
            .map(|entry| digest::parse_digest_text(&entry.text).unwrap().total)
            .sum();

        assert_eq!(flushed + h.processor.pending("reader"), 100);
        assert_eq!(flushed % 7, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_sweeps_until_cancelled() {
        let h = harness(10, true);
        h.processor.add_to_batch(item("a")).await.unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(h.processor.clone().run(token.clone()));

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            if h.processor.pending_total() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(h.processor.pending_total(), 0);
        assert_eq!(h.inbox.entries("reader").len(), 1);

        token.cancel();
        handle.await.unwrap();

        h.processor.add_to_batch(item("b")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.processor.pending_total(), 1);
    }
}
