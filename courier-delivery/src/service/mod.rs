//! The message service: validation, fan-out, scheduling and retries.

pub mod validator;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use courier_common::{
    internal,
    model::{
        AttemptError, Channel, DeliveryAttempt, DeliverySummary, Message, MessageStatus,
        Recipient,
    },
};
use courier_metrics::{MessageMetrics, Telemetry, TelemetryError};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::{
    channel::{ChannelProvider, DeliveryRequest, ProviderRegistry},
    classifier::RetryPolicy,
    error::ServiceError,
    rate_limiter::RateLimiter,
    repository::{AttemptRepository, MessageRepository, RepositoryError},
};

/// Slack given to a provider past its own deadline before the attempt is
/// abandoned.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

mod defaults {
    pub const fn delivery_timeout_secs() -> u64 {
        300
    }

    pub const fn scheduler_interval_secs() -> u64 {
        30
    }

    pub const fn scheduler_batch() -> usize {
        100
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Deadline handed to providers for a single attempt.
    #[serde(default = "defaults::delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,

    /// How often scheduled messages are checked.
    #[serde(default = "defaults::scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,

    /// Most scheduled messages dispatched per tick.
    #[serde(default = "defaults::scheduler_batch")]
    pub scheduler_batch: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: defaults::delivery_timeout_secs(),
            scheduler_interval_secs: defaults::scheduler_interval_secs(),
            scheduler_batch: defaults::scheduler_batch(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub const fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

/// What a send or retry produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub message_id: Ulid,
    pub status: MessageStatus,
    /// Computed over the newest attempt of every (user, channel) pair.
    pub summary: DeliverySummary,
    /// The attempts made by this call.
    pub attempts: Vec<DeliveryAttempt>,
}

impl SendOutcome {
    #[must_use]
    pub const fn any_succeeded(&self) -> bool {
        self.summary.overall.succeeded() > 0
    }
}

/// A stored message with its full attempt history.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageReport {
    pub message: Message,
    pub attempts: Vec<DeliveryAttempt>,
    pub summary: DeliverySummary,
}

pub struct MessageService {
    config: ServiceConfig,
    messages: Arc<dyn MessageRepository>,
    attempts: Arc<dyn AttemptRepository>,
    providers: ProviderRegistry,
    rate_limiter: RateLimiter,
    telemetry: Arc<dyn Telemetry>,
}

impl std::fmt::Debug for MessageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService")
            .field("config", &self.config)
            .field("providers", &self.providers)
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

impl MessageService {
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        messages: Arc<dyn MessageRepository>,
        attempts: Arc<dyn AttemptRepository>,
        rate_limiter: RateLimiter,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            config,
            messages,
            attempts,
            providers: ProviderRegistry::new(),
            rate_limiter,
            telemetry,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub const fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    #[must_use]
    pub fn telemetry(&self) -> &dyn Telemetry {
        self.telemetry.as_ref()
    }

    /// Makes `provider` the handler for its channel, returning the one it replaced.
    pub fn register_provider(
        &self,
        provider: Arc<dyn ChannelProvider>,
    ) -> Option<Arc<dyn ChannelProvider>> {
        let channel = provider.channel();
        let previous = self.providers.register(provider);
        internal!(
            level = INFO,
            "{} provider for {channel}",
            if previous.is_some() { "Replaced" } else { "Registered" }
        );
        previous
    }

    /// Channels whose provider currently answers its availability probe.
    pub async fn available_channels(&self) -> Vec<Channel> {
        let providers = self.providers.all();
        let probes = providers.iter().map(|provider| async move {
            provider.is_available().await.then(|| provider.channel())
        });

        let mut channels: Vec<Channel> = join_all(probes).await.into_iter().flatten().collect();
        channels.sort_unstable();
        channels
    }

    /// # Errors
    ///
    /// Returns an error if the range is inverted or the telemetry sink cannot
    /// be queried.
    pub fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MessageMetrics, TelemetryError> {
        self.telemetry.metrics(start, end)
    }

    /// Validates, stores and delivers `message` to every recipient on every
    /// candidate channel.
    ///
    /// Per-attempt failures are recorded on the attempts and never fail the
    /// call.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is invalid or cannot be stored.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(message_id = %message.id, kind = %message.kind)
    )]
    pub async fn send(&self, mut message: Message) -> Result<SendOutcome, ServiceError> {
        validator::validate(&message)?;

        message.status = MessageStatus::Processing;
        self.messages.create(&message).await?;

        self.deliver_stored(&message).await
    }

    /// Stores `message` for delivery at `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is invalid, `at` has already passed,
    /// or the message cannot be stored.
    pub async fn schedule(
        &self,
        mut message: Message,
        at: DateTime<Utc>,
    ) -> Result<Ulid, ServiceError> {
        validator::validate(&message)?;

        if at < Utc::now() {
            return Err(ServiceError::ScheduledInPast { id: message.id });
        }

        message.status = MessageStatus::Pending;
        message.scheduled_at = Some(at);
        self.messages.create(&message).await?;

        internal!(level = DEBUG, "Scheduled {} for {at}", message.id);
        Ok(message.id)
    }

    /// Delivers every scheduled message due at `now`, up to the configured
    /// batch. Returns how many were dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if due messages cannot be listed.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let due = self
            .messages
            .list_due(now, self.config.scheduler_batch)
            .await?;
        let mut dispatched = 0;

        for message in due {
            match self.messages.claim(message.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    internal!(level = ERROR, "Unable to claim {}: {err}", message.id);
                    continue;
                }
            }

            match self.deliver_stored(&message).await {
                Ok(outcome) => {
                    dispatched += 1;
                    internal!(
                        level = DEBUG,
                        "Dispatched scheduled {}: {:?}",
                        outcome.message_id,
                        outcome.status
                    );
                }
                Err(err) => {
                    internal!(level = ERROR, "Dispatch of {} failed: {err}", message.id);
                }
            }
        }

        Ok(dispatched)
    }

    /// Runs [`Self::dispatch_due`] on an interval until `token` is cancelled.
    ///
    /// A dispatch already running when the token fires is allowed to finish.
    pub async fn run_scheduler(self: Arc<Self>, token: CancellationToken) {
        internal!("Scheduler starting");

        let mut timer = tokio::time::interval(Duration::from_secs(
            self.config.scheduler_interval_secs.max(1),
        ));
        // Skip the first tick to avoid immediate execution
        timer.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    internal!("Scheduler received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    match self.dispatch_due(Utc::now()).await {
                        Ok(count) if count > 0 => {
                            tracing::info!("Dispatched {count} scheduled messages");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!("Error dispatching scheduled messages: {err}");
                        }
                    }
                }
            }
        }

        internal!("Scheduler shutdown complete");
    }

    /// The message, every attempt made for it and the current summary.
    ///
    /// # Errors
    ///
    /// Returns `MessageNotFound` for an unknown id.
    pub async fn status(&self, id: Ulid) -> Result<MessageReport, ServiceError> {
        let message = self.load(id).await?;
        let attempts = self.attempts.list_for_message(id).await?;
        let summary = DeliverySummary::from_attempts(DeliverySummary::latest(&attempts));

        Ok(MessageReport {
            message,
            attempts,
            summary,
        })
    }

    /// Retries the newest attempt of every (user, channel) pair that failed
    /// with a retryable error and still has retries left.
    ///
    /// # Errors
    ///
    /// Returns `MessageNotFound` for an unknown id, or an error if the
    /// attempt history cannot be read.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retry_failed(&self, id: Ulid) -> Result<SendOutcome, ServiceError> {
        let message = self.load(id).await?;
        let history = self.attempts.list_for_message(id).await?;

        let retries = DeliverySummary::latest(&history)
            .into_iter()
            .filter(|attempt| retry_allowed(attempt))
            .filter_map(|attempt| {
                let recipient = message
                    .recipients
                    .iter()
                    .find(|recipient| recipient.user_id == attempt.user_id)?;
                Some(self.run_attempt(&message, recipient, attempt.retry()))
            });
        let attempts = join_all(retries).await;

        internal!(level = DEBUG, "Retried {} attempts for {id}", attempts.len());

        let history = self.attempts.list_for_message(id).await?;
        self.conclude(&message, &history, attempts).await
    }

    async fn load(&self, id: Ulid) -> Result<Message, ServiceError> {
        self.messages.get(id).await.map_err(|err| {
            if err.is_not_found() {
                ServiceError::MessageNotFound(id)
            } else {
                err.into()
            }
        })
    }

    async fn deliver_stored(&self, message: &Message) -> Result<SendOutcome, ServiceError> {
        let deliveries = message.recipients.iter().flat_map(|recipient| {
            recipient
                .candidate_channels(message.kind)
                .into_iter()
                .map(move |channel| {
                    self.run_attempt(
                        message,
                        recipient,
                        DeliveryAttempt::pending(message.id, recipient.user_id.clone(), channel),
                    )
                })
        });
        let attempts = join_all(deliveries).await;

        self.conclude(message, &attempts, attempts.clone()).await
    }

    async fn conclude(
        &self,
        message: &Message,
        history: &[DeliveryAttempt],
        attempts: Vec<DeliveryAttempt>,
    ) -> Result<SendOutcome, ServiceError> {
        let summary = DeliverySummary::from_attempts(DeliverySummary::latest(history));
        let status = summary.message_status();
        self.messages.update_status(message.id, status).await?;

        internal!(
            level = INFO,
            "Message {} {status:?}: {} sent, {} delivered, {} failed",
            message.id,
            summary.overall.sent,
            summary.overall.delivered,
            summary.overall.failed
        );

        Ok(SendOutcome {
            message_id: message.id,
            status,
            summary,
            attempts,
        })
    }

    /// Everything that must hold before a provider is contacted.
    async fn admit(
        &self,
        message: &Message,
        recipient: &Recipient,
        channel: Channel,
    ) -> Result<Arc<dyn ChannelProvider>, AttemptError> {
        let settings = &recipient.settings;
        if !settings.enabled {
            return Err(AttemptError::configuration(format!(
                "Notifications are disabled for {}",
                recipient.user_id
            )));
        }

        if settings
            .message_types
            .get(&message.kind)
            .is_some_and(|config| !config.enabled)
        {
            return Err(AttemptError::configuration(format!(
                "{} messages are disabled",
                message.kind
            )));
        }

        let Some(config) = settings.channel(channel) else {
            return Err(AttemptError::configuration(format!(
                "{channel} is not configured"
            )));
        };

        if !config.enabled {
            return Err(AttemptError::configuration(format!("{channel} is disabled")));
        }

        if !config.is_usable(channel) {
            return Err(AttemptError::configuration(format!(
                "{channel} address is not verified"
            )));
        }

        let Some(provider) = self.providers.get(channel) else {
            return Err(AttemptError::configuration(format!(
                "No provider registered for {channel}"
            )));
        };

        let decision = self.rate_limiter.check(&message.caller).await;
        if decision.degraded {
            self.report(self.telemetry.increment_counter(
                "rate_limit.degraded",
                &[("tier", decision.tier.as_str())],
            ));
        }
        if !decision.allowed {
            return Err(AttemptError::rate_limited(format!(
                "{} tier limit of {} requests exceeded",
                decision.tier.as_str(),
                decision.limit
            )));
        }

        Ok(provider)
    }

    async fn run_attempt(
        &self,
        message: &Message,
        recipient: &Recipient,
        mut attempt: DeliveryAttempt,
    ) -> DeliveryAttempt {
        let started = Instant::now();
        let channel = attempt.channel;

        match self.admit(message, recipient, channel).await {
            Err(error) => {
                internal!(
                    level = DEBUG,
                    "{channel} attempt for {} rejected: {error}",
                    recipient.user_id
                );
                attempt.fail(error);
                schedule_retry(&mut attempt);
                self.store(&attempt, true).await;
            }
            Ok(provider) => {
                self.store(&attempt, true).await;

                let deadline = self.config.delivery_timeout();
                let request = DeliveryRequest {
                    message,
                    recipient,
                    deadline: Some(deadline),
                };

                match tokio::time::timeout(deadline + DEADLINE_GRACE, provider.deliver(request))
                    .await
                {
                    Ok(report) => {
                        attempt.metadata.extend(report.metadata);
                        attempt.complete(report.status, report.error);
                    }
                    Err(_) => attempt.fail(AttemptError::timeout(format!(
                        "{channel} provider did not finish within {deadline:?}"
                    ))),
                }

                schedule_retry(&mut attempt);
                self.store(&attempt, false).await;
            }
        }

        self.record(&attempt, started.elapsed());
        attempt
    }

    async fn store(&self, attempt: &DeliveryAttempt, new: bool) {
        let result = if new {
            self.attempts.create(attempt).await
        } else {
            self.attempts.update(attempt).await
        };

        if let Err(err) = result {
            log_store_failure(attempt, &err);
        }
    }

    fn record(&self, attempt: &DeliveryAttempt, elapsed: Duration) {
        self.report(self.telemetry.record_attempt(attempt));
        self.report(self.telemetry.record_latency(attempt.channel, elapsed));
        if let Some(error) = &attempt.error {
            self.report(
                self.telemetry
                    .record_error(attempt.channel, error.kind, &error.message),
            );
        }
    }

    #[allow(clippy::unused_self)]
    fn report(&self, result: Result<(), TelemetryError>) {
        if let Err(err) = result {
            internal!(level = WARN, "Telemetry rejected a record: {err}");
        }
    }
}

fn retry_allowed(attempt: &DeliveryAttempt) -> bool {
    attempt.is_retryable_failure()
        && attempt
            .error
            .as_ref()
            .is_some_and(|error| RetryPolicy::for_kind(error.kind).allows(attempt.retry_count))
}

fn schedule_retry(attempt: &mut DeliveryAttempt) {
    if !retry_allowed(attempt) {
        return;
    }

    if let Some(error) = &attempt.error {
        attempt.next_retry_at = TimeDelta::from_std(RetryPolicy::for_kind(error.kind).delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay));
    }
}

fn log_store_failure(attempt: &DeliveryAttempt, err: &RepositoryError) {
    internal!(
        level = ERROR,
        "Unable to persist attempt {} ({} for {}): {err}",
        attempt.id,
        attempt.channel,
        attempt.user_id
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use courier_common::model::{
        CallerIdentity, ChannelConfig, DeliveryStatus, ErrorKind, MessageContent, MessageType,
        UserNotificationSettings,
    };
    use courier_metrics::InMemoryTelemetry;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        channel::{ChannelStats, DeliveryReport, InAppProvider, Inbox},
        rate_limiter::{RateLimitConfig, TierLimit, TrustTier},
        repository::{MemoryAttemptRepository, MemoryMessageRepository},
    };

    /// A provider that answers with a queue of scripted reports.
    struct ScriptedProvider {
        channel: Channel,
        script: Mutex<Vec<DeliveryReport>>,
        calls: Mutex<usize>,
    }

    impl ScriptedProvider {
        fn new(channel: Channel, mut script: Vec<DeliveryReport>) -> Self {
            script.reverse();
            Self {
                channel,
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ChannelProvider for ScriptedProvider {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn deliver(&self, _request: DeliveryRequest<'_>) -> DeliveryReport {
            *self.calls.lock() += 1;
            self.script.lock().pop().unwrap_or_else(|| {
                DeliveryReport::new(DeliveryStatus::Delivered, BTreeMap::new())
            })
        }

        fn validate_address(&self, _address: &str) -> Result<(), AttemptError> {
            Ok(())
        }

        async fn send_verification(&self, _address: &str, _code: &str) -> DeliveryReport {
            DeliveryReport::new(DeliveryStatus::Sent, BTreeMap::new())
        }

        async fn delivery_status(&self, attempt: &DeliveryAttempt) -> DeliveryStatus {
            attempt.status
        }

        fn metrics(&self) -> ChannelStats {
            ChannelStats::default()
        }

        async fn is_available(&self) -> bool {
            false
        }
    }

    fn service_with(limits: RateLimitConfig) -> (MessageService, Arc<InMemoryTelemetry>) {
        let telemetry = Arc::new(InMemoryTelemetry::default());
        let service = MessageService::new(
            ServiceConfig::default(),
            Arc::new(MemoryMessageRepository::new()),
            Arc::new(MemoryAttemptRepository::new()),
            RateLimiter::in_memory(limits),
            telemetry.clone(),
        );
        (service, telemetry)
    }

    fn service() -> (MessageService, Arc<InMemoryTelemetry>) {
        service_with(RateLimitConfig::default())
    }

    fn settings(user: &str) -> UserNotificationSettings {
        let mut settings = UserNotificationSettings::defaults_for(user);
        settings
            .channels
            .insert(Channel::Email, ChannelConfig::enabled(format!("{user}@example.com")));
        settings
    }

    fn message(users: &[&str]) -> Message {
        Message::new(
            MessageType::SystemAlert,
            MessageContent::new("Maintenance", "We will be down for an hour."),
            users.iter().map(|user| Recipient::new(settings(user))).collect(),
        )
    }

    fn failure(kind: ErrorKind, retryable: bool) -> DeliveryReport {
        DeliveryReport::failed(AttemptError::new(kind, "scripted", retryable), BTreeMap::new())
    }

    #[tokio::test]
    async fn fans_out_to_every_recipient_and_channel() {
        let (service, telemetry) = service();
        service.register_provider(Arc::new(ScriptedProvider::new(Channel::Email, vec![])));
        service.register_provider(Arc::new(InAppProvider::new(Arc::new(Inbox::default()))));

        let outcome = service.send(message(&["a", "b", "c"])).await.unwrap();

        assert_eq!(outcome.attempts.len(), 6);
        assert_eq!(outcome.status, MessageStatus::Sent);
        assert_eq!(outcome.summary.overall.delivered, 6);
        assert_eq!(outcome.summary.by_channel[&Channel::InApp].total, 3);

        let report = service.status(outcome.message_id).await.unwrap();
        assert_eq!(report.attempts.len(), 6);
        assert_eq!(report.message.status, MessageStatus::Sent);

        let now = Utc::now();
        let metrics = service
            .metrics(now - TimeDelta::minutes(1), now + TimeDelta::minutes(1))
            .unwrap();
        assert_eq!(metrics.total_attempts, 6);
        assert_eq!(telemetry.counter("rate_limit.degraded", &[]), 0);
    }

    #[tokio::test]
    async fn configuration_problems_never_reach_a_provider() {
        let (service, _) = service();
        let email = Arc::new(ScriptedProvider::new(Channel::Email, vec![]));
        service.register_provider(email.clone());

        let mut unverified = settings("unverified");
        unverified.channels.insert(
            Channel::Email,
            ChannelConfig {
                enabled: true,
                address: Some("x@example.com".to_string()),
                verified_at: None,
            },
        );
        let mut disabled = settings("disabled");
        disabled.enabled = false;

        let message = Message::new(
            MessageType::SystemAlert,
            MessageContent::new("Hi", "Hello"),
            vec![
                Recipient::new(unverified).with_channels(vec![Channel::Email]),
                Recipient::new(disabled).with_channels(vec![Channel::Email]),
                Recipient::new(settings("no-provider")).with_channels(vec![Channel::InApp]),
                Recipient::new(settings("no-config")).with_channels(vec![Channel::Push]),
            ],
        );

        let outcome = service.send(message).await.unwrap();

        assert_eq!(email.calls(), 0);
        assert_eq!(outcome.attempts.len(), 4);
        assert_eq!(outcome.status, MessageStatus::Failed);
        for attempt in &outcome.attempts {
            assert_eq!(attempt.status, DeliveryStatus::Failed);
            let error = attempt.error.as_ref().unwrap();
            assert_eq!(error.kind, ErrorKind::ConfigurationError);
            assert!(!error.retryable);
        }
    }

    #[tokio::test]
    async fn partial_failure() {
        let (service, _) = service();
        service.register_provider(Arc::new(ScriptedProvider::new(
            Channel::Email,
            vec![failure(ErrorKind::MailboxUnavailable, false)],
        )));
        service.register_provider(Arc::new(InAppProvider::new(Arc::new(Inbox::default()))));

        let outcome = service.send(message(&["a"])).await.unwrap();

        assert_eq!(outcome.status, MessageStatus::PartiallyFailed);
        assert_eq!(outcome.summary.overall.failed, 1);
        assert!(outcome.any_succeeded());
    }

    #[tokio::test]
    async fn invalid_messages_are_not_stored() {
        let (service, _) = service();
        let mut invalid = message(&["a"]);
        invalid.content.subject.clear();

        let err = service.send(invalid.clone()).await.unwrap_err();

        assert!(err.is_validation());
        assert!(service.status(invalid.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn repeated_recipients_are_rejected() {
        let (service, _) = service();
        let inbox = Arc::new(Inbox::default());
        service.register_provider(Arc::new(InAppProvider::new(inbox.clone())));

        let twice = message(&["a", "a"]);
        let err = service.send(twice.clone()).await.unwrap_err();

        assert!(err.is_validation());
        assert!(inbox.entries("a").is_empty());
        assert!(service.status(twice.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rate_limited_attempts_are_retryable() {
        let mut limits = RateLimitConfig::default();
        limits.limits.insert(TrustTier::Anonymous, TierLimit::new(1, 60));
        let (service, _) = service_with(limits);
        service.register_provider(Arc::new(ScriptedProvider::new(Channel::Email, vec![])));

        let mut message = message(&["a", "b"]).with_caller(CallerIdentity::anonymous("10.0.0.1"));
        for recipient in &mut message.recipients {
            recipient.channels = Some(vec![Channel::Email]);
        }

        let outcome = service.send(message).await.unwrap();
        let limited: Vec<_> = outcome
            .attempts
            .iter()
            .filter(|attempt| {
                attempt
                    .error
                    .as_ref()
                    .is_some_and(|error| error.kind == ErrorKind::RateLimited)
            })
            .collect();

        assert_eq!(limited.len(), 1);
        assert!(limited[0].is_retryable_failure());
        assert!(limited[0].next_retry_at.is_some());
        assert_eq!(outcome.status, MessageStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn retries_only_retryable_failures() {
        let (service, _) = service();
        let email = Arc::new(ScriptedProvider::new(
            Channel::Email,
            vec![
                failure(ErrorKind::NetworkError, true),
                failure(ErrorKind::MailboxUnavailable, false),
            ],
        ));
        service.register_provider(email.clone());

        let mut message = message(&["a", "b"]);
        for recipient in &mut message.recipients {
            recipient.channels = Some(vec![Channel::Email]);
        }

        let first = service.send(message).await.unwrap();
        assert_eq!(first.status, MessageStatus::Failed);

        let retry = service.retry_failed(first.message_id).await.unwrap();

        assert_eq!(retry.attempts.len(), 1);
        assert_eq!(retry.attempts[0].retry_count, 1);
        assert_eq!(retry.attempts[0].status, DeliveryStatus::Delivered);
        assert_eq!(retry.status, MessageStatus::PartiallyFailed);
        assert_eq!(email.calls(), 3);

        let report = service.status(first.message_id).await.unwrap();
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.summary.overall.total, 2);
    }

    #[tokio::test]
    async fn retry_ceiling_is_per_kind() {
        let (service, _) = service();
        service.register_provider(Arc::new(ScriptedProvider::new(
            Channel::Email,
            vec![
                failure(ErrorKind::TemporaryFailure, true),
                failure(ErrorKind::TemporaryFailure, true),
                failure(ErrorKind::TemporaryFailure, true),
            ],
        )));

        let mut message = message(&["a"]);
        message.recipients[0].channels = Some(vec![Channel::Email]);

        let first = service.send(message).await.unwrap();
        let second = service.retry_failed(first.message_id).await.unwrap();
        assert_eq!(second.attempts.len(), 1);
        assert!(second.attempts[0].next_retry_at.is_none());

        let third = service.retry_failed(first.message_id).await.unwrap();
        assert!(third.attempts.is_empty());
    }

    #[tokio::test]
    async fn scheduled_messages_wait_until_due() {
        let (service, _) = service();
        service.register_provider(Arc::new(InAppProvider::new(Arc::new(Inbox::default()))));

        let mut message = message(&["a"]);
        message.recipients[0].channels = Some(vec![Channel::InApp]);
        let at = Utc::now() + TimeDelta::minutes(10);
        let id = service.schedule(message, at).await.unwrap();

        assert_eq!(service.dispatch_due(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            service.status(id).await.unwrap().message.status,
            MessageStatus::Pending
        );

        assert_eq!(service.dispatch_due(at).await.unwrap(), 1);
        assert_eq!(
            service.status(id).await.unwrap().message.status,
            MessageStatus::Sent
        );
        assert_eq!(service.dispatch_due(at).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scheduling_in_the_past_is_rejected() {
        let (service, _) = service();
        let err = service
            .schedule(message(&["a"]), Utc::now() - TimeDelta::minutes(1))
            .await
            .unwrap_err();

        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn availability_is_probed() {
        let (service, _) = service();
        service.register_provider(Arc::new(ScriptedProvider::new(Channel::Email, vec![])));
        service.register_provider(Arc::new(InAppProvider::new(Arc::new(Inbox::default()))));

        assert_eq!(service.available_channels().await, vec![Channel::InApp]);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_stops_when_cancelled() {
        let (service, _) = service();
        let service = Arc::new(service);
        let token = CancellationToken::new();

        let handle = tokio::spawn(service.run_scheduler(token.clone()));
        tokio::time::advance(Duration::from_secs(61)).await;
        token.cancel();

        handle.await.unwrap();
    }
}
