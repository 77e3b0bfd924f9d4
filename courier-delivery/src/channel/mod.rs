//! Channel providers.
//!
//! A provider owns the wire protocol of one [`Channel`]. The message service
//! hands it one (message, recipient) pair at a time and records whatever
//! [`DeliveryReport`] comes back on the attempt.

pub mod email;
pub mod in_app;

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use courier_common::model::{
    AttemptError, Channel, DeliveryAttempt, DeliveryStatus, Message, Recipient,
};
use parking_lot::RwLock;
use serde::Serialize;

pub use email::{EmailProvider, SmtpConfig, SmtpCredentials, TlsMode};
pub use in_app::{InAppProvider, Inbox, InboxEntry};

/// One delivery to hand to a provider.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRequest<'a> {
    pub message: &'a Message,
    pub recipient: &'a Recipient,
    /// Upper bound for the whole exchange. Providers apply their own default
    /// when this is `None`.
    pub deadline: Option<Duration>,
}

/// What a provider reports back for a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub status: DeliveryStatus,
    pub error: Option<AttemptError>,
    pub metadata: BTreeMap<String, String>,
    pub duration: Duration,
}

impl DeliveryReport {
    #[must_use]
    pub const fn new(status: DeliveryStatus, metadata: BTreeMap<String, String>) -> Self {
        Self {
            status,
            error: None,
            metadata,
            duration: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn failed(error: AttemptError, metadata: BTreeMap<String, String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            error: Some(error),
            metadata,
            duration: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Provider-local counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub attempts: u64,
    pub delivered: u64,
    pub sent: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
}

/// Lock-free accumulation of [`ChannelStats`].
#[derive(Debug, Default)]
pub struct StatsCounter {
    attempts: AtomicU64,
    delivered: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    latency_ms: AtomicU64,
}

impl StatsCounter {
    pub fn record(&self, report: &DeliveryReport) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match report.status {
            DeliveryStatus::Delivered => &self.delivered,
            DeliveryStatus::Sent => &self.sent,
            DeliveryStatus::Failed => &self.failed,
            DeliveryStatus::Pending => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let millis = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.fetch_add(millis, Ordering::Relaxed);
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> ChannelStats {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);

        ChannelStats {
            attempts,
            delivered: self.delivered.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            average_latency_ms: if attempts == 0 {
                0.0
            } else {
                latency as f64 / attempts as f64
            },
        }
    }
}

/// The operations every delivery channel implements.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    fn channel(&self) -> Channel;

    /// Attempts one delivery. Failures are reported, never returned.
    async fn deliver(&self, request: DeliveryRequest<'_>) -> DeliveryReport;

    /// Checks a destination address without any network activity.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_address` error describing the problem.
    fn validate_address(&self, address: &str) -> Result<(), AttemptError>;

    /// Sends a verification code to a destination the user wants to add.
    async fn send_verification(&self, address: &str, code: &str) -> DeliveryReport;

    /// The best known status of a past attempt.
    async fn delivery_status(&self, attempt: &DeliveryAttempt) -> DeliveryStatus;

    fn metrics(&self) -> ChannelStats;

    /// A cheap, bounded reachability probe.
    async fn is_available(&self) -> bool;
}

/// Providers keyed by the channel they serve; one per channel.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<AHashMap<Channel, Arc<dyn ChannelProvider>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider`, returning the one it replaces, if any.
    pub fn register(&self, provider: Arc<dyn ChannelProvider>) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.write().insert(provider.channel(), provider)
    }

    #[must_use]
    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.read().get(&channel).cloned()
    }

    /// Registered channels, in channel order.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.providers.read().keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn ChannelProvider>> {
        self.providers.read().values().cloned().collect()
    }
}
