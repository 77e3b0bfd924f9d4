//! The telemetry interface used by the delivery engine.

use std::{collections::BTreeMap, collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};
use courier_common::model::{Channel, DeliveryAttempt, DeliveryStatus, ErrorKind};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::TelemetryError;

/// Key/value pairs attached to a counter or gauge.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Sink for delivery telemetry.
///
/// Implementations must be cheap and must never block delivery; callers treat
/// every error as non-fatal.
pub trait Telemetry: Send + Sync {
    /// Records a finished attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the record.
    fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), TelemetryError>;

    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the record.
    fn record_latency(&self, channel: Channel, duration: Duration) -> Result<(), TelemetryError>;

    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the record.
    fn record_error(
        &self,
        channel: Channel,
        kind: ErrorKind,
        detail: &str,
    ) -> Result<(), TelemetryError>;

    /// # Errors
    ///
    /// Returns an error if the name is invalid or the sink is unavailable.
    fn increment_counter(&self, name: &str, tags: Tags<'_>) -> Result<(), TelemetryError>;

    /// # Errors
    ///
    /// Returns an error if the name is invalid or the sink is unavailable.
    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>) -> Result<(), TelemetryError>;

    /// Aggregates everything recorded within `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is invalid or the sink cannot be queried.
    fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MessageMetrics, TelemetryError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelMetrics {
    pub attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
}

/// Aggregated view over a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageMetrics {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    /// Zero when nothing was attempted.
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub by_channel: BTreeMap<Channel, ChannelMetrics>,
    pub errors_by_kind: BTreeMap<String, u64>,
    /// Lifetime totals; counters are not bucketed by time.
    pub counters: BTreeMap<String, u64>,
    /// Most recent values.
    pub gauges: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    at: DateTime<Utc>,
    channel: Channel,
    status: DeliveryStatus,
}

#[derive(Debug, Clone, Copy)]
struct LatencyRecord {
    at: DateTime<Utc>,
    channel: Channel,
    duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ErrorRecord {
    at: DateTime<Utc>,
    kind: ErrorKind,
}

fn push_bounded<T>(queue: &RwLock<VecDeque<T>>, capacity: usize, item: T) {
    let mut queue = queue.write();
    if queue.len() == capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

fn series_key(name: &str, tags: Tags<'_>) -> String {
    if tags.is_empty() {
        return name.to_string();
    }

    let mut tags = tags.to_vec();
    tags.sort_unstable();
    let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

fn check_name(name: &str) -> Result<(), TelemetryError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(TelemetryError::InvalidName(name.to_string()))
    }
}

#[allow(clippy::cast_precision_loss)]
fn average_ms(durations: &[Duration]) -> f64 {
    if durations.is_empty() {
        return 0.0;
    }

    durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>() / durations.len() as f64
}

/// Keeps a bounded, queryable history in process memory.
///
/// When the global OpenTelemetry instruments are initialised every record is
/// forwarded to them as well.
#[derive(Debug)]
pub struct InMemoryTelemetry {
    capacity: usize,
    attempts: RwLock<VecDeque<AttemptRecord>>,
    latencies: RwLock<VecDeque<LatencyRecord>>,
    errors: RwLock<VecDeque<ErrorRecord>>,
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
}

impl Default for InMemoryTelemetry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl InMemoryTelemetry {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// `capacity` bounds each history; the oldest records are evicted first.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            attempts: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            latencies: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            errors: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            counters: DashMap::new(),
            gauges: DashMap::new(),
        }
    }

    /// Current value of a counter series.
    #[must_use]
    pub fn counter(&self, name: &str, tags: Tags<'_>) -> u64 {
        self.counters
            .get(&series_key(name, tags))
            .map_or(0, |value| *value)
    }

    #[must_use]
    pub fn gauge(&self, name: &str, tags: Tags<'_>) -> Option<f64> {
        self.gauges.get(&series_key(name, tags)).map(|value| *value)
    }
}

impl Telemetry for InMemoryTelemetry {
    fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), TelemetryError> {
        push_bounded(
            &self.attempts,
            self.capacity,
            AttemptRecord {
                at: attempt.updated_at.unwrap_or(attempt.created_at),
                channel: attempt.channel,
                status: attempt.status,
            },
        );

        if let Some(metrics) = crate::metrics() {
            let status = match attempt.status {
                DeliveryStatus::Pending => "pending",
                DeliveryStatus::Sent => "sent",
                DeliveryStatus::Delivered => "delivered",
                DeliveryStatus::Failed => "failed",
            };
            metrics
                .notification
                .record_attempt(attempt.channel.as_str(), status);
        }

        Ok(())
    }

    fn record_latency(&self, channel: Channel, duration: Duration) -> Result<(), TelemetryError> {
        push_bounded(
            &self.latencies,
            self.capacity,
            LatencyRecord {
                at: Utc::now(),
                channel,
                duration,
            },
        );

        if let Some(metrics) = crate::metrics() {
            metrics
                .notification
                .record_latency(channel.as_str(), duration);
        }

        Ok(())
    }

    fn record_error(
        &self,
        channel: Channel,
        kind: ErrorKind,
        detail: &str,
    ) -> Result<(), TelemetryError> {
        tracing::debug!(%channel, %kind, detail, "Delivery error recorded");

        push_bounded(
            &self.errors,
            self.capacity,
            ErrorRecord {
                at: Utc::now(),
                kind,
            },
        );

        if let Some(metrics) = crate::metrics() {
            metrics
                .notification
                .record_error(channel.as_str(), kind.as_str());
        }

        Ok(())
    }

    fn increment_counter(&self, name: &str, tags: Tags<'_>) -> Result<(), TelemetryError> {
        check_name(name)?;
        *self.counters.entry(series_key(name, tags)).or_insert(0) += 1;

        if let Some(metrics) = crate::metrics() {
            metrics.notification.increment(name, tags);
        }

        Ok(())
    }

    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>) -> Result<(), TelemetryError> {
        check_name(name)?;
        self.gauges.insert(series_key(name, tags), value);

        if let Some(metrics) = crate::metrics() {
            metrics.notification.gauge(name, value, tags);
        }

        Ok(())
    }

    fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MessageMetrics, TelemetryError> {
        if start > end {
            return Err(TelemetryError::InvalidRange);
        }

        let in_range = |at: DateTime<Utc>| at >= start && at <= end;

        let mut by_channel: BTreeMap<Channel, ChannelMetrics> = BTreeMap::new();
        let (mut total, mut successful, mut failed) = (0, 0, 0);

        for record in self.attempts.read().iter().filter(|r| in_range(r.at)) {
            let channel = by_channel.entry(record.channel).or_default();
            channel.attempts += 1;
            total += 1;

            if record.status.is_success() {
                channel.successful += 1;
                successful += 1;
            } else if record.status == DeliveryStatus::Failed {
                channel.failed += 1;
                failed += 1;
            }
        }

        let mut all_latencies = Vec::new();
        let mut channel_latencies: BTreeMap<Channel, Vec<Duration>> = BTreeMap::new();
        for record in self.latencies.read().iter().filter(|r| in_range(r.at)) {
            all_latencies.push(record.duration);
            channel_latencies
                .entry(record.channel)
                .or_default()
                .push(record.duration);
        }
        for (channel, durations) in &channel_latencies {
            by_channel.entry(*channel).or_default().average_latency_ms = average_ms(durations);
        }

        let mut errors_by_kind = BTreeMap::new();
        for record in self.errors.read().iter().filter(|r| in_range(r.at)) {
            *errors_by_kind
                .entry(record.kind.as_str().to_string())
                .or_insert(0) += 1;
        }

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        };

        Ok(MessageMetrics {
            start,
            end,
            total_attempts: total,
            successful,
            failed,
            success_rate,
            average_latency_ms: average_ms(&all_latencies),
            by_channel,
            errors_by_kind,
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_keys_are_tag_order_independent() {
        assert_eq!(
            series_key("sent", &[("channel", "email"), ("kind", "x")]),
            series_key("sent", &[("kind", "x"), ("channel", "email")])
        );
        assert_eq!(series_key("sent", &[]), "sent");
    }

    #[test]
    fn names_are_validated() {
        assert!(check_name("rate_limit.degraded").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("has space").is_err());
    }

    #[test]
    fn average_of_nothing_is_zero() {
        assert!(average_ms(&[]).abs() < f64::EPSILON);
    }
}
