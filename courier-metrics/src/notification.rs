//! Notification delivery metrics
//!
//! Tracks:
//! - Delivery attempts by channel and status
//! - Delivery latency by channel
//! - Delivery errors by channel and kind
//! - Items waiting in digest batches
//! - Ad-hoc named counters and gauges reported through `Telemetry`

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Gauge, Histogram, Meter},
};

use crate::MetricsError;

fn attributes(tags: &[(&str, &str)]) -> Vec<KeyValue> {
    tags.iter()
        .map(|(key, value)| KeyValue::new(key.to_string(), value.to_string()))
        .collect()
}

/// OpenTelemetry instruments for the notification pipeline
#[derive(Debug)]
pub struct NotificationMetrics {
    attempts_total: Counter<u64>,
    latency_seconds: Histogram<f64>,
    errors_total: Counter<u64>,
    batch_pending: Arc<AtomicU64>,
    counters: DashMap<String, Counter<u64>>,
    gauges: DashMap<String, Gauge<f64>>,
}

impl NotificationMetrics {
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let attempts_total = meter
            .u64_counter("courier.delivery.attempts.total")
            .with_description("Total number of delivery attempts by channel and status")
            .build();

        let latency_seconds = meter
            .f64_histogram("courier.delivery.latency.seconds")
            .with_description("Distribution of delivery latency by channel")
            .build();

        let errors_total = meter
            .u64_counter("courier.delivery.errors.total")
            .with_description("Total number of delivery errors by channel and kind")
            .build();

        let batch_pending = Arc::new(AtomicU64::new(0));
        let pending = batch_pending.clone();
        meter
            .u64_observable_gauge("courier.batch.pending")
            .with_description("Notifications waiting to be folded into a digest")
            .with_callback(move |observer| {
                observer.observe(pending.load(Ordering::Relaxed), &[]);
            })
            .build();

        Ok(Self {
            attempts_total,
            latency_seconds,
            errors_total,
            batch_pending,
            counters: DashMap::new(),
            gauges: DashMap::new(),
        })
    }

    pub fn record_attempt(&self, channel: &str, status: &str) {
        self.attempts_total.add(
            1,
            &[
                KeyValue::new("channel", channel.to_string()),
                KeyValue::new("status", status.to_string()),
            ],
        );
    }

    pub fn record_latency(&self, channel: &str, duration: Duration) {
        self.latency_seconds.record(
            duration.as_secs_f64(),
            &[KeyValue::new("channel", channel.to_string())],
        );
    }

    pub fn record_error(&self, channel: &str, kind: &str) {
        self.errors_total.add(
            1,
            &[
                KeyValue::new("channel", channel.to_string()),
                KeyValue::new("kind", kind.to_string()),
            ],
        );
    }

    pub fn set_batch_pending(&self, count: u64) {
        self.batch_pending.store(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn batch_pending(&self) -> u64 {
        self.batch_pending.load(Ordering::Relaxed)
    }

    /// Increments `courier.{name}`, creating the counter on first use.
    pub fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| meter().u64_counter(format!("courier.{name}")).build())
            .add(1, &attributes(tags));
    }

    /// Records `courier.{name}`, creating the gauge on first use.
    pub fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| meter().f64_gauge(format!("courier.{name}")).build())
            .record(value, &attributes(tags));
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("courier.delivery")
}
