//! Admission control with trust-tiered quotas.
//!
//! Every caller is placed in one of five [`TrustTier`]s, each with its own
//! request ceiling and window length. Counting is delegated to a
//! [`CounterStore`] so that several engine instances can share one.
//!
//! # Tier selection
//!
//! ```text
//! privileged   privileged flag, or an "admin" / "tags:wrangle" scope
//! first_party  first-party client
//! trusted      trusted client
//! public       any other authenticated client id
//! anonymous    everything else, keyed by IP
//! ```
//!
//! The policy fails open: if the store cannot be reached the request is
//! allowed and the decision is flagged `degraded`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use courier_common::{internal, model::CallerIdentity, tracing};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scopes that make a caller privileged regardless of client type.
pub const PRIVILEGED_SCOPES: &[&str] = &["admin", "tags:wrangle"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Privileged,
    FirstParty,
    Trusted,
    Public,
    Anonymous,
}

impl TrustTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Privileged => "privileged",
            Self::FirstParty => "first_party",
            Self::Trusted => "trusted",
            Self::Public => "public",
            Self::Anonymous => "anonymous",
        }
    }

    /// Quota when not overridden. Every tier defaults to a one minute window.
    #[must_use]
    pub const fn default_limit(self) -> TierLimit {
        let requests = match self {
            Self::Privileged => 50_000,
            Self::FirstParty => 10_000,
            Self::Trusted => 5_000,
            Self::Public => 1_000,
            Self::Anonymous => 100,
        };

        TierLimit {
            requests,
            window_secs: default_window(),
        }
    }

    #[must_use]
    pub fn for_caller(caller: &CallerIdentity) -> Self {
        if caller.privileged || PRIVILEGED_SCOPES.iter().any(|scope| caller.has_scope(scope)) {
            Self::Privileged
        } else if caller.first_party {
            Self::FirstParty
        } else if caller.trusted {
            Self::Trusted
        } else if caller.client_id.is_some() {
            Self::Public
        } else {
            Self::Anonymous
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Disables admission control entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Namespace for counter keys
    #[serde(default = "default_service")]
    pub service: String,

    /// Per-tier quotas replacing the defaults
    #[serde(default)]
    pub limits: AHashMap<TrustTier, TierLimit>,
}

/// A tier's quota: `requests` per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    pub requests: u64,
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

impl TierLimit {
    #[must_use]
    pub const fn new(requests: u64, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

const fn default_enabled() -> bool {
    true
}

fn default_service() -> String {
    "courier".to_string()
}

const fn default_window() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            service: default_service(),
            limits: AHashMap::default(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn limit(&self, tier: TrustTier) -> TierLimit {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_limit())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterStoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
}

/// The count for a key after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

/// Atomic increment-and-read of windowed counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` in its current window, opening a new window of
    /// length `window` if the previous one has expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, CounterStoreError>;
}

fn window_length(window: Duration) -> TimeDelta {
    TimeDelta::from_std(window).unwrap_or_else(|_| TimeDelta::days(1))
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: DateTime<Utc>,
    length: TimeDelta,
    count: u64,
}

impl Window {
    fn reset_at(&self) -> DateTime<Utc> {
        self.opened + self.length
    }
}

/// Increments between sweeps of expired windows.
const PRUNE_INTERVAL: u64 = 1024;

/// Process-local counters.
///
/// Expired windows are dropped every [`PRUNE_INTERVAL`] increments, so the
/// map stays bounded by the keys active within the longest window.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: DashMap<String, Window>,
    increments: AtomicU64,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn increment_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> WindowCount {
        // Must run before an entry guard is taken.
        let seen = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % PRUNE_INTERVAL == 0 {
            self.prune_at(now);
        }

        let length = window_length(window);
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            opened: now,
            length,
            count: 0,
        });

        if now >= entry.reset_at() {
            *entry = Window {
                opened: now,
                length,
                count: 0,
            };
        }
        entry.count += 1;

        WindowCount {
            count: entry.count,
            reset_at: entry.reset_at(),
        }
    }

    /// Drops windows that have expired.
    pub fn prune(&self) {
        self.prune_at(Utc::now());
    }

    fn prune_at(&self, now: DateTime<Utc>) {
        self.windows.retain(|_, window| now < window.reset_at());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, CounterStoreError> {
        Ok(self.increment_at(key, window, Utc::now()))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tier: TrustTier,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// The store could not be consulted and the request was let through.
    pub degraded: bool,
}

impl RateLimitDecision {
    /// `X-RateLimit-*` response headers, plus `Retry-After` when rejected.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
            ("X-RateLimit-Tier", self.tier.as_str().to_string()),
        ];

        if !self.allowed {
            let wait = (self.reset_at - Utc::now()).num_seconds().max(0);
            headers.push(("Retry-After", wait.to_string()));
        }

        headers
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self { config, store }
    }

    /// A limiter with process-local counters.
    #[must_use]
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(MemoryCounterStore::new()))
    }

    /// The counter key for `caller` in `tier`.
    #[must_use]
    pub fn key(&self, caller: &CallerIdentity, tier: TrustTier) -> String {
        let service = &self.config.service;
        let tier_name = tier.as_str();
        let client = caller.client_id.as_deref().unwrap_or("unknown");

        match tier {
            TrustTier::Privileged => caller.user_id.as_deref().map_or_else(
                || format!("rate_limit:{service}:{tier_name}:{client}"),
                |user| format!("rate_limit:{service}:{tier_name}:user:{user}"),
            ),
            TrustTier::FirstParty | TrustTier::Trusted | TrustTier::Public => {
                format!("rate_limit:{service}:{tier_name}:{client}")
            }
            TrustTier::Anonymous => format!(
                "rate_limit:{service}:{tier_name}:ip:{}",
                caller.ip.as_deref().unwrap_or("unknown")
            ),
        }
    }

    /// Counts one request for `caller` and decides whether it may proceed.
    #[tracing::instrument(level = "trace", skip(self, caller))]
    pub async fn check(&self, caller: &CallerIdentity) -> RateLimitDecision {
        let tier = TrustTier::for_caller(caller);
        let quota = self.config.limit(tier);
        let limit = quota.requests;
        let window = quota.window();

        if !self.config.enabled {
            return RateLimitDecision {
                allowed: true,
                tier,
                limit,
                remaining: limit,
                reset_at: Utc::now(),
                degraded: false,
            };
        }

        let key = self.key(caller, tier);
        match self.store.increment(&key, window).await {
            Ok(WindowCount { count, reset_at }) => {
                let allowed = count <= limit;
                if !allowed {
                    tracing::debug!(%key, count, limit, "Rate limit exceeded");
                }

                RateLimitDecision {
                    allowed,
                    tier,
                    limit,
                    remaining: limit.saturating_sub(count),
                    reset_at,
                    degraded: false,
                }
            }
            Err(err) => {
                internal!(level = WARN, "Rate limit store failed, allowing {key}: {err}");
                RateLimitDecision {
                    allowed: true,
                    tier,
                    limit,
                    remaining: limit,
                    reset_at: Utc::now() + window_length(window),
                    degraded: true,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _: &str, _: Duration) -> Result<WindowCount, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn client(id: &str) -> CallerIdentity {
        CallerIdentity {
            client_id: Some(id.to_string()),
            ..CallerIdentity::default()
        }
    }

    #[test]
    fn tier_selection_order() {
        let mut caller = client("app");
        assert_eq!(TrustTier::for_caller(&caller), TrustTier::Public);

        caller.trusted = true;
        assert_eq!(TrustTier::for_caller(&caller), TrustTier::Trusted);

        caller.first_party = true;
        assert_eq!(TrustTier::for_caller(&caller), TrustTier::FirstParty);

        caller.scopes.push("tags:wrangle".to_string());
        assert_eq!(TrustTier::for_caller(&caller), TrustTier::Privileged);

        assert_eq!(
            TrustTier::for_caller(&CallerIdentity::anonymous("10.0.0.1")),
            TrustTier::Anonymous
        );
    }

    #[test]
    fn keys_are_namespaced_by_identity() {
        let limiter = RateLimiter::in_memory(RateLimitConfig::default());

        assert_eq!(
            limiter.key(&client("app"), TrustTier::Public),
            "rate_limit:courier:public:app"
        );

        let admin = CallerIdentity {
            user_id: Some("42".to_string()),
            privileged: true,
            ..client("app")
        };
        assert_eq!(
            limiter.key(&admin, TrustTier::Privileged),
            "rate_limit:courier:privileged:user:42"
        );

        assert_eq!(
            limiter.key(&CallerIdentity::anonymous("10.0.0.1"), TrustTier::Anonymous),
            "rate_limit:courier:anonymous:ip:10.0.0.1"
        );
    }

    #[tokio::test]
    async fn requests_beyond_the_ceiling_are_rejected() {
        let config = RateLimitConfig {
            limits: AHashMap::from_iter([(TrustTier::Anonymous, TierLimit::new(3, 60))]),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::in_memory(config);
        let caller = CallerIdentity::anonymous("10.0.0.1");

        for remaining in (0..3).rev() {
            let decision = limiter.check(&caller).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, remaining);
        }

        let decision = limiter.check(&caller).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.headers().iter().any(|(name, _)| *name == "Retry-After"));

        assert!(limiter.check(&CallerIdentity::anonymous("10.0.0.2")).await.allowed);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = RateLimiter::new(RateLimitConfig::default(), Arc::new(BrokenStore));

        let decision = limiter.check(&client("app")).await;

        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.limit, 1_000);
    }

    #[test]
    fn windows_reset_after_expiry() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(60);
        let start = Utc::now();

        assert_eq!(store.increment_at("k", window, start).count, 1);
        assert_eq!(store.increment_at("k", window, start + TimeDelta::seconds(30)).count, 2);

        let reset = store.increment_at("k", window, start + TimeDelta::seconds(60));
        assert_eq!(reset.count, 1);
        assert_eq!(reset.reset_at, start + TimeDelta::seconds(120));
    }

    #[tokio::test]
    async fn tiers_count_in_their_own_windows() {
        let config = RateLimitConfig {
            limits: AHashMap::from_iter([
                (TrustTier::Anonymous, TierLimit::new(10, 3600)),
                (TrustTier::Public, TierLimit::new(10, 5)),
            ]),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::in_memory(config);
        let before = Utc::now();

        let anonymous = limiter.check(&CallerIdentity::anonymous("10.0.0.1")).await;
        let public = limiter.check(&client("app")).await;

        assert!(anonymous.reset_at >= before + TimeDelta::seconds(3600));
        assert!(public.reset_at < before + TimeDelta::seconds(60));
        assert_eq!(limiter.config.limit(TrustTier::Trusted), TierLimit::new(5_000, 60));
    }

    #[test]
    fn expired_windows_are_pruned() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(60);
        let start = Utc::now() - TimeDelta::minutes(5);

        store.increment_at("stale", window, start);
        store.increment_at("fresh", window, Utc::now());
        store.prune();

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn pruning_runs_as_keys_accumulate() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(60);
        let start = Utc::now();

        for ip in 0..PRUNE_INTERVAL - 1 {
            store.increment_at(&format!("ip:{ip}"), window, start);
        }
        assert_eq!(store.len(), usize::try_from(PRUNE_INTERVAL - 1).unwrap());

        store.increment_at("ip:late", window, start + TimeDelta::minutes(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn headers_report_the_window() {
        let decision = RateLimitDecision {
            allowed: true,
            tier: TrustTier::Trusted,
            limit: 5_000,
            remaining: 4_999,
            reset_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            degraded: false,
        };

        assert_eq!(
            decision.headers(),
            vec![
                ("X-RateLimit-Limit", "5000".to_string()),
                ("X-RateLimit-Remaining", "4999".to_string()),
                ("X-RateLimit-Reset", "1700000000".to_string()),
                ("X-RateLimit-Tier", "trusted".to_string()),
            ]
        );
    }
}
