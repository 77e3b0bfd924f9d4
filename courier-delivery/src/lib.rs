//! The courier delivery engine.
//!
//! This crate provides functionality to:
//! - Validate messages and fan them out over every recipient and channel
//! - Admit each attempt against user settings and caller rate limits
//! - Deliver over email (SMTP relay) and in-app channels
//! - Classify failures and retry the ones worth retrying
//! - Filter, rule-check and batch application events into digests

pub mod batch;
pub mod channel;
pub mod classifier;
mod error;
pub mod filter;
pub mod notification;
pub mod rate_limiter;
pub mod repository;
pub mod rules;
pub mod service;
pub mod templates;
pub mod timezone;
mod types;

// Re-export batching types
pub use batch::{BatchConfig, BatchProcessor, FlushOutcome, SweepReport};
// Re-export channel types
pub use channel::{
    ChannelProvider, DeliveryReport, DeliveryRequest, EmailProvider, InAppProvider, Inbox,
    ProviderRegistry, SmtpConfig, SmtpCredentials, TlsMode,
};
pub use classifier::RetryPolicy;
// Re-export error types
pub use error::{SendError, ServiceError};
pub use filter::{FilterConfig, FilterDecision, SmartFilter, Suppression};
pub use notification::{NotificationService, SubmitOutcome};
pub use rate_limiter::{RateLimitConfig, RateLimiter, TierLimit, TrustTier};
pub use repository::RepositoryError;
pub use rules::{RuleDecision, RuleEngine};
// Re-export core types
pub use service::{MessageReport, MessageService, SendOutcome, ServiceConfig};
pub use templates::{TemplateConfig, TemplateRegistry};
pub use types::SmtpTimeouts;
