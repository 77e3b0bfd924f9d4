use core::fmt::{self, Display, Formatter};
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{Channel, MessageStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered)
    }
}

/// How far an email transaction progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPhase {
    Connecting,
    Authenticating,
    Sending,
}

impl SendPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Sending => "sending",
        }
    }
}

impl Display for SendPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure a delivery attempt can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    InvalidAddress,
    TemplateError,
    NetworkError,
    Timeout,
    RateLimited,
    UnknownError,

    ServiceUnavailable,
    MailboxBusy,
    TemporaryFailure,
    InsufficientStorage,

    SyntaxError,
    ParameterError,
    CommandNotImplemented,
    BadSequence,
    ParameterNotImplemented,
    MailboxUnavailable,
    UserNotLocal,
    StorageExceeded,
    MailboxNameInvalid,
    TransactionFailed,
    PermanentFailure,

    AuthenticationFailed,
    ReputationIssue,
    DnsError,
    ContentFiltered,
    MailboxFull,
    RecipientUnknown,
    ServerError,
    ServerMaintenance,
    TlsError,
    FormatError,
    MessageTooLarge,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigurationError => "configuration_error",
            Self::InvalidAddress => "invalid_address",
            Self::TemplateError => "template_error",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::UnknownError => "unknown_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::MailboxBusy => "mailbox_busy",
            Self::TemporaryFailure => "temporary_failure",
            Self::InsufficientStorage => "insufficient_storage",
            Self::SyntaxError => "syntax_error",
            Self::ParameterError => "parameter_error",
            Self::CommandNotImplemented => "command_not_implemented",
            Self::BadSequence => "bad_sequence",
            Self::ParameterNotImplemented => "parameter_not_implemented",
            Self::MailboxUnavailable => "mailbox_unavailable",
            Self::UserNotLocal => "user_not_local",
            Self::StorageExceeded => "storage_exceeded",
            Self::MailboxNameInvalid => "mailbox_name_invalid",
            Self::TransactionFailed => "transaction_failed",
            Self::PermanentFailure => "permanent_failure",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ReputationIssue => "reputation_issue",
            Self::DnsError => "dns_error",
            Self::ContentFiltered => "content_filtered",
            Self::MailboxFull => "mailbox_full",
            Self::RecipientUnknown => "recipient_unknown",
            Self::ServerError => "server_error",
            Self::ServerMaintenance => "server_maintenance",
            Self::TlsError => "tls_error",
            Self::FormatError => "format_error",
            Self::MessageTooLarge => "message_too_large",
        }
    }

    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::AuthenticationFailed => ErrorCategory::Authentication,
            Self::RateLimited => ErrorCategory::RateLimiting,
            Self::ReputationIssue => ErrorCategory::Reputation,
            Self::DnsError | Self::NetworkError | Self::Timeout => ErrorCategory::Connectivity,
            Self::ContentFiltered => ErrorCategory::Content,
            Self::MailboxFull
            | Self::MailboxUnavailable
            | Self::RecipientUnknown
            | Self::UserNotLocal
            | Self::MailboxNameInvalid
            | Self::InvalidAddress => ErrorCategory::Recipient,
            Self::ServerError
            | Self::ServerMaintenance
            | Self::ServiceUnavailable
            | Self::MailboxBusy
            | Self::InsufficientStorage => ErrorCategory::Server,
            Self::TlsError => ErrorCategory::Security,
            Self::FormatError
            | Self::SyntaxError
            | Self::MessageTooLarge
            | Self::ParameterError
            | Self::CommandNotImplemented
            | Self::BadSequence
            | Self::ParameterNotImplemented => ErrorCategory::Format,
            Self::TemporaryFailure => ErrorCategory::Temporary,
            Self::PermanentFailure | Self::TransactionFailed | Self::StorageExceeded => {
                ErrorCategory::Permanent
            }
            Self::ConfigurationError | Self::TemplateError => ErrorCategory::Configuration,
            Self::UnknownError => ErrorCategory::Unknown,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse grouping of [`ErrorKind`]s for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    RateLimiting,
    Reputation,
    Connectivity,
    Content,
    Recipient,
    Server,
    Security,
    Format,
    Temporary,
    Permanent,
    Configuration,
    Unknown,
}

/// Structured failure recorded against an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub enhanced_code: Option<String>,
    pub message: String,
    pub retryable: bool,
}

impl AttemptError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            code: None,
            enhanced_code: None,
            message: message.into(),
            retryable,
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message, false)
    }

    #[must_use]
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidAddress, message, false)
    }

    #[must_use]
    pub fn template(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateError, message, false)
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message, true)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message, true)
    }

    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message, true)
    }
}

impl Display for AttemptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// One try to deliver one message to one user over one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Ulid,
    pub message_id: Ulid,
    pub user_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<AttemptError>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    #[must_use]
    pub fn pending(message_id: Ulid, user_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            id: Ulid::new(),
            message_id,
            user_id: user_id.into(),
            channel,
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
            error: None,
            metadata: BTreeMap::new(),
            retry_count: 0,
            next_retry_at: None,
        }
    }

    /// A fresh pending attempt that retries this one.
    #[must_use]
    pub fn retry(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..Self::pending(self.message_id, self.user_id.clone(), self.channel)
        }
    }

    /// Move to a terminal status. A terminal attempt is never changed again.
    pub fn complete(&mut self, status: DeliveryStatus, error: Option<AttemptError>) {
        if self.status.is_terminal() {
            return;
        }

        self.status = status;
        self.error = error;
        self.updated_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: AttemptError) {
        self.complete(DeliveryStatus::Failed, Some(error));
    }

    #[must_use]
    pub fn is_retryable_failure(&self) -> bool {
        self.status == DeliveryStatus::Failed && self.error.as_ref().is_some_and(|e| e.retryable)
    }
}

/// Counts for a single channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub total: usize,
    pub pending: usize,
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl ChannelSummary {
    const fn record(&mut self, status: DeliveryStatus) {
        self.total += 1;
        match status {
            DeliveryStatus::Pending => self.pending += 1,
            DeliveryStatus::Sent => self.sent += 1,
            DeliveryStatus::Delivered => self.delivered += 1,
            DeliveryStatus::Failed => self.failed += 1,
        }
    }

    #[must_use]
    pub const fn succeeded(&self) -> usize {
        self.sent + self.delivered
    }
}

/// Per-message delivery outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub overall: ChannelSummary,
    pub by_channel: BTreeMap<Channel, ChannelSummary>,
}

impl DeliverySummary {
    #[must_use]
    pub fn from_attempts<'a>(attempts: impl IntoIterator<Item = &'a DeliveryAttempt>) -> Self {
        let mut summary = Self::default();

        for attempt in attempts {
            summary.overall.record(attempt.status);
            summary
                .by_channel
                .entry(attempt.channel)
                .or_default()
                .record(attempt.status);
        }

        summary
    }

    /// `Sent` if every attempt succeeded, `Failed` if none did.
    #[must_use]
    pub const fn message_status(&self) -> MessageStatus {
        let succeeded = self.overall.succeeded();

        if self.overall.total > 0 && succeeded == self.overall.total {
            MessageStatus::Sent
        } else if succeeded == 0 {
            MessageStatus::Failed
        } else {
            MessageStatus::PartiallyFailed
        }
    }

    /// The newest attempt for every (user, channel) pair.
    #[must_use]
    pub fn latest(attempts: &[DeliveryAttempt]) -> Vec<&DeliveryAttempt> {
        let mut latest: BTreeMap<(&str, Channel), &DeliveryAttempt> = BTreeMap::new();

        for attempt in attempts {
            latest
                .entry((attempt.user_id.as_str(), attempt.channel))
                .and_modify(|current| {
                    if (attempt.retry_count, attempt.id) > (current.retry_count, current.id) {
                        *current = attempt;
                    }
                })
                .or_insert(attempt);
        }

        latest.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn attempt(user: &str, channel: Channel, status: DeliveryStatus) -> DeliveryAttempt {
        let mut attempt = DeliveryAttempt::pending(Ulid::new(), user, channel);
        attempt.complete(status, None);
        attempt
    }

    #[test]
    fn terminal_attempts_are_not_resurrected() {
        let mut attempt = DeliveryAttempt::pending(Ulid::new(), "u1", Channel::Email);
        attempt.fail(AttemptError::network("connection reset"));
        attempt.complete(DeliveryStatus::Delivered, None);

        assert_eq!(attempt.status, DeliveryStatus::Failed);
        assert!(attempt.is_retryable_failure());
    }

    #[test]
    fn retry_creates_new_attempt() {
        let mut first = DeliveryAttempt::pending(Ulid::new(), "u1", Channel::Email);
        first.fail(AttemptError::timeout("deadline"));
        let second = first.retry();

        assert_ne!(first.id, second.id);
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.status, DeliveryStatus::Pending);
        assert_eq!(second.message_id, first.message_id);
    }

    #[test]
    fn summary_counts_by_channel() {
        let attempts = vec![
            attempt("a", Channel::Email, DeliveryStatus::Delivered),
            attempt("b", Channel::Email, DeliveryStatus::Failed),
            attempt("a", Channel::InApp, DeliveryStatus::Sent),
        ];

        let summary = DeliverySummary::from_attempts(&attempts);

        assert_eq!(summary.overall.total, 3);
        assert_eq!(summary.overall.failed, 1);
        assert_eq!(summary.by_channel[&Channel::Email].delivered, 1);
        assert_eq!(summary.by_channel[&Channel::InApp].sent, 1);
        assert_eq!(summary.message_status(), MessageStatus::PartiallyFailed);
    }

    #[test]
    fn message_status_extremes() {
        let ok = [attempt("a", Channel::Email, DeliveryStatus::Sent)];
        let bad = [attempt("a", Channel::Email, DeliveryStatus::Failed)];

        assert_eq!(
            DeliverySummary::from_attempts(&ok).message_status(),
            MessageStatus::Sent
        );
        assert_eq!(
            DeliverySummary::from_attempts(&bad).message_status(),
            MessageStatus::Failed
        );
        assert_eq!(
            DeliverySummary::default().message_status(),
            MessageStatus::Failed
        );
    }

    #[test]
    fn latest_prefers_highest_retry() {
        let mut first = attempt("a", Channel::Email, DeliveryStatus::Failed);
        first.error = Some(AttemptError::network("reset"));
        let mut second = first.retry();
        second.complete(DeliveryStatus::Delivered, None);

        let attempts = vec![second.clone(), first];
        let latest = DeliverySummary::latest(&attempts);

        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, second.id);
    }

    #[test]
    fn error_kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ConfigurationError).unwrap_or_default();
        assert_eq!(json, "\"configuration_error\"");
        assert_eq!(ErrorKind::DnsError.category(), ErrorCategory::Connectivity);
    }
}
