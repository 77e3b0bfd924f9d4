//! Delivery error classification.
//!
//! Maps SMTP reply codes and free-form failure text onto [`ErrorKind`].
//! Retryability is decided by the code class alone: 4xx replies are retryable,
//! 5xx replies are not. Keyword refinement only sharpens the kind of a generic
//! temporary failure so that the retry policy can pick a better delay.

use std::{sync::LazyLock, time::Duration};

use courier_common::model::{AttemptError, ErrorKind};
use courier_smtp::ClientError;
use regex::Regex;

use crate::error::SendError;

/// A reply code where a server reply starts: at the start of a line or after
/// a `: ` separator, followed by a space, a hyphen or the end of the line.
#[allow(clippy::expect_used)]
static REPLY_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:^|:\s+)([245]\d{2})(?:[ -]|$)").expect("reply code pattern is valid")
});

#[allow(clippy::expect_used)]
static ENHANCED_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([245]\.\d{1,3}\.\d{1,3})\b").expect("enhanced code pattern is valid")
});

/// Keyword groups checked, in order, against the reply text of a generic
/// temporary failure. The first group with a hit decides the kind.
const REFINEMENTS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::AuthenticationFailed,
        &["authentication", "auth", "credentials", "login"],
    ),
    (
        ErrorKind::RateLimited,
        &["rate limit", "too many", "throttl", "quota", "sending limit"],
    ),
    (
        ErrorKind::ReputationIssue,
        &["reputation", "blacklist", "blocklist", "spamhaus", "listed"],
    ),
    (
        ErrorKind::DnsError,
        &["dns", "mx record", "domain not found", "host not found"],
    ),
    (
        ErrorKind::NetworkError,
        &["connection", "network", "unreachable", "refused"],
    ),
    (
        ErrorKind::ContentFiltered,
        &["spam", "content", "virus", "policy", "rejected for"],
    ),
    (
        ErrorKind::MailboxFull,
        &["mailbox full", "over quota", "storage", "insufficient space"],
    ),
    (
        ErrorKind::MailboxUnavailable,
        &["mailbox unavailable", "mailbox not found", "mailbox disabled"],
    ),
    (
        ErrorKind::RecipientUnknown,
        &["user unknown", "no such user", "recipient", "does not exist"],
    ),
    (
        ErrorKind::ServerError,
        &["server error", "internal error", "service unavailable"],
    ),
    (
        ErrorKind::ServerMaintenance,
        &["maintenance", "try again later", "temporarily"],
    ),
    (ErrorKind::TlsError, &["tls", "ssl", "certificate", "encryption"]),
    (ErrorKind::FormatError, &["format", "syntax", "malformed", "header"]),
    (ErrorKind::MessageTooLarge, &["too large", "size limit", "message size"]),
];

/// The kind a bare reply code maps to.
#[must_use]
pub const fn kind_for_code(code: u16) -> ErrorKind {
    match code {
        421 => ErrorKind::ServiceUnavailable,
        450 => ErrorKind::MailboxBusy,
        452 => ErrorKind::InsufficientStorage,
        500 => ErrorKind::SyntaxError,
        501 => ErrorKind::ParameterError,
        502 => ErrorKind::CommandNotImplemented,
        503 => ErrorKind::BadSequence,
        504 => ErrorKind::ParameterNotImplemented,
        550 => ErrorKind::MailboxUnavailable,
        551 => ErrorKind::UserNotLocal,
        552 => ErrorKind::StorageExceeded,
        553 => ErrorKind::MailboxNameInvalid,
        554 => ErrorKind::TransactionFailed,
        400..=499 => ErrorKind::TemporaryFailure,
        500..=599 => ErrorKind::PermanentFailure,
        _ => ErrorKind::UnknownError,
    }
}

/// Whether a reply code is worth retrying.
#[must_use]
pub const fn is_retryable_code(code: u16) -> bool {
    code >= 400 && code < 500
}

fn refine(message: &str) -> Option<ErrorKind> {
    let message = message.to_ascii_lowercase();

    REFINEMENTS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| message.contains(keyword)))
        .map(|(kind, _)| *kind)
}

/// Classifies a reply the server actually sent.
#[must_use]
pub fn classify_reply(code: u16, message: &str) -> AttemptError {
    let mut kind = kind_for_code(code);
    if kind == ErrorKind::TemporaryFailure
        && let Some(refined) = refine(message)
    {
        kind = refined;
    }

    AttemptError {
        kind,
        code: Some(code),
        enhanced_code: ENHANCED_CODE
            .captures(message)
            .map(|captures| captures[1].to_string()),
        message: message.to_string(),
        retryable: is_retryable_code(code),
    }
}

/// Classifies free-form failure text by looking for a reply code inside it.
/// Prefer [`classify_reply`] when the code is known.
///
/// Text without a recognisable code is an `unknown_error` and is not retried.
#[must_use]
pub fn classify_text(text: &str) -> AttemptError {
    REPLY_CODE
        .captures(text)
        .and_then(|captures| captures[1].parse::<u16>().ok())
        .map_or_else(
            || AttemptError::new(ErrorKind::UnknownError, text, false),
            |code| classify_reply(code, text),
        )
}

/// Classifies an SMTP client failure.
#[must_use]
pub fn classify_client_error(error: &ClientError) -> AttemptError {
    if let (Some(code), Some(message)) = (error.code(), error.server_message()) {
        return classify_reply(code, message);
    }

    match error {
        ClientError::TlsError(message) => AttemptError::new(ErrorKind::TlsError, message, true),
        ClientError::AuthUnsupported(_) => {
            AttemptError::new(ErrorKind::AuthenticationFailed, error.to_string(), false)
        }
        ClientError::BuilderError(message) => {
            AttemptError::new(ErrorKind::FormatError, message, false)
        }
        error if error.is_transport() => AttemptError::network(error.to_string()),
        error => classify_text(&error.to_string()),
    }
}

/// Classifies a failed send, including step deadlines.
#[must_use]
pub fn classify_send_error(error: &SendError) -> AttemptError {
    match error {
        SendError::Timeout { .. } | SendError::Deadline(_) => {
            AttemptError::timeout(error.to_string())
        }
        SendError::Client(error) => classify_client_error(error),
    }
}

/// How long to wait before retrying a failure of `kind`, and how many retries
/// it gets in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    #[must_use]
    pub const fn for_kind(kind: ErrorKind) -> Self {
        let (delay, max_retries) = match kind {
            ErrorKind::RateLimited => (300, 5),
            ErrorKind::ServerMaintenance | ErrorKind::ServiceUnavailable => (600, 3),
            ErrorKind::MailboxBusy => (180, 4),
            ErrorKind::InsufficientStorage => (180, 2),
            ErrorKind::NetworkError | ErrorKind::DnsError | ErrorKind::Timeout => (120, 3),
            ErrorKind::ServerError => (240, 2),
            ErrorKind::TlsError | ErrorKind::MailboxFull => (60, 2),
            _ => (60, 1),
        };

        Self {
            delay: Duration::from_secs(delay),
            max_retries,
        }
    }

    /// Whether an attempt that has already been retried `retry_count` times
    /// may be retried again.
    #[must_use]
    pub const fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
