//! Checks a message must pass before anything is stored or sent.

use ahash::AHashSet;
use courier_common::{
    error::ValidationError,
    model::{Channel, Message},
};

/// Longest plain text an SMS may carry.
pub const SMS_MAX_LENGTH: usize = 160;

/// # Errors
///
/// Returns the first problem found, in the order subject, plain text,
/// recipients, then per-channel limits. Each user may appear once.
pub fn validate(message: &Message) -> Result<(), ValidationError> {
    if message.content.subject.trim().is_empty() {
        return Err(ValidationError::MissingField("subject"));
    }

    if message.content.plain_text.trim().is_empty() {
        return Err(ValidationError::MissingField("plain_text"));
    }

    if message.recipients.is_empty() {
        return Err(ValidationError::NoRecipients);
    }

    if let Some(index) = message
        .recipients
        .iter()
        .position(|recipient| recipient.user_id.trim().is_empty())
    {
        return Err(ValidationError::MissingUser(index));
    }

    let mut seen = AHashSet::with_capacity(message.recipients.len());
    if let Some(duplicate) = message
        .recipients
        .iter()
        .find(|recipient| !seen.insert(recipient.user_id.as_str()))
    {
        return Err(ValidationError::DuplicateRecipient(duplicate.user_id.clone()));
    }

    let goes_by_sms = message
        .recipients
        .iter()
        .any(|recipient| recipient.candidate_channels(message.kind).contains(&Channel::Sms));
    let length = message.content.plain_text.chars().count();

    if goes_by_sms && length > SMS_MAX_LENGTH {
        return Err(ValidationError::TooLong {
            channel: Channel::Sms.as_str(),
            length,
            max: SMS_MAX_LENGTH,
        });
    }

    Ok(())
}
