//! Data model shared by every courier crate.

mod attempt;
mod caller;
mod channel;
mod message;
mod notification;
mod rule;
mod settings;

pub use attempt::{
    AttemptError, ChannelSummary, DeliveryAttempt, DeliveryStatus, DeliverySummary, ErrorCategory,
    ErrorKind, SendPhase,
};
pub use caller::CallerIdentity;
pub use channel::{Channel, ChannelConfig};
pub use message::{Message, MessageContent, MessageStatus, MessageType, Recipient};
pub use notification::{DigestStatus, NotificationDigest, NotificationItem};
pub use rule::{
    ActorCondition, ContentCondition, NotificationRule, RuleAction, TimeCondition,
};
pub use settings::{
    EventPreference, EventType, Frequency, MessageTypeConfig, Priority, QuietHours,
    UserNotificationSettings,
};
