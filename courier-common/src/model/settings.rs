use core::fmt::{self, Display, Formatter};
use std::collections::BTreeMap;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::{Channel, ChannelConfig, MessageType};

/// The application event a notification originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkUpdated,
    WorkCompleted,
    SeriesUpdated,
    NewWork,
    CommentReceived,
    CommentReplied,
    KudosReceived,
    BookmarkAdded,
    GiftReceived,
    CollectionInvite,
    ModeratorAction,
    SystemAlert,
    AccountSecurity,
    PasswordReset,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkUpdated => "work_updated",
            Self::WorkCompleted => "work_completed",
            Self::SeriesUpdated => "series_updated",
            Self::NewWork => "new_work",
            Self::CommentReceived => "comment_received",
            Self::CommentReplied => "comment_replied",
            Self::KudosReceived => "kudos_received",
            Self::BookmarkAdded => "bookmark_added",
            Self::GiftReceived => "gift_received",
            Self::CollectionInvite => "collection_invite",
            Self::ModeratorAction => "moderator_action",
            Self::SystemAlert => "system_alert",
            Self::AccountSecurity => "account_security",
            Self::PasswordReset => "password_reset",
        }
    }

    /// Critical events are never held back by quiet hours.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            Self::SystemAlert | Self::AccountSecurity | Self::PasswordReset
        )
    }

    /// The message type used when this event is delivered on its own.
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            Self::WorkUpdated => MessageType::SubscriptionUpdate,
            Self::CommentReceived | Self::CommentReplied => MessageType::CommentNotification,
            Self::KudosReceived => MessageType::KudosNotification,
            Self::PasswordReset => MessageType::PasswordReset,
            Self::AccountSecurity => MessageType::AccountSecurity,
            Self::CollectionInvite => MessageType::Invitation,
            Self::SeriesUpdated => MessageType::SeriesUpdate,
            _ => MessageType::SystemAlert,
        }
    }

    /// Group heading used in digests.
    #[must_use]
    pub const fn digest_label(self) -> &'static str {
        match self {
            Self::WorkUpdated => "📖 Work Updates",
            Self::CommentReceived => "💬 New Comments",
            Self::KudosReceived => "❤️ Kudos",
            Self::NewWork => "✨ New Works",
            Self::SeriesUpdated => "📚 Series Updates",
            Self::CollectionInvite => "📥 Collection Invites",
            Self::SystemAlert => "⚠️ System Alerts",
            _ => "📢 Notifications",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[default]
    Immediate,
    Hourly,
    Daily,
    Weekly,
    Never,
}

impl Frequency {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Never => "never",
        }
    }

    #[must_use]
    pub const fn is_batched(self) -> bool {
        matches!(self, Self::Hourly | Self::Daily | Self::Weekly)
    }
}

impl Display for Frequency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPreference {
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTypeConfig {
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

/// A daily window in the user's local time, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl QuietHours {
    #[must_use]
    pub const fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `local` falls within the window.
    ///
    /// A window whose start is later than its end wraps midnight. Equal
    /// bounds describe an empty window.
    #[must_use]
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start == self.end {
            return false;
        }

        if self.start > self.end {
            local >= self.start || local < self.end
        } else {
            local >= self.start && local < self.end
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(D::Error::custom)
    }
}

mod defaults {
    pub const fn max_per_hour() -> i32 {
        10
    }

    pub const fn min_interval_between_similar() -> u64 {
        3600
    }

    pub fn timezone() -> String {
        String::from("UTC")
    }
}

/// Everything a user has configured about how they want to be notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotificationSettings {
    pub user_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub channels: BTreeMap<Channel, ChannelConfig>,
    #[serde(default)]
    pub message_types: BTreeMap<MessageType, MessageTypeConfig>,
    #[serde(default)]
    pub event_preferences: BTreeMap<EventType, EventPreference>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    /// IANA zone name.
    #[serde(default = "defaults::timezone")]
    pub timezone: String,
    /// Zero or less means unlimited.
    #[serde(default = "defaults::max_per_hour")]
    pub max_per_hour: i32,
    /// Seconds.
    #[serde(default = "defaults::min_interval_between_similar")]
    pub min_interval_between_similar: u64,
    #[serde(default)]
    pub batch_frequency: Frequency,
}

impl UserNotificationSettings {
    /// The settings every user starts with.
    #[must_use]
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        let preference = |channels: &[Channel], frequency, priority| EventPreference {
            enabled: true,
            channels: channels.to_vec(),
            frequency,
            priority,
        };

        let mut event_preferences = BTreeMap::new();
        event_preferences.insert(
            EventType::WorkUpdated,
            preference(
                &[Channel::Email, Channel::InApp],
                Frequency::Immediate,
                Priority::Medium,
            ),
        );
        event_preferences.insert(
            EventType::CommentReceived,
            preference(
                &[Channel::Email, Channel::InApp],
                Frequency::Immediate,
                Priority::High,
            ),
        );
        event_preferences.insert(
            EventType::KudosReceived,
            preference(&[Channel::InApp], Frequency::Daily, Priority::Low),
        );
        event_preferences.insert(
            EventType::SystemAlert,
            preference(
                &[Channel::Email, Channel::InApp],
                Frequency::Immediate,
                Priority::High,
            ),
        );

        let mut channels = BTreeMap::new();
        channels.insert(
            Channel::Email,
            ChannelConfig {
                enabled: true,
                ..ChannelConfig::default()
            },
        );
        channels.insert(
            Channel::InApp,
            ChannelConfig {
                enabled: true,
                ..ChannelConfig::default()
            },
        );

        Self {
            user_id: user_id.into(),
            enabled: true,
            channels,
            message_types: BTreeMap::new(),
            event_preferences,
            quiet_hours: None,
            timezone: defaults::timezone(),
            max_per_hour: defaults::max_per_hour(),
            min_interval_between_similar: defaults::min_interval_between_similar(),
            batch_frequency: Frequency::Daily,
        }
    }

    #[must_use]
    pub fn channel(&self, channel: Channel) -> Option<&ChannelConfig> {
        self.channels.get(&channel)
    }

    #[must_use]
    pub fn event_preference(&self, event: EventType) -> Option<&EventPreference> {
        self.event_preferences.get(&event)
    }

    /// Enabled channels able to carry a digest.
    #[must_use]
    pub fn digest_channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|(channel, config)| channel.supports_digest() && config.enabled)
            .map(|(channel, _)| *channel)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn quiet_hours_wrapping_midnight() {
        let quiet = QuietHours::new(at(22, 0), at(8, 0));

        assert!(quiet.contains(at(23, 0)));
        assert!(quiet.contains(at(22, 0)));
        assert!(quiet.contains(at(3, 30)));
        assert!(!quiet.contains(at(8, 0)));
        assert!(!quiet.contains(at(9, 0)));
    }

    #[test]
    fn quiet_hours_same_day() {
        let quiet = QuietHours::new(at(1, 0), at(6, 0));

        assert!(quiet.contains(at(3, 0)));
        assert!(quiet.contains(at(1, 0)));
        assert!(!quiet.contains(at(6, 0)));
        assert!(!quiet.contains(at(10, 0)));
    }

    #[test]
    fn quiet_hours_equal_bounds_is_empty() {
        let quiet = QuietHours::new(at(5, 0), at(5, 0));
        assert!(!quiet.contains(at(5, 0)));
        assert!(!quiet.contains(at(12, 0)));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn default_settings() {
        let settings = UserNotificationSettings::defaults_for("u1");

        assert!(settings.enabled);
        assert_eq!(settings.max_per_hour, 10);
        assert_eq!(settings.timezone, "UTC");
        assert_eq!(settings.batch_frequency, Frequency::Daily);

        let kudos = settings
            .event_preference(EventType::KudosReceived)
            .map(|p| (p.frequency, p.priority));
        assert_eq!(kudos, Some((Frequency::Daily, Priority::Low)));
        assert_eq!(settings.digest_channels(), vec![Channel::Email, Channel::InApp]);
    }

    #[test]
    fn critical_events() {
        assert!(EventType::PasswordReset.is_critical());
        assert!(EventType::AccountSecurity.is_critical());
        assert!(EventType::SystemAlert.is_critical());
        assert!(!EventType::CommentReceived.is_critical());
    }

    #[test]
    fn quiet_hours_serialise_as_hhmm() {
        let quiet = QuietHours::new(at(22, 0), at(8, 30));
        let json = serde_json::to_string(&quiet).unwrap();
        assert_eq!(json, r#"{"start":"22:00","end":"08:30"}"#);
    }
}
