//! Suppression and enrichment applied to a notification before routing.

use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use courier_common::{
    internal,
    model::{EventType, NotificationItem, UserNotificationSettings},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::timezone::local_time;

const PREVIEW_LIMIT: usize = 100;
const PREVIEW_KEEP: usize = 97;

mod defaults {
    pub const fn history_capacity() -> usize {
        10_000
    }

    pub const fn retention_secs() -> u64 {
        86_400
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Passed notifications remembered across all users.
    #[serde(default = "defaults::history_capacity")]
    pub history_capacity: usize,
    /// History older than this is pruned, and bounds how far back the
    /// duplicate check can look.
    #[serde(default = "defaults::retention_secs")]
    pub retention_secs: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            history_capacity: defaults::history_capacity(),
            retention_secs: defaults::retention_secs(),
        }
    }
}

/// Why an item was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    QuietHours,
    RateLimited,
    Duplicate,
}

impl Suppression {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QuietHours => "quiet hours",
            Self::RateLimited => "hourly limit reached",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for Suppression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Notify(NotificationItem),
    Suppress(Suppression),
}

impl FilterDecision {
    #[must_use]
    pub const fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppress(_))
    }

    /// The enhanced item, if it passed.
    #[must_use]
    pub fn into_item(self) -> Option<NotificationItem> {
        match self {
            Self::Notify(item) => Some(item),
            Self::Suppress(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Passed {
    user_id: String,
    source_id: String,
    event: EventType,
    at: DateTime<Utc>,
}

/// Quiet hours, an hourly cap and duplicate detection over an in-process
/// history of recently passed notifications.
#[derive(Debug)]
pub struct SmartFilter {
    config: FilterConfig,
    history: Mutex<VecDeque<Passed>>,
}

impl Default for SmartFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

impl SmartFilter {
    #[must_use]
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn should_notify(
        &self,
        settings: &UserNotificationSettings,
        item: &NotificationItem,
    ) -> FilterDecision {
        self.should_notify_at(settings, item, Utc::now())
    }

    /// Checks run in order and the first suppression wins. A passing item is
    /// remembered before it is enhanced.
    pub fn should_notify_at(
        &self,
        settings: &UserNotificationSettings,
        item: &NotificationItem,
        now: DateTime<Utc>,
    ) -> FilterDecision {
        if in_quiet_hours(settings, item.event, now) {
            internal!(
                level = DEBUG,
                "Notification {} for {} held back: quiet hours",
                item.id,
                item.user_id
            );
            return FilterDecision::Suppress(Suppression::QuietHours);
        }

        {
            let mut history = self.history.lock();
            self.prune(&mut history, now);

            if settings.max_per_hour > 0 {
                let hour_ago = now - TimeDelta::hours(1);
                let recent = history
                    .iter()
                    .filter(|passed| passed.user_id == item.user_id && passed.at > hour_ago)
                    .count();

                if recent >= usize::try_from(settings.max_per_hour).unwrap_or(usize::MAX) {
                    internal!(
                        level = DEBUG,
                        "Notification {} for {} held back: {recent} in the last hour",
                        item.id,
                        item.user_id
                    );
                    return FilterDecision::Suppress(Suppression::RateLimited);
                }
            }

            let interval = seconds(settings.min_interval_between_similar);
            let duplicate = history.iter().any(|passed| {
                passed.user_id == item.user_id
                    && passed.source_id == item.source_id
                    && passed.event == item.event
                    && now.signed_duration_since(passed.at) < interval
            });

            if duplicate {
                internal!(
                    level = DEBUG,
                    "Notification {} for {} held back: duplicate of {} {}",
                    item.id,
                    item.user_id,
                    item.event,
                    item.source_id
                );
                return FilterDecision::Suppress(Suppression::Duplicate);
            }

            if history.len() >= self.config.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(Passed {
                user_id: item.user_id.clone(),
                source_id: item.source_id.clone(),
                event: item.event,
                at: now,
            });
        }

        FilterDecision::Notify(enhance(item))
    }

    fn prune(&self, history: &mut VecDeque<Passed>, now: DateTime<Utc>) {
        let retention = seconds(self.config.retention_secs);
        while history
            .front()
            .is_some_and(|oldest| now.signed_duration_since(oldest.at) > retention)
        {
            history.pop_front();
        }
    }

    /// Entries currently remembered.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::from_std(Duration::from_secs(secs)).unwrap_or(TimeDelta::MAX)
}

fn in_quiet_hours(settings: &UserNotificationSettings, event: EventType, now: DateTime<Utc>) -> bool {
    if event.is_critical() {
        return false;
    }

    settings
        .quiet_hours
        .is_some_and(|quiet| quiet.contains(local_time(&settings.timezone, now).time()))
}

fn enhance(item: &NotificationItem) -> NotificationItem {
    let mut enhanced = item.clone();
    if let Some(title) = enhanced_title(item) {
        enhanced.title = title;
    }
    if let Some(description) = enhanced_description(item) {
        enhanced.description = description;
    }
    enhanced
}

fn enhanced_title(item: &NotificationItem) -> Option<String> {
    let work = item.extra_str("work_title")?;

    match item.event {
        EventType::WorkUpdated => Some(format!("📖 New chapter: {work}")),
        EventType::CommentReceived => Some(format!("💬 New comment on {work}")),
        EventType::KudosReceived => Some(format!("❤️ Kudos on {work}")),
        _ => None,
    }
}

fn enhanced_description(item: &NotificationItem) -> Option<String> {
    match item.event {
        EventType::WorkUpdated => {
            let chapter = item.extra_str("chapter_title")?;
            let author = item.extra_str("author_name")?;
            Some(format!("{author} posted a new chapter: \"{chapter}\""))
        }
        EventType::CommentReceived => {
            let preview = item.extra_str("comment_preview")?;
            let actor = item.actor_name.as_deref().unwrap_or("Someone");
            Some(format!("{actor}: \"{}\"", truncate_preview(preview)))
        }
        _ => None,
    }
}

fn truncate_preview(preview: &str) -> String {
    if preview.chars().count() > PREVIEW_LIMIT {
        let kept: String = preview.chars().take(PREVIEW_KEEP).collect();
        format!("{kept}...")
    } else {
        preview.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::{NaiveTime, TimeZone};
    use courier_common::model::QuietHours;
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn quiet(start: u32, end: u32) -> UserNotificationSettings {
        let mut settings = UserNotificationSettings::defaults_for("reader");
        settings.quiet_hours = Some(QuietHours::new(
            NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
        ));
        settings
    }

    fn item(event: EventType, source: &str) -> NotificationItem {
        NotificationItem::new("reader", event, "work", source, "Something happened")
    }

    #[test]
    fn quiet_hours_wrapping_midnight() {
        let filter = SmartFilter::default();
        let settings = quiet(22, 8);

        assert_eq!(
            filter.should_notify_at(&settings, &item(EventType::WorkUpdated, "a"), at(23, 0)),
            FilterDecision::Suppress(Suppression::QuietHours)
        );
        assert!(
            !filter
                .should_notify_at(&settings, &item(EventType::WorkUpdated, "b"), at(9, 0))
                .is_suppressed()
        );
    }

    #[test]
    fn quiet_hours_same_day() {
        let filter = SmartFilter::default();
        let settings = quiet(1, 6);

        assert!(
            filter
                .should_notify_at(&settings, &item(EventType::WorkUpdated, "a"), at(3, 0))
                .is_suppressed()
        );
        assert!(
            !filter
                .should_notify_at(&settings, &item(EventType::WorkUpdated, "b"), at(10, 0))
                .is_suppressed()
        );
    }

    #[test]
    fn quiet_hours_follow_the_user_timezone() {
        let filter = SmartFilter::default();
        let mut settings = quiet(22, 8);
        // 12:00 UTC is 07:00 in New York during standard time.
        settings.timezone = "America/New_York".to_string();
        let noon = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();

        assert!(
            filter
                .should_notify_at(&settings, &item(EventType::WorkUpdated, "a"), noon)
                .is_suppressed()
        );
    }

    #[test]
    fn critical_events_ignore_quiet_hours() {
        let filter = SmartFilter::default();
        let settings = quiet(22, 8);

        assert!(
            !filter
                .should_notify_at(&settings, &item(EventType::PasswordReset, "a"), at(23, 0))
                .is_suppressed()
        );
    }

    #[test]
    fn hourly_cap() {
        let filter = SmartFilter::default();
        let mut settings = UserNotificationSettings::defaults_for("reader");
        settings.max_per_hour = 2;

        for source in ["a", "b"] {
            assert!(
                !filter
                    .should_notify_at(&settings, &item(EventType::NewWork, source), at(10, 0))
                    .is_suppressed()
            );
        }

        assert_eq!(
            filter.should_notify_at(&settings, &item(EventType::NewWork, "c"), at(10, 30)),
            FilterDecision::Suppress(Suppression::RateLimited)
        );
        assert!(
            !filter
                .should_notify_at(&settings, &item(EventType::NewWork, "d"), at(11, 1))
                .is_suppressed()
        );
    }

    #[test]
    fn zero_cap_is_unlimited() {
        let filter = SmartFilter::default();
        let mut settings = UserNotificationSettings::defaults_for("reader");
        settings.max_per_hour = 0;

        for n in 0..50 {
            let source = format!("w{n}");
            assert!(
                !filter
                    .should_notify_at(&settings, &item(EventType::NewWork, &source), at(10, 0))
                    .is_suppressed()
            );
        }
    }

    #[test]
    fn duplicates_within_interval() {
        let filter = SmartFilter::default();
        let settings = UserNotificationSettings::defaults_for("reader");

        assert!(
            !filter
                .should_notify_at(&settings, &item(EventType::KudosReceived, "w1"), at(10, 0))
                .is_suppressed()
        );
        assert_eq!(
            filter.should_notify_at(&settings, &item(EventType::KudosReceived, "w1"), at(10, 59)),
            FilterDecision::Suppress(Suppression::Duplicate)
        );
        // Different event on the same source is not similar.
        assert!(
            !filter
                .should_notify_at(&settings, &item(EventType::CommentReceived, "w1"), at(10, 59))
                .is_suppressed()
        );
        assert!(
            !filter
                .should_notify_at(&settings, &item(EventType::KudosReceived, "w1"), at(11, 0))
                .is_suppressed()
        );
    }

    #[test]
    fn history_is_bounded_and_pruned() {
        let filter = SmartFilter::new(FilterConfig {
            history_capacity: 3,
            retention_secs: 3600,
        });
        let mut settings = UserNotificationSettings::defaults_for("reader");
        settings.max_per_hour = 0;

        for n in 0..5 {
            let source = format!("w{n}");
            let _ = filter.should_notify_at(&settings, &item(EventType::NewWork, &source), at(10, 0));
        }
        assert_eq!(filter.history_len(), 3);

        let _ = filter.should_notify_at(&settings, &item(EventType::NewWork, "late"), at(12, 0));
        assert_eq!(filter.history_len(), 1);
    }

    #[test]
    fn enhances_work_updates() {
        let filter = SmartFilter::default();
        let settings = UserNotificationSettings::defaults_for("reader");
        let update = item(EventType::WorkUpdated, "w1")
            .with_extra("work_title", "The Long Road")
            .with_extra("author_name", "ash")
            .with_extra("chapter_title", "Arrival");

        let enhanced = filter
            .should_notify_at(&settings, &update, at(10, 0))
            .into_item()
            .unwrap();

        assert_eq!(enhanced.title, "📖 New chapter: The Long Road");
        assert_eq!(enhanced.description, "ash posted a new chapter: \"Arrival\"");
        assert_eq!(update.title, "Something happened");
    }

    #[test]
    fn long_comment_previews_are_cut() {
        let comment = item(EventType::CommentReceived, "w1")
            .with_actor("u2", "sam")
            .with_extra("work_title", "Quiet")
            .with_extra("comment_preview", "x".repeat(150));

        let enhanced = enhance(&comment);

        assert_eq!(enhanced.title, "💬 New comment on Quiet");
        assert_eq!(enhanced.description, format!("sam: \"{}...\"", "x".repeat(97)));
    }

    #[test]
    fn short_previews_and_missing_data_pass_through() {
        let comment = item(EventType::CommentReceived, "w1")
            .with_actor("u2", "sam")
            .with_extra("comment_preview", "lovely");
        assert_eq!(enhance(&comment).description, "sam: \"lovely\"");
        assert_eq!(enhance(&comment).title, "Something happened");

        let kudos = item(EventType::KudosReceived, "w1").with_description("kept");
        assert_eq!(enhance(&kudos).description, "kept");
    }
}
