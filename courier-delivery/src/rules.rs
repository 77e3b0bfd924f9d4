//! User-defined notification rules.
//!
//! Rules are evaluated in ascending `order`; the first whose predicate holds
//! decides the action. A predicate is the conjunction of every condition the
//! rule sets, checked in this order: event type, source type, actor, content
//! tags, and finally day and hour in the user's timezone.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use courier_common::{
    internal,
    model::{NotificationItem, NotificationRule, RuleAction, UserNotificationSettings},
};
use ulid::Ulid;

use crate::{
    repository::{RepositoryError, RuleSource},
    timezone::local_time,
};

/// What the rules decided for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecision {
    pub action: RuleAction,
    /// A modified copy of the item, when the rule changed it.
    pub item: Option<NotificationItem>,
    pub delay: Option<Duration>,
    pub reason: String,
    pub rule_id: Option<Ulid>,
}

impl RuleDecision {
    fn no_match() -> Self {
        Self {
            action: RuleAction::Allow,
            item: None,
            delay: None,
            reason: "no matching rules".to_string(),
            rule_id: None,
        }
    }

    fn matched(rule: &NotificationRule, item: &NotificationItem) -> Self {
        let item = rule
            .priority_override
            .filter(|priority| *priority != item.priority)
            .map(|priority| NotificationItem {
                priority,
                ..item.clone()
            });

        Self {
            action: rule.action,
            item,
            delay: rule
                .delay()
                .map(|minutes| Duration::from_secs(u64::from(minutes) * 60)),
            reason: format!("matched rule: {}", rule.name),
            rule_id: Some(rule.id),
        }
    }
}

fn actor_matches(rule: &NotificationRule, item: &NotificationItem) -> bool {
    let Some(condition) = &rule.actor else {
        return true;
    };

    let is_actor = |candidate: &String| {
        item.actor_id.as_ref() == Some(candidate) || item.actor_name.as_ref() == Some(candidate)
    };

    (condition.actors.is_empty() || condition.actors.iter().any(is_actor))
        && !condition.excluded_actors.iter().any(is_actor)
}

fn content_matches(rule: &NotificationRule, item: &NotificationItem) -> bool {
    let Some(condition) = &rule.content else {
        return true;
    };

    let tags = item.tags();
    condition
        .required_tags
        .iter()
        .all(|tag| tags.contains(&tag.as_str()))
        && !condition
            .excluded_tags
            .iter()
            .any(|tag| tags.contains(&tag.as_str()))
}

fn time_matches(rule: &NotificationRule, local: &DateTime<Tz>) -> bool {
    let Some(condition) = &rule.time else {
        return true;
    };

    (condition.days_of_week.is_empty() || condition.days_of_week.contains(&local.weekday()))
        && (condition.hours.is_empty() || condition.hours.contains(&local.hour()))
}

/// Whether every condition of `rule` holds for `item` at `local` time.
#[must_use]
pub fn rule_matches(rule: &NotificationRule, item: &NotificationItem, local: &DateTime<Tz>) -> bool {
    rule.events.contains(&item.event)
        && (rule.source_types.is_empty() || rule.source_types.contains(&item.source_type))
        && actor_matches(rule, item)
        && content_matches(rule, item)
        && time_matches(rule, local)
}

/// Evaluates `rules` against `item` at `now`.
///
/// Inactive rules are skipped. Ties in `order` keep their given order.
#[must_use]
pub fn evaluate_rules(
    rules: &[NotificationRule],
    settings: &UserNotificationSettings,
    item: &NotificationItem,
    now: DateTime<Utc>,
) -> RuleDecision {
    let local = local_time(&settings.timezone, now);

    let mut ordered: Vec<&NotificationRule> = rules.iter().filter(|rule| rule.active).collect();
    ordered.sort_by_key(|rule| rule.order);

    ordered
        .into_iter()
        .find(|rule| rule_matches(rule, item, &local))
        .map_or_else(RuleDecision::no_match, |rule| {
            internal!(
                level = DEBUG,
                "Rule '{}' matched {} for {}: {}",
                rule.name,
                item.id,
                item.user_id,
                rule.action.as_str()
            );
            RuleDecision::matched(rule, item)
        })
}

/// Loads rules from a [`RuleSource`] and evaluates them.
pub struct RuleEngine {
    source: Arc<dyn RuleSource>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine").finish_non_exhaustive()
    }
}

impl RuleEngine {
    #[must_use]
    pub fn new(source: Arc<dyn RuleSource>) -> Self {
        Self { source }
    }

    /// # Errors
    ///
    /// Returns an error if the user's rules cannot be loaded.
    pub async fn evaluate(
        &self,
        settings: &UserNotificationSettings,
        item: &NotificationItem,
    ) -> Result<RuleDecision, RepositoryError> {
        self.evaluate_at(settings, item, Utc::now()).await
    }

    /// # Errors
    ///
    /// Returns an error if the user's rules cannot be loaded.
    pub async fn evaluate_at(
        &self,
        settings: &UserNotificationSettings,
        item: &NotificationItem,
        now: DateTime<Utc>,
    ) -> Result<RuleDecision, RepositoryError> {
        let rules = self.source.active_rules(&item.user_id).await?;
        Ok(evaluate_rules(&rules, settings, item, now))
    }
}
