use chrono::Weekday;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{EventType, Priority};
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Allow,
    Suppress,
    Delay,
    Batch,
}

impl RuleAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Suppress => "suppress",
            Self::Delay => "delay",
            Self::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorCondition {
    /// When non-empty the actor must be listed.
    #[serde(default)]
    pub actors: Vec<String>,
    #[serde(default)]
    pub excluded_actors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCondition {
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub excluded_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCondition {
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    /// Local hours, 0-23.
    #[serde(default)]
    pub hours: Vec<u32>,
}

/// A user-owned condition/action pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: Ulid,
    pub user_id: String,
    pub name: String,
    /// Lower runs first.
    #[serde(default)]
    pub order: u32,
    #[serde(default = "active")]
    pub active: bool,
    pub events: Vec<EventType>,
    #[serde(default)]
    pub source_types: Vec<String>,
    #[serde(default)]
    pub actor: Option<ActorCondition>,
    #[serde(default)]
    pub content: Option<ContentCondition>,
    #[serde(default)]
    pub time: Option<TimeCondition>,
    pub action: RuleAction,
    #[serde(default)]
    pub priority_override: Option<Priority>,
    #[serde(default)]
    pub delay_minutes: Option<u32>,
}

const fn active() -> bool {
    true
}

impl NotificationRule {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        events: Vec<EventType>,
        action: RuleAction,
    ) -> Self {
        Self {
            id: Ulid::new(),
            user_id: user_id.into(),
            name: name.into(),
            order: 0,
            active: true,
            events,
            source_types: Vec::new(),
            actor: None,
            content: None,
            time: None,
            action,
            priority_override: None,
            delay_minutes: None,
        }
    }

    #[must_use]
    pub const fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, minutes: u32) -> Self {
        self.delay_minutes = Some(minutes);
        self
    }

    /// The delay this rule applies, when it is a delay rule with a positive
    /// `delay_minutes`.
    #[must_use]
    pub fn delay(&self) -> Option<u32> {
        self.delay_minutes
            .filter(|minutes| self.action == RuleAction::Delay && *minutes > 0)
    }

    /// # Errors
    ///
    /// Returns `MissingDelay` for a delay rule without a positive delay.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.action == RuleAction::Delay && self.delay().is_none() {
            return Err(ValidationError::MissingDelay(self.name.clone()));
        }

        Ok(())
    }
}
