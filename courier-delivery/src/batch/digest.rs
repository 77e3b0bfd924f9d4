//! Digest layout: ordering, grouping and the rendered parts.
//!
//! The plain-text form is also parsed back by [`parse_digest_text`], which the
//! in-app inbox and tests use to recover the grouping.

use courier_common::model::{EventType, NotificationItem};
use serde::Serialize;

use crate::templates::{TemplateError, TemplateRegistry};

const FOOTER: &str = "---\n\
To manage your notification preferences, visit your account settings.\n\
To unsubscribe from digest emails, change your batch frequency to 'never'.\n";

const ITEM_PREFIX: &str = "  • ";
const URL_PREFIX: &str = "    ";

/// Items of one event type, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestGroup {
    pub event: EventType,
    pub items: Vec<NotificationItem>,
}

impl DigestGroup {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.event.digest_label()
    }
}

/// Highest priority first, then newest first. Stable, so re-ordering an
/// already ordered list is a no-op.
pub fn order_items(items: &mut [NotificationItem]) {
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

/// Groups already ordered items by event type. Groups appear in the order of
/// their first item.
#[must_use]
pub fn group_items(items: &[NotificationItem]) -> Vec<DigestGroup> {
    let mut groups: Vec<DigestGroup> = Vec::new();

    for item in items {
        match groups.iter_mut().find(|group| group.event == item.event) {
            Some(group) => group.items.push(item.clone()),
            None => groups.push(DigestGroup {
                event: item.event,
                items: vec![item.clone()],
            }),
        }
    }

    groups
}

#[must_use]
pub fn subject(brand: &str, count: usize) -> String {
    if count == 1 {
        format!("[{brand}] 1 new notification")
    } else {
        format!("[{brand}] {count} new notifications")
    }
}

#[must_use]
pub fn render_text(groups: &[DigestGroup]) -> String {
    let total: usize = groups.iter().map(|group| group.items.len()).sum();
    let mut text = format!("You have {total} new notifications:\n\n");

    for group in groups {
        text.push_str(&format!("{} ({}):\n", group.label(), group.items.len()));
        for item in &group.items {
            text.push_str(&format!("{ITEM_PREFIX}{}\n", item.title));
            if let Some(url) = item.action_url.as_deref().filter(|url| !url.is_empty()) {
                text.push_str(&format!("{URL_PREFIX}{url}\n"));
            }
        }
        text.push('\n');
    }

    text.push_str(FOOTER);
    text
}

#[derive(Serialize)]
struct ItemView<'a> {
    title: &'a str,
    description: &'a str,
    action_url: Option<&'a str>,
}

#[derive(Serialize)]
struct GroupView<'a> {
    label: &'static str,
    items: Vec<ItemView<'a>>,
}

#[derive(Serialize)]
struct DigestView<'a> {
    brand: &'a str,
    total: usize,
    groups: Vec<GroupView<'a>>,
    settings_url: &'a str,
}

/// # Errors
///
/// Returns an error if the digest template fails to render.
pub fn render_html(
    templates: &TemplateRegistry,
    brand: &str,
    settings_url: &str,
    groups: &[DigestGroup],
) -> Result<String, TemplateError> {
    let view = DigestView {
        brand,
        total: groups.iter().map(|group| group.items.len()).sum(),
        groups: groups
            .iter()
            .map(|group| GroupView {
                label: group.label(),
                items: group
                    .items
                    .iter()
                    .map(|item| ItemView {
                        title: &item.title,
                        description: &item.description,
                        action_url: item.action_url.as_deref(),
                    })
                    .collect(),
            })
            .collect(),
        settings_url,
    };

    templates.render_digest_html(&view)
}

/// A group recovered from digest text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedGroup {
    pub label: String,
    pub count: usize,
    pub titles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDigest {
    pub total: usize,
    pub groups: Vec<ParsedGroup>,
}

fn parse_header(line: &str) -> Option<(String, usize)> {
    let (label, count) = line.strip_suffix("):")?.rsplit_once(" (")?;
    Some((label.to_string(), count.parse().ok()?))
}

/// Parses text produced by [`render_text`]. `None` if the text is not a digest.
#[must_use]
pub fn parse_digest_text(text: &str) -> Option<ParsedDigest> {
    let mut lines = text.lines();
    let total = lines
        .next()?
        .strip_prefix("You have ")?
        .strip_suffix(" new notifications:")?
        .parse()
        .ok()?;

    let mut groups: Vec<ParsedGroup> = Vec::new();
    for line in lines {
        if line == "---" {
            break;
        }

        if let Some(title) = line.strip_prefix(ITEM_PREFIX) {
            groups.last_mut()?.titles.push(title.to_string());
        } else if line.is_empty() || line.starts_with(URL_PREFIX) {
            continue;
        } else {
            let (label, count) = parse_header(line)?;
            groups.push(ParsedGroup {
                label,
                count,
                titles: Vec::new(),
            });
        }
    }

    Some(ParsedDigest { total, groups })
}
