//! Message templates.
//!
//! Every message type renders three parts: a subject, a plain-text body and an
//! optional HTML body. A part without a type-specific template falls back to
//! the `generic` one. Templates are `minijinja`; `.html` parts are
//! auto-escaped.

use std::collections::BTreeMap;

use ahash::AHashMap;
use courier_common::{
    internal,
    model::{MessageContent, MessageType},
};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const GENERIC: &str = "generic";
const DIGEST_HTML: &str = "digest/body.html";

const BUILTIN: &[(&str, &str)] = &[
    ("generic/subject.txt", "{{ subject }}"),
    (
        "generic/body.txt",
        "{{ plain_text }}{% if action_url %}\n\n{{ action_url }}{% endif %}\n",
    ),
    (
        "generic/body.html",
        r#"{% if html %}<!DOCTYPE html>
<html>
<body>
{{ html|safe }}
{% if action_url %}<p><a href="{{ action_url }}">View on the site</a></p>{% endif %}
</body>
</html>{% endif %}"#,
    ),
    (
        "subscription_update/body.txt",
        "{{ plain_text }}\n{% if work_title %}\nWork: {{ work_title }}{% endif %}{% if chapter_title %}\nChapter: {{ chapter_title }}{% endif %}{% if action_url %}\n\nRead it here: {{ action_url }}{% endif %}\n",
    ),
    (
        "comment_notification/body.txt",
        "{{ plain_text }}{% if comment_preview %}\n\n> {{ comment_preview }}{% endif %}{% if action_url %}\n\nReply: {{ action_url }}{% endif %}\n",
    ),
    (
        "kudos_notification/body.txt",
        "{{ plain_text }}{% if action_url %}\n\nSee your work: {{ action_url }}{% endif %}\n",
    ),
    (
        "password_reset/body.txt",
        "{{ plain_text }}{% if action_url %}\n\nReset your password: {{ action_url }}{% endif %}\n\nThis link expires in {{ expiry_hours }} hours. If you did not request a reset, you can ignore this message.\n",
    ),
    (
        "system_alert/body.txt",
        "{{ plain_text }}{% if action_url %}\n\nMore information: {{ action_url }}{% endif %}\n",
    ),
    (
        DIGEST_HTML,
        r#"<h1>{{ brand }}</h1>
<p>You have {{ total }} new notification{% if total != 1 %}s{% endif %}</p>
{% for group in groups %}<h2>{{ group.label }} ({{ group.items|length }})</h2>
<ul>
{% for item in group.items %}<li>{% if item.action_url %}<a href="{{ item.action_url }}">{{ item.title }}</a>{% else %}{{ item.title }}{% endif %}{% if item.description %}<br>{{ item.description }}{% endif %}</li>
{% endfor %}</ul>
{% endfor %}<p><a href="{{ settings_url }}">Manage notification settings</a></p>"#,
    ),
];

/// One of the three rendered parts of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatePart {
    Subject,
    Text,
    Html,
}

impl TemplatePart {
    const fn file_name(self) -> &'static str {
        match self {
            Self::Subject => "subject.txt",
            Self::Text => "body.txt",
            Self::Html => "body.html",
        }
    }
}

/// A template supplied through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTemplate {
    /// `None` replaces the generic fallback.
    #[serde(default)]
    pub message_type: Option<MessageType>,
    pub part: TemplatePart,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub templates: Vec<CustomTemplate>,
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Invalid template {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Failed to render {name}: {source}")]
    Render {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("{0} rendered an empty subject")]
    EmptySubject(MessageType),
}

impl TemplateError {
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }
}

/// The output of a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub text: String,
    /// `None` when the HTML part rendered to nothing.
    pub html: Option<String>,
}

pub struct TemplateRegistry {
    env: Environment<'static>,
    defaults: AHashMap<MessageType, BTreeMap<String, Value>>,
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    /// A registry holding only the built-in templates.
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in BUILTIN {
            if let Err(err) = env.add_template(name, source) {
                internal!(level = ERROR, "Built-in template {name} is invalid: {err}");
            }
        }

        let mut defaults = AHashMap::new();
        defaults.insert(
            MessageType::PasswordReset,
            BTreeMap::from([("expiry_hours".to_string(), Value::from(24))]),
        );

        Self { env, defaults }
    }

    /// The built-ins plus everything in `config`.
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Invalid` for the first template that fails to
    /// compile.
    pub fn from_config(config: &TemplateConfig) -> Result<Self, TemplateError> {
        let mut registry = Self::new();
        for template in &config.templates {
            registry.register(template.message_type, template.part, template.source.clone())?;
        }
        Ok(registry)
    }

    /// Registers (or replaces) one part of a message type's template.
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Invalid` if the source does not compile.
    pub fn register(
        &mut self,
        kind: Option<MessageType>,
        part: TemplatePart,
        source: String,
    ) -> Result<(), TemplateError> {
        let name = template_name(kind.map_or(GENERIC, MessageType::as_str), part);

        self.env
            .add_template_owned(name.clone(), source)
            .map_err(|source| TemplateError::Invalid { name, source })
    }

    /// Default variables for a message type, overridden by anything the
    /// content supplies.
    pub fn set_default(&mut self, kind: MessageType, key: impl Into<String>, value: Value) {
        self.defaults.entry(kind).or_default().insert(key.into(), value);
    }

    /// Renders every part of `content` for a message of `kind`.
    ///
    /// Variables resolve, lowest precedence first, from the type's defaults,
    /// the content's own variables, and finally `subject`, `plain_text`,
    /// `html` and `action_url` from the content itself.
    ///
    /// # Errors
    ///
    /// Returns an error if a template fails to render or the subject renders
    /// empty.
    pub fn render(
        &self,
        kind: MessageType,
        content: &MessageContent,
    ) -> Result<RenderedContent, TemplateError> {
        let context = self.context(kind, content);

        let subject = self.render_part(kind, TemplatePart::Subject, &context)?;
        let subject = subject.lines().map(str::trim).collect::<Vec<_>>().join(" ");
        if subject.trim().is_empty() {
            return Err(TemplateError::EmptySubject(kind));
        }

        let text = self.render_part(kind, TemplatePart::Text, &context)?;
        let html = self.render_part(kind, TemplatePart::Html, &context)?;

        Ok(RenderedContent {
            subject: subject.trim().to_string(),
            text,
            html: Some(html).filter(|html| !html.trim().is_empty()),
        })
    }

    /// Renders the HTML body of a digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest template fails to render.
    pub fn render_digest_html(&self, context: &impl Serialize) -> Result<String, TemplateError> {
        self.render_named(DIGEST_HTML, context)
    }

    fn context(&self, kind: MessageType, content: &MessageContent) -> BTreeMap<String, Value> {
        let mut context = self.defaults.get(&kind).cloned().unwrap_or_default();
        context.extend(
            content
                .variables
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        context.insert("subject".to_string(), Value::from(content.subject.as_str()));
        context.insert(
            "plain_text".to_string(),
            Value::from(content.plain_text.as_str()),
        );
        context.insert(
            "html".to_string(),
            content.html.as_deref().map_or(Value::Null, Value::from),
        );
        context.insert(
            "action_url".to_string(),
            content.action_url.as_deref().map_or(Value::Null, Value::from),
        );

        context
    }

    fn render_part(
        &self,
        kind: MessageType,
        part: TemplatePart,
        context: &BTreeMap<String, Value>,
    ) -> Result<String, TemplateError> {
        let specific = template_name(kind.as_str(), part);
        let name = if self.env.get_template(&specific).is_ok() {
            specific
        } else {
            template_name(GENERIC, part)
        };

        self.render_named(&name, context)
    }

    fn render_named(&self, name: &str, context: &impl Serialize) -> Result<String, TemplateError> {
        self.env
            .get_template(name)
            .and_then(|template| template.render(context))
            .map_err(|source| TemplateError::Render {
                name: name.to_string(),
                source,
            })
    }
}

fn template_name(key: &str, part: TemplatePart) -> String {
    format!("{key}/{}", part.file_name())
}
