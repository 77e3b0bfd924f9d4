//! Rendering of outbound notification emails.
//!
//! Messages are either a single `text/plain` part or a `multipart/alternative`
//! body carrying a plain text and an HTML part. Both use 8bit transfer encoding.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::client::{ClientError, Result};

/// Encodes a header value as an RFC 2047 encoded-word when it is not ASCII.
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value))
    }
}

fn check_header(name: &str, value: &str) -> Result<()> {
    if name.is_empty() || name.contains([':', ' ', '\r', '\n']) {
        return Err(ClientError::BuilderError(format!(
            "Invalid header name '{name}'"
        )));
    }

    if value.contains(['\r', '\n']) {
        return Err(ClientError::BuilderError(format!(
            "Header {name} contains a line break"
        )));
    }

    Ok(())
}

/// A fully specified message, ready to be rendered for `DATA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeMessage {
    from: String,
    from_name: Option<String>,
    to: String,
    subject: String,
    reply_to: Option<String>,
    return_path: Option<String>,
    date: DateTime<Utc>,
    message_id: String,
    headers: Vec<(String, String)>,
    text: String,
    html: Option<String>,
    boundary: String,
}

impl MimeMessage {
    #[must_use]
    pub fn builder() -> MimeMessageBuilder {
        MimeMessageBuilder::default()
    }

    /// The `Message-ID`, including angle brackets.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub const fn is_multipart(&self) -> bool {
        self.html.is_some()
    }

    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Renders headers and body with CRLF line endings.
    #[must_use]
    pub fn render(&self) -> String {
        let from = self.from_name.as_deref().map_or_else(
            || self.from.clone(),
            |name| format!("{} <{}>", encode_header_value(name), self.from),
        );

        let mut headers: Vec<(&str, String)> = vec![
            ("From", from),
            ("To", self.to.clone()),
            ("Subject", encode_header_value(&self.subject)),
        ];
        if let Some(reply_to) = &self.reply_to {
            headers.push(("Reply-To", reply_to.clone()));
        }
        if let Some(return_path) = &self.return_path {
            headers.push(("Return-Path", format!("<{return_path}>")));
        }
        headers.push(("MIME-Version", "1.0".to_string()));
        headers.push(("Date", self.date.to_rfc2822()));
        headers.push(("Message-ID", self.message_id.clone()));
        headers.extend(
            self.headers
                .iter()
                .map(|(name, value)| (name.as_str(), encode_header_value(value))),
        );

        let mut out = String::with_capacity(
            512 + self.text.len() + self.html.as_ref().map_or(0, String::len),
        );
        for (name, value) in headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value);
            out.push_str("\r\n");
        }

        match &self.html {
            None => {
                out.push_str("Content-Type: text/plain; charset=UTF-8\r\n");
                out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
                push_body(&mut out, &self.text);
            }
            Some(html) => {
                out.push_str(&format!(
                    "Content-Type: multipart/alternative; boundary=\"{}\"\r\n\r\n",
                    self.boundary
                ));
                for (content_type, body) in [("text/plain", &self.text), ("text/html", html)] {
                    out.push_str(&format!("--{}\r\n", self.boundary));
                    out.push_str(&format!("Content-Type: {content_type}; charset=UTF-8\r\n"));
                    out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
                    push_body(&mut out, body);
                }
                out.push_str(&format!("--{}--\r\n", self.boundary));
            }
        }

        out
    }
}

fn push_body(out: &mut String, body: &str) {
    for line in body.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
}

/// Builder for [`MimeMessage`].
#[derive(Debug, Clone, Default)]
pub struct MimeMessageBuilder {
    from: Option<String>,
    from_name: Option<String>,
    to: Option<String>,
    subject: String,
    reply_to: Option<String>,
    return_path: Option<String>,
    date: Option<DateTime<Utc>>,
    host: Option<String>,
    headers: Vec<(String, String)>,
    text: String,
    html: Option<String>,
}

impl MimeMessageBuilder {
    #[must_use]
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    #[must_use]
    pub fn from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into()).filter(|n: &String| !n.is_empty());
        self
    }

    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to = Some(address.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: Option<String>) -> Self {
        self.reply_to = address;
        self
    }

    #[must_use]
    pub fn return_path(mut self, address: Option<String>) -> Self {
        self.return_path = address;
        self
    }

    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Host part of the generated `Message-ID`. Defaults to the sender's domain.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Adds a custom header. Headers keep insertion order.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// An empty HTML body is treated as absent.
    #[must_use]
    pub fn html(mut self, html: Option<String>) -> Self {
        self.html = html.filter(|h| !h.trim().is_empty());
        self
    }

    /// # Errors
    ///
    /// Returns `ClientError::BuilderError` when the sender or recipient is
    /// missing, or a header would break the message framing.
    pub fn build(self) -> Result<MimeMessage> {
        let from = self
            .from
            .ok_or_else(|| ClientError::BuilderError("Missing sender".to_string()))?;
        let to = self
            .to
            .ok_or_else(|| ClientError::BuilderError("Missing recipient".to_string()))?;

        check_header("From", &from)?;
        check_header("To", &to)?;
        check_header("Subject", &self.subject)?;
        for (name, value) in &self.headers {
            check_header(name, value)?;
        }
        for address in self.reply_to.iter().chain(self.return_path.iter()) {
            check_header("Reply-To", address)?;
        }
        if let Some(name) = &self.from_name {
            check_header("From", name)?;
        }

        let host = self.host.unwrap_or_else(|| {
            from.rsplit_once('@')
                .map_or_else(|| "localhost".to_string(), |(_, domain)| domain.to_string())
        });

        Ok(MimeMessage {
            from,
            from_name: self.from_name,
            to,
            subject: self.subject,
            reply_to: self.reply_to,
            return_path: self.return_path,
            date: self.date.unwrap_or_else(Utc::now),
            message_id: format!("<{}@{host}>", Ulid::new()),
            headers: self.headers,
            text: self.text,
            html: self.html,
            boundary: format!("boundary_{}", Ulid::new()),
        })
    }
}
