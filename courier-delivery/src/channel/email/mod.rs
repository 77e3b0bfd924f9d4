//! Email channel.
//!
//! Delivers through a single configured SMTP relay (submission), not by MX
//! lookup. Each attempt is one [`SmtpTransaction`].

mod transaction;

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::{
    error::ConfigError,
    internal,
    model::{AttemptError, Channel, DeliveryAttempt, DeliveryStatus, Message, MessageType},
    tracing,
};
use courier_smtp::{MimeMessage, validate_address};
use serde::{Deserialize, Serialize};

use self::transaction::SmtpTransaction;
use super::{ChannelProvider, ChannelStats, DeliveryReport, DeliveryRequest, StatsCounter};
use crate::{
    classifier::{classify_client_error, classify_send_error},
    error::SendError,
    templates::TemplateRegistry,
    types::SmtpTimeouts,
};

/// How the connection to the relay is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plaintext for the whole session
    #[default]
    None,
    /// TLS from the first byte (usually port 465)
    Implicit,
    /// Upgrade with STARTTLS before authenticating (usually port 587)
    #[serde(rename = "starttls")]
    StartTls,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Relay and sender configuration for the email channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: TlsMode,

    /// Skip certificate validation. Only for testing against local relays.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub credentials: Option<SmtpCredentials>,

    #[serde(default = "default_from_address")]
    pub from_address: String,

    #[serde(default = "default_from_name")]
    pub from_name: String,

    #[serde(default)]
    pub reply_to: Option<String>,

    #[serde(default)]
    pub return_path: Option<String>,

    /// Name announced in EHLO
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Overall deadline for one delivery when the caller gives none
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Value of the `X-Mailer` header
    #[serde(default = "default_mailer")]
    pub mailer: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_port() -> u16 {
    25
}

fn default_from_address() -> String {
    "notifications@localhost".to_string()
}

fn default_from_name() -> String {
    "Courier".to_string()
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

const fn default_send_timeout() -> u64 {
    300
}

fn default_mailer() -> String {
    format!("courier/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: TlsMode::default(),
            accept_invalid_certs: false,
            credentials: None,
            from_address: default_from_address(),
            from_name: default_from_name(),
            reply_to: None,
            return_path: None,
            helo_name: default_helo_name(),
            send_timeout_secs: default_send_timeout(),
            mailer: default_mailer(),
        }
    }
}

impl SmtpConfig {
    /// `host:port` of the relay.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("smtp.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("smtp.port", "must not be zero"));
        }
        validate_address(&self.from_address)
            .map_err(|err| ConfigError::invalid("smtp.from_address", err.to_string()))?;
        for (field, address) in [
            ("smtp.reply_to", &self.reply_to),
            ("smtp.return_path", &self.return_path),
        ] {
            if let Some(address) = address {
                validate_address(address)
                    .map_err(|err| ConfigError::invalid(field, err.to_string()))?;
            }
        }
        if self.send_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "smtp.send_timeout_secs",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Delivers messages by email.
#[derive(Debug)]
pub struct EmailProvider {
    config: SmtpConfig,
    timeouts: SmtpTimeouts,
    templates: Arc<TemplateRegistry>,
    stats: StatsCounter,
}

impl EmailProvider {
    #[must_use]
    pub fn new(config: SmtpConfig, timeouts: SmtpTimeouts, templates: Arc<TemplateRegistry>) -> Self {
        Self {
            config,
            timeouts,
            templates,
            stats: StatsCounter::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SmtpConfig {
        &self.config
    }

    fn payload(
        &self,
        kind: MessageType,
        to: &str,
        subject: String,
        text: String,
        html: Option<String>,
    ) -> Result<String, AttemptError> {
        MimeMessage::builder()
            .from(&self.config.from_address)
            .from_name(&self.config.from_name)
            .to(to)
            .subject(subject)
            .reply_to(self.config.reply_to.clone())
            .return_path(self.config.return_path.clone())
            .date(Utc::now())
            .header("X-Courier-Message-Type", kind.as_str())
            .header("X-Mailer", &self.config.mailer)
            .text(text)
            .html(html)
            .build()
            .map(|message| message.render())
            .map_err(|err| classify_client_error(&err))
    }

    fn render(&self, message: &Message, to: &str) -> Result<String, AttemptError> {
        let rendered = self
            .templates
            .render(message.kind, &message.content)
            .map_err(|err| AttemptError::template(err.to_string()))?;

        self.payload(message.kind, to, rendered.subject, rendered.text, rendered.html)
    }

    /// Runs one transaction under `deadline` and records how far it got.
    async fn transmit(
        &self,
        to: &str,
        payload: &str,
        deadline: Duration,
        metadata: &mut BTreeMap<String, String>,
    ) -> Result<DeliveryStatus, AttemptError> {
        let mut transaction = SmtpTransaction::new(&self.config, &self.timeouts, to, payload);
        let result = tokio::time::timeout(deadline, transaction.execute()).await;
        metadata.insert(
            "smtp_phase".to_string(),
            transaction.phase().as_str().to_string(),
        );

        let error = match result {
            Ok(Ok(response)) => {
                metadata.insert(
                    "smtp_response".to_string(),
                    format!("{} {}", response.code, response.message()),
                );

                return Ok(if response.is_success() {
                    DeliveryStatus::Delivered
                } else {
                    DeliveryStatus::Sent
                });
            }
            Ok(Err(err)) => err,
            Err(_) => SendError::Deadline(deadline),
        };

        metadata.insert("smtp_response".to_string(), error.to_string());
        Err(classify_send_error(&error))
    }

    async fn send(
        &self,
        request: DeliveryRequest<'_>,
        metadata: &mut BTreeMap<String, String>,
    ) -> Result<DeliveryStatus, AttemptError> {
        let to = request
            .recipient
            .settings
            .channel(Channel::Email)
            .and_then(|config| config.address.as_deref())
            .filter(|address| !address.trim().is_empty())
            .ok_or_else(|| AttemptError::configuration("No email address configured"))?;
        metadata.insert("email_address".to_string(), to.to_string());

        self.validate_address(to)?;
        let payload = self.render(request.message, to)?;

        let deadline = request
            .deadline
            .unwrap_or_else(|| Duration::from_secs(self.config.send_timeout_secs));
        self.transmit(to, &payload, deadline, metadata).await
    }

    fn finish(
        &self,
        outcome: Result<DeliveryStatus, AttemptError>,
        mut metadata: BTreeMap<String, String>,
        started: Instant,
    ) -> DeliveryReport {
        let duration = started.elapsed();
        metadata.insert("duration_ms".to_string(), duration.as_millis().to_string());

        let report = match outcome {
            Ok(status) => DeliveryReport::new(status, metadata),
            Err(error) => DeliveryReport::failed(error, metadata),
        }
        .with_duration(duration);

        self.stats.record(&report);
        report
    }
}

#[async_trait]
impl ChannelProvider for EmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, request),
        fields(message_id = %request.message.id, user_id = %request.recipient.user_id)
    )]
    async fn deliver(&self, request: DeliveryRequest<'_>) -> DeliveryReport {
        let started = Instant::now();
        let mut metadata = BTreeMap::new();

        let outcome = self.send(request, &mut metadata).await;
        match &outcome {
            Ok(status) => internal!(level = DEBUG, "Email {status:?} for {}", request.recipient.user_id),
            Err(error) => internal!(
                level = DEBUG,
                "Email to {} failed: {error}",
                request.recipient.user_id
            ),
        }

        self.finish(outcome, metadata, started)
    }

    fn validate_address(&self, address: &str) -> Result<(), AttemptError> {
        validate_address(address).map_err(|err| AttemptError::invalid_address(err.to_string()))
    }

    async fn send_verification(&self, address: &str, code: &str) -> DeliveryReport {
        let started = Instant::now();
        let mut metadata = BTreeMap::from([("email_address".to_string(), address.to_string())]);

        let outcome = async {
            self.validate_address(address)?;
            let payload = self.payload(
                MessageType::AccountSecurity,
                address,
                "Verify your email address".to_string(),
                format!(
                    "Your verification code is {code}\n\nIf you did not add this address, you can ignore this message."
                ),
                None,
            )?;
            let deadline = Duration::from_secs(self.config.send_timeout_secs);
            self.transmit(address, &payload, deadline, &mut metadata).await
        }
        .await;

        self.finish(outcome, metadata, started)
    }

    async fn delivery_status(&self, attempt: &DeliveryAttempt) -> DeliveryStatus {
        attempt.status
    }

    fn metrics(&self) -> ChannelStats {
        self.stats.snapshot()
    }

    async fn is_available(&self) -> bool {
        let bound = Duration::from_secs(self.timeouts.connect_secs);
        let probe = async {
            let mut client = transaction::connect(&self.config, &self.timeouts).await?;
            if self.config.tls == TlsMode::StartTls {
                transaction::handshake(&mut client, &self.config, &self.timeouts).await?;
            }
            if let Err(err) = client.quit().await {
                tracing::debug!("QUIT after probe failed: {err}");
            }
            Ok::<_, SendError>(())
        };

        match tokio::time::timeout(bound, probe).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                internal!(level = WARN, "Relay {} unavailable: {err}", self.config.address());
                false
            }
            Err(_) => {
                internal!(
                    level = WARN,
                    "Relay {} did not answer within {bound:?}",
                    self.config.address()
                );
                false
            }
        }
    }
}
