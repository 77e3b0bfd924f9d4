//! SMTP transaction execution
//!
//! One transaction submits one rendered message to the configured relay:
//! - connection, plain or implicit TLS
//! - greeting and EHLO
//! - STARTTLS and a second EHLO, when configured
//! - AUTH PLAIN or LOGIN, when credentials are configured
//! - MAIL FROM, RCPT TO and DATA
//! - QUIT, whose failure is tolerated

use std::{future::Future, time::Duration};

use courier_common::{internal, model::SendPhase, tracing};
use courier_smtp::{ClientError, Response, SmtpClient};

use super::{SmtpConfig, TlsMode};
use crate::{error::SendError, types::SmtpTimeouts};

/// Runs `future` under a per-step deadline.
async fn step<T>(
    name: &'static str,
    secs: u64,
    future: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, SendError> {
    let after = Duration::from_secs(secs);
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| SendError::Timeout { step: name, after })?
        .map_err(SendError::from)
}

/// Opens a session and reads the greeting.
pub(super) async fn connect(
    config: &SmtpConfig,
    timeouts: &SmtpTimeouts,
) -> Result<SmtpClient, SendError> {
    if config.accept_invalid_certs {
        tracing::warn!(
            server = %config.address(),
            "SECURITY WARNING: TLS certificate validation is disabled for this connection"
        );
    }

    let address = config.address();
    let mut client = step("connect", timeouts.connect_secs, async {
        match config.tls {
            TlsMode::Implicit => {
                SmtpClient::connect_tls(&address, &config.host, config.accept_invalid_certs).await
            }
            TlsMode::None | TlsMode::StartTls => Ok(SmtpClient::connect(&address, &config.host)
                .await?
                .accept_invalid_certs(config.accept_invalid_certs)),
        }
    })
    .await?;

    step("greeting", timeouts.ehlo_secs, client.read_greeting()).await?;

    Ok(client)
}

/// EHLO, followed by STARTTLS and a fresh EHLO when the configuration asks
/// for it.
pub(super) async fn handshake(
    client: &mut SmtpClient,
    config: &SmtpConfig,
    timeouts: &SmtpTimeouts,
) -> Result<(), SendError> {
    step("EHLO", timeouts.ehlo_secs, client.ehlo(&config.helo_name)).await?;

    if config.tls == TlsMode::StartTls {
        if !client.supports("STARTTLS") {
            return Err(ClientError::TlsError(format!(
                "{} does not offer STARTTLS",
                config.address()
            ))
            .into());
        }

        step("STARTTLS", timeouts.starttls_secs, client.starttls()).await?;
        step("EHLO", timeouts.ehlo_secs, client.ehlo(&config.helo_name)).await?;
        tracing::debug!(server = %config.address(), "TLS negotiated via STARTTLS");
    }

    Ok(())
}

/// A single submission of one rendered payload.
pub(super) struct SmtpTransaction<'a> {
    config: &'a SmtpConfig,
    timeouts: &'a SmtpTimeouts,
    recipient: &'a str,
    payload: &'a str,
    phase: SendPhase,
}

impl<'a> SmtpTransaction<'a> {
    pub(super) const fn new(
        config: &'a SmtpConfig,
        timeouts: &'a SmtpTimeouts,
        recipient: &'a str,
        payload: &'a str,
    ) -> Self {
        Self {
            config,
            timeouts,
            recipient,
            payload,
            phase: SendPhase::Connecting,
        }
    }

    /// How far the transaction got. Still meaningful after the future
    /// returned by [`execute`](Self::execute) was dropped on a deadline.
    pub(super) const fn phase(&self) -> SendPhase {
        self.phase
    }

    /// Executes the whole transaction and returns the reply to the payload.
    ///
    /// 1. Connects and reads the greeting
    /// 2. EHLO, then STARTTLS and EHLO again when configured
    /// 3. Authenticates when credentials are configured
    /// 4. MAIL FROM and RCPT TO
    /// 5. DATA and the dot-stuffed payload
    /// 6. QUIT, ignoring failures
    ///
    /// # Errors
    ///
    /// Returns an error for the first step that fails or overruns.
    #[tracing::instrument(level = "debug", skip(self), fields(server = %self.config.address(), recipient = self.recipient))]
    pub(super) async fn execute(&mut self) -> Result<Response, SendError> {
        self.phase = SendPhase::Connecting;
        let mut client = connect(self.config, self.timeouts).await?;
        handshake(&mut client, self.config, self.timeouts).await?;

        if let Some(credentials) = &self.config.credentials {
            self.phase = SendPhase::Authenticating;
            step(
                "AUTH",
                self.timeouts.auth_secs,
                client.auth(&credentials.username, &credentials.password),
            )
            .await?;
        }

        self.phase = SendPhase::Sending;
        step(
            "MAIL FROM",
            self.timeouts.mail_from_secs,
            client.mail_from(&self.config.from_address, Some(self.payload.len())),
        )
        .await?;
        step(
            "RCPT TO",
            self.timeouts.rcpt_to_secs,
            client.rcpt_to(self.recipient),
        )
        .await?;

        let payload = self.payload;
        let response = step("DATA", self.timeouts.data_secs, async {
            client.data().await?;
            client.send_data(payload).await
        })
        .await?;

        let quit_timeout = Duration::from_secs(self.timeouts.quit_secs);
        match tokio::time::timeout(quit_timeout, client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                internal!(level = WARN, "QUIT failed after the payload was accepted: {err}");
            }
            Err(_) => {
                internal!(level = WARN, "QUIT timed out after {quit_timeout:?}");
            }
        }

        Ok(response)
    }
}
