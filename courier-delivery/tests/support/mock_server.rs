//! Scriptable SMTP relay for delivery tests.
#![allow(dead_code)] // Not every test file uses every knob
//!
//! The relay answers each command from a fixed table, records what it was
//! sent, and can hang or hang up on a chosen command:
//!
//! ```rust,no_run
//! let relay = MockRelay::builder()
//!     .with_rcpt_to_response(550, "5.1.1 User unknown")
//!     .build()
//!     .await?;
//!
//! // Point an `SmtpConfig` at relay.addr() and deliver.
//! relay.shutdown();
//! ```

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// A command the relay received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    Ehlo(String),
    /// The mechanism only; credentials are not kept.
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Everything between DATA and the terminating dot.
    Payload(String),
    StartTls,
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.text).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct RelayScript {
    greeting: Reply,
    capabilities: Vec<String>,
    auth: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    starttls: Option<Reply>,
    hang_on_command: Option<usize>,
    drop_after_commands: Option<usize>,
}

impl Default for RelayScript {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "relay.test ESMTP ready"),
            capabilities: vec![
                "relay.test".to_string(),
                "SIZE 10485760".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
            ],
            auth: Reply::new(235, "2.7.0 Authentication successful"),
            mail_from: Reply::new(250, "2.1.0 OK"),
            rcpt_to: Reply::new(250, "2.1.5 OK"),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "2.0.0 Queued"),
            quit: Reply::new(221, "2.0.0 Bye"),
            starttls: None,
            hang_on_command: None,
            drop_after_commands: None,
        }
    }
}

impl RelayScript {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.capabilities.len().saturating_sub(1);

        for (i, capability) in self.capabilities.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let _ = write!(&mut response, "250{separator}{capability}\r\n");
        }

        response.into_bytes()
    }
}

pub struct MockRelay {
    addr: SocketAddr,
    received: Arc<RwLock<Vec<RelayCommand>>>,
    sessions: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockRelay {
    #[must_use]
    pub fn builder() -> MockRelayBuilder {
        MockRelayBuilder::default()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<RelayCommand> {
        self.received.read().await.clone()
    }

    /// Payloads of every accepted or rejected DATA transfer.
    pub async fn payloads(&self) -> Vec<String> {
        self.received
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                RelayCommand::Payload(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn serve(
        mut stream: TcpStream,
        script: Arc<RelayScript>,
        received: Arc<RwLock<Vec<RelayCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut seen = 0;

        writer.write_all(&script.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            if script.drop_after_commands.is_some_and(|limit| seen >= limit) {
                return Ok(());
            }
            if script.hang_on_command == Some(seen) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            seen += 1;

            let command_line = line.trim_end();
            tracing::debug!("Relay received: {command_line}");
            let (verb, argument) = command_line
                .split_once(' ')
                .map_or((command_line, ""), |(verb, rest)| (verb, rest));

            let (reply, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (
                    script.ehlo_bytes(),
                    RelayCommand::Ehlo(argument.to_string()),
                ),
                "AUTH" => {
                    let mechanism = argument.split_whitespace().next().unwrap_or_default();
                    (
                        script.auth.to_bytes(),
                        RelayCommand::Auth(mechanism.to_string()),
                    )
                }
                "MAIL" => (
                    script.mail_from.to_bytes(),
                    RelayCommand::MailFrom(argument.to_string()),
                ),
                "RCPT" => (
                    script.rcpt_to.to_bytes(),
                    RelayCommand::RcptTo(argument.to_string()),
                ),
                "DATA" => (script.data.to_bytes(), RelayCommand::Data),
                "STARTTLS" => (
                    script
                        .starttls
                        .as_ref()
                        .map_or_else(
                            || Reply::new(502, "5.5.1 Command not implemented"),
                            Clone::clone,
                        )
                        .to_bytes(),
                    RelayCommand::StartTls,
                ),
                "QUIT" => {
                    received.write().await.push(RelayCommand::Quit);
                    writer.write_all(&script.quit.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    Reply::new(500, "5.5.2 Unrecognised command").to_bytes(),
                    RelayCommand::Other(command_line.to_string()),
                ),
            };

            let accepts_payload = command == RelayCommand::Data && script.data.code == 354;
            received.write().await.push(command);
            writer.write_all(&reply).await?;
            writer.flush().await?;

            if accepts_payload {
                let mut payload = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line.trim_end() == "." {
                        break;
                    }
                    payload.push_str(&line);
                }

                received.write().await.push(RelayCommand::Payload(payload));
                writer.write_all(&script.data_end.to_bytes()).await?;
                writer.flush().await?;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MockRelayBuilder {
    script: RelayScript,
}

impl MockRelayBuilder {
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.auth = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, text);
        self
    }

    /// Reply to the terminating dot of the payload.
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.starttls = Some(Reply::new(code, text));
        self
    }

    /// Stops answering at the Nth command (0-indexed), without closing.
    #[must_use]
    pub const fn with_hang_on_command(mut self, index: usize) -> Self {
        self.script.hang_on_command = Some(index);
        self
    }

    #[must_use]
    pub const fn with_drop_after_commands(mut self, count: usize) -> Self {
        self.script.drop_after_commands = Some(count);
        self
    }

    /// Binds an ephemeral local port and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if no port can be bound.
    pub async fn build(self) -> Result<MockRelay, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let received = Arc::new(RwLock::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let relay = MockRelay {
            addr,
            received: received.clone(),
            sessions: sessions.clone(),
            shutdown: shutdown.clone(),
        };

        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                // Poll so the shutdown flag is noticed
                let Ok(Ok((stream, _peer))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                sessions.fetch_add(1, Ordering::Relaxed);
                let script = script.clone();
                let received = received.clone();
                tokio::spawn(async move {
                    if let Err(err) = MockRelay::serve(stream, script, received).await {
                        tracing::debug!("Relay session error: {err}");
                    }
                });
            }
        });

        Ok(relay)
    }
}
