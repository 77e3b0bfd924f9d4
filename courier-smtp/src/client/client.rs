//! SMTP client connection handling, with TLS and STARTTLS support.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };

        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => Ok(Self::Tls(Box::new(
                tls_handshake(stream, domain, accept_invalid_certs).await?,
            ))),
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }

    const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

async fn tls_handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// Accepts any certificate. Only for relays with self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Applies SMTP transparency (RFC 5321 4.5.2) and normalises line endings to
/// CRLF. The returned payload ends with the `.` terminator line.
#[must_use]
pub fn dot_stuff(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 64 + 5);

    let body = data.strip_suffix('\n').unwrap_or(data);
    let body = body.strip_suffix('\r').unwrap_or(body);

    if !body.is_empty() {
        for line in body.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with('.') {
                out.push('.');
            }
            out.push_str(line);
            out.push_str("\r\n");
        }
    }

    out.push_str(".\r\n");
    out
}

/// A single SMTP session with a relay.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    responses: Vec<Response>,
    server_domain: String,
    accept_invalid_certs: bool,
    extensions: Vec<String>,
}

impl SmtpClient {
    fn with_connection(connection: ClientConnection, server_domain: &str) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            responses: Vec::new(),
            server_domain: server_domain.to_string(),
            accept_invalid_certs: false,
            extensions: Vec::new(),
        }
    }

    /// Opens a plain TCP connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_domain: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::with_connection(
            ClientConnection::Plain(stream),
            server_domain,
        ))
    }

    /// Opens a connection that is TLS from the first byte (port 465 style).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: &str,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let tls = tls_handshake(stream, server_domain, accept_invalid_certs).await?;

        Ok(Self::with_connection(
            ClientConnection::Tls(Box::new(tls)),
            server_domain,
        )
        .accept_invalid_certs(accept_invalid_certs))
    }

    /// Sets whether to accept invalid TLS certificates on STARTTLS.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Whether the session is currently encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.connection.as_ref().is_some_and(ClientConnection::is_tls)
    }

    /// Reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is not a 220.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let response = self.read_response().await?;
        expect(response, |r| r.code == 220)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{line}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await
    }

    /// Sends a command and reads the reply, without judging the code.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");
        self.send_line(command).await?;
        self.read_response().await
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = expect(self.command(&format!("EHLO {domain}")).await?, Response::is_success)?;
        self.extensions = response.extensions();
        Ok(response)
    }

    /// Whether the last EHLO advertised `keyword`.
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.split_whitespace().next() == Some(keyword))
    }

    /// AUTH mechanisms from the last EHLO.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<&str> {
        self.extensions
            .iter()
            .find_map(|ext| ext.strip_prefix("AUTH "))
            .map(|mechanisms| mechanisms.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Authenticates with the best mechanism the server offers.
    ///
    /// PLAIN is preferred, LOGIN is the fallback. When the server did not
    /// advertise AUTH at all, PLAIN is attempted.
    ///
    /// # Errors
    ///
    /// Returns an error if no supported mechanism is offered or the
    /// credentials are rejected.
    pub async fn auth(&mut self, username: &str, password: &str) -> Result<Response> {
        let mechanisms = self.auth_mechanisms();

        if mechanisms.is_empty() || mechanisms.contains(&"PLAIN") {
            self.auth_plain(username, password).await
        } else if mechanisms.contains(&"LOGIN") {
            self.auth_login(username, password).await
        } else {
            Err(ClientError::AuthUnsupported(mechanisms.join(" ")))
        }
    }

    /// `AUTH PLAIN` with an initial response.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are rejected.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));

        outgoing!("AUTH PLAIN <redacted>");
        self.send_line(&format!("AUTH PLAIN {token}")).await?;
        let response = self.read_response().await?;

        expect(response, |r| r.code == 235)
    }

    /// `AUTH LOGIN` challenge/response.
    ///
    /// # Errors
    ///
    /// Returns an error if any step is rejected.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<Response> {
        expect(self.command("AUTH LOGIN").await?, |r| r.code == 334)?;

        outgoing!("<username>");
        self.send_line(&STANDARD.encode(username)).await?;
        expect(self.read_response().await?, |r| r.code == 334)?;

        outgoing!("<password>");
        self.send_line(&STANDARD.encode(password)).await?;
        expect(self.read_response().await?, |r| r.code == 235)
    }

    /// Sends `MAIL FROM`, with a `SIZE` parameter when known.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let command = match size {
            Some(size) if self.supports("SIZE") => format!("MAIL FROM:<{from}> SIZE={size}"),
            _ => format!("MAIL FROM:<{from}>"),
        };

        expect(self.command(&command).await?, Response::is_success)
    }

    /// Sends `RCPT TO`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        expect(
            self.command(&format!("RCPT TO:<{to}>")).await?,
            Response::is_success,
        )
    }

    /// Sends `DATA` and expects the 354 go-ahead.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn data(&mut self) -> Result<Response> {
        expect(self.command("DATA").await?, |r| r.code == 354)
    }

    /// Streams the payload with dot-stuffing and the terminating `.` line.
    ///
    /// The final reply is returned as long as it is not an error, so the
    /// caller can tell an accepted (2xx) transfer from anything else.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the server rejects the payload.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        let payload = dot_stuff(data);

        outgoing!("<{} bytes of message data>", payload.len());
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(payload.as_bytes())
            .await?;

        expect(self.read_response().await?, |r| !r.is_error())
    }

    /// Sends `QUIT`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends `STARTTLS` and upgrades the connection.
    ///
    /// EHLO must be sent again afterwards; previously advertised extensions
    /// are forgotten.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses or the handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = expect(self.command("STARTTLS").await?, |r| r.code == 220)?;

        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(
            connection
                .upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                .await?,
        );
        self.extensions.clear();
        self.buffer_pos = 0;

        Ok(response)
    }

    /// Sends `RSET`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Every reply received so far.
    #[must_use]
    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    #[must_use]
    pub fn last_response(&self) -> Option<&Response> {
        self.responses.last()
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                self.responses.push(response.clone());

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Turns a reply that fails `accept` into an error carrying its code.
fn expect(response: Response, accept: impl FnOnce(&Response) -> bool) -> Result<Response> {
    if accept(&response) {
        Ok(response)
    } else if response.is_error() {
        Err(ClientError::SmtpError {
            code: response.code,
            message: response.message(),
        })
    } else {
        Err(ClientError::UnexpectedResponse {
            code: response.code,
            message: response.message(),
        })
    }
}
