use serde::{Deserialize, Serialize};

/// Per-step deadlines for an SMTP transaction, in seconds.
///
/// Every network step of the email provider runs under its own deadline; a
/// step that overruns is recorded as a retryable `timeout`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmtpTimeouts {
    /// Opening the TCP connection (and the TLS handshake for implicit TLS)
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Reading the greeting and the EHLO exchange
    #[serde(default = "default_ehlo_timeout")]
    pub ehlo_secs: u64,

    /// STARTTLS negotiation
    #[serde(default = "default_starttls_timeout")]
    pub starttls_secs: u64,

    /// The AUTH exchange
    #[serde(default = "default_auth_timeout")]
    pub auth_secs: u64,

    /// MAIL FROM
    #[serde(default = "default_mail_from_timeout")]
    pub mail_from_secs: u64,

    /// RCPT TO
    #[serde(default = "default_rcpt_to_timeout")]
    pub rcpt_to_secs: u64,

    /// DATA and the payload, which may be large
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// QUIT
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_ehlo_timeout() -> u64 {
    30
}

const fn default_starttls_timeout() -> u64 {
    30
}

const fn default_auth_timeout() -> u64 {
    30
}

const fn default_mail_from_timeout() -> u64 {
    30
}

const fn default_rcpt_to_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            ehlo_secs: default_ehlo_timeout(),
            starttls_secs: default_starttls_timeout(),
            auth_secs: default_auth_timeout(),
            mail_from_secs: default_mail_from_timeout(),
            rcpt_to_secs: default_rcpt_to_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}
