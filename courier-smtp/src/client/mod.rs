//! SMTP submission client.
//!
//! The client speaks just enough ESMTP to hand a rendered message to a relay:
//!
//! - Plain TCP, implicit TLS (`smtps`) and STARTTLS upgrades
//! - `AUTH PLAIN` and `AUTH LOGIN`
//! - Dot-stuffed `DATA` transfer
//!
//! # Example
//!
//! ```no_run
//! use courier_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), courier_smtp::ClientError> {
//! let mut client = SmtpClient::connect("smtp.example.com:587", "smtp.example.com").await?;
//! client.read_greeting().await?;
//! client.ehlo("courier.example.com").await?;
//! client.starttls().await?;
//! client.ehlo("courier.example.com").await?;
//! client.auth("user", "secret").await?;
//! client.mail_from("noreply@example.com", None).await?;
//! client.rcpt_to("reader@example.org").await?;
//! client.data().await?;
//! client.send_data("Subject: Hi\r\n\r\nHello").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

#[allow(clippy::module_inception)]
mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
