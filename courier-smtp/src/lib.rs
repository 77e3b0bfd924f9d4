//! Outbound SMTP for the courier email channel.
//!
//! - [`client`]: a minimal submission client (plain, implicit TLS, STARTTLS, AUTH)
//! - [`mime`]: rendering of `text/plain` and `multipart/alternative` messages
//! - [`address`]: syntactic validation of recipient addresses

pub mod address;
pub mod client;
pub mod mime;

pub use address::{AddressError, validate_address};
pub use client::{ClientError, Response, SmtpClient};
pub use mime::MimeMessage;
