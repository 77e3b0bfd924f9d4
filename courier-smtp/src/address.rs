//! Syntactic validation of email addresses.
//!
//! This is a cheap pre-flight check run before any network activity. It does
//! not try to implement the full RFC 5322 grammar.

use thiserror::Error;

/// Longest domain a DNS name can carry.
pub const MAX_DOMAIN_LENGTH: usize = 253;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("address has no '@'")]
    MissingAt,

    #[error("address has an empty local part")]
    EmptyLocalPart,

    #[error("address has an empty domain")]
    EmptyDomain,

    #[error("domain is longer than {MAX_DOMAIN_LENGTH} characters")]
    DomainTooLong,

    #[error("address contains consecutive dots")]
    ConsecutiveDots,

    #[error("address contains whitespace or control characters")]
    InvalidCharacter,
}

/// Checks that `address` looks like `local@domain`.
///
/// # Errors
///
/// Returns the first rule the address breaks.
pub fn validate_address(address: &str) -> Result<(), AddressError> {
    if address.is_empty() {
        return Err(AddressError::Empty);
    }

    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AddressError::InvalidCharacter);
    }

    let Some((local, domain)) = address.rsplit_once('@') else {
        return Err(AddressError::MissingAt);
    };

    if local.is_empty() {
        return Err(AddressError::EmptyLocalPart);
    }

    if domain.is_empty() {
        return Err(AddressError::EmptyDomain);
    }

    if domain.len() > MAX_DOMAIN_LENGTH {
        return Err(AddressError::DomainTooLong);
    }

    if address.contains("..") {
        return Err(AddressError::ConsecutiveDots);
    }

    Ok(())
}
