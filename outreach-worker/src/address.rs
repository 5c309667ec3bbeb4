//! Address normalization and validation for each channel.

use crate::error::AddressError;
use crate::types::Channel;

/// Fallback country calling code for bare 10-digit numbers.
pub const DEFAULT_COUNTRY_CODE: &str = "1";

/// Normalize a phone number to `+<digits>`.
///
/// Non-digits are stripped; a 10-digit result gets `country_code` prepended.
/// Idempotent: normalizing an already-normalized number returns it unchanged.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 10 {
        format!("+{}{}", country_code, digits)
    } else {
        format!("+{}", digits)
    }
}

/// Normalize and validate a phone number (E.164: 11 to 15 digits).
pub fn parse_phone(raw: &str, country_code: &str) -> Result<String, AddressError> {
    let normalized = normalize_phone(raw, country_code);
    let digit_count = normalized.len() - 1;

    if !(11..=15).contains(&digit_count) {
        return Err(AddressError::InvalidPhone {
            raw: raw.to_string(),
            digits: digit_count,
        });
    }

    Ok(normalized)
}

/// Normalize an email address: trim surrounding whitespace and lowercase.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Normalize and validate an email address.
pub fn parse_email(raw: &str) -> Result<String, AddressError> {
    let normalized = normalize_email(raw);
    let invalid = || AddressError::InvalidEmail(raw.to_string());

    if normalized.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let (local, domain) = normalized.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }

    Ok(normalized)
}

/// Normalize and validate an address for `channel`.
pub fn parse_address(channel: Channel, raw: &str, country_code: &str) -> Result<String, AddressError> {
    match channel {
        Channel::Email => parse_email(raw),
        Channel::Sms => parse_phone(raw, country_code),
    }
}
