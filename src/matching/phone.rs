// src/matching/phone.rs
use log::debug;

const MIN_PHONE_DIGITS: usize = 7;

/// Strips the formatting characters people type into phone numbers
/// (spaces, dashes, parentheses, dots). A leading `+` is kept.
pub fn normalize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')' | '.'))
        .collect()
}

/// Whether a normalized phone number can be used as a search key.
pub fn is_usable_phone(normalized: &str) -> bool {
    let digits = normalized.chars().filter(|c| c.is_ascii_digit()).count();
    if digits < MIN_PHONE_DIGITS {
        debug!(
            "Phone number '{}' has {} digits, considered unusable for matching.",
            normalized, digits
        );
        return false;
    }
    true
}
