// src/matching/email.rs

/// Comparable form of an email address: trimmed and lowercased.
///
/// Local parts are otherwise kept verbatim (no `+tag` or dot folding) so that
/// two contacts only match on what is, for practical purposes, the same mailbox.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Whether a normalized email can be used as a search key.
pub fn is_usable_email(normalized: &str) -> bool {
    match normalized.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty(),
        None => false,
    }
}
