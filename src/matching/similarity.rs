// src/matching/similarity.rs
use once_cell::sync::Lazy;
use regex::Regex;
use strsim::levenshtein;

/// Minimum per-name similarity for a name-based duplicate.
pub const NAME_SIMILARITY_THRESHOLD: f64 = 0.8;

static DOMAIN_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(com|net|org|io|co|uk|it|de|fr|es|eu)$").unwrap());
static LEGAL_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[\s,]+(ltd|llc|inc|corp|srl|spa|gmbh|sa|ag|plc)\.?$").unwrap()
});
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[\s\-_.,'"&+]"#).unwrap());

/// Case-insensitive normalized Levenshtein similarity in [0, 1].
///
/// Two empty values score 0.0: absence on both sides is not evidence of a match.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    let distance = levenshtein(&a, &b);
    1.0 - distance as f64 / max_len as f64
}

/// Threshold check at one-decimal precision, the precision scores are shown
/// to operators with ("Jon" vs "John" scores 0.75 and is shown as 0.8).
pub fn meets_threshold(score: f64, threshold: f64) -> bool {
    (score * 10.0).round() / 10.0 >= threshold
}

/// Drops a trailing web TLD and legal-form suffix, keeping word spacing.
pub fn strip_company_suffixes(name: &str) -> String {
    let trimmed = name.trim();
    let without_domain = DOMAIN_SUFFIX.replace(trimmed, "");
    LEGAL_SUFFIX.replace(&without_domain, "").trim().to_string()
}

/// Comparable form of a company name: lowercase, suffixes stripped,
/// spaces and punctuation removed. Empty when nothing meaningful is left.
pub fn normalize_company_name(name: &str) -> String {
    let stripped = strip_company_suffixes(&name.to_lowercase());
    SEPARATORS.replace_all(&stripped, "").to_string()
}
