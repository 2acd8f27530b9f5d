// src/matching/url.rs
//! Exact-match searches on web identifiers: a shared LinkedIn profile or
//! website stored on the record itself.
use futures::future::try_join_all;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::MergeError;
use crate::models::core::{Entity, FieldName, FieldValue};
use crate::models::matching::{Candidate, MatchReason};
use crate::store::EntityStore;
use crate::utils::logging::MergeLogger;

static SCHEME_AND_WWW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(https?://)?(www\.)?").unwrap());

/// Comparable form of a LinkedIn URL or website: trimmed and lowercased.
pub fn normalize_url(url: &str) -> String {
    url.trim().to_lowercase()
}

/// Bare host of a domain or URL: no scheme, `www.`, path or port.
pub fn normalize_domain(domain: &str) -> String {
    let lowered = domain.trim().to_lowercase();
    let host = SCHEME_AND_WWW.replace(&lowered, "");
    let host = host.split('/').next().unwrap_or_default();
    host.split(':').next().unwrap_or_default().to_string()
}

/// Record field compared by a web-identifier strategy.
pub fn field_for(reason: MatchReason) -> Option<FieldName> {
    match reason {
        MatchReason::SharedLinkedin => Some(FieldName::Linkedin),
        MatchReason::SharedWebsite => Some(FieldName::Website),
        _ => None,
    }
}

/// Records of the same kind whose LinkedIn URL (or website) equals the
/// source's after trimming and lowercasing. Score 1.0, ordered by id.
pub async fn find_url_candidates<S>(
    store: &S,
    source: &Entity,
    reason: MatchReason,
    merged_category: &str,
    logger: &MergeLogger,
) -> Result<Vec<Candidate>, MergeError>
where
    S: EntityStore + ?Sized,
{
    let field = field_for(reason).ok_or_else(|| {
        MergeError::ValidationError(format!("{} is not a web-identifier strategy", reason))
    })?;
    if !source.kind.has_field(field) {
        return Err(MergeError::ValidationError(format!(
            "{} search is not available for {}",
            reason, source.kind
        )));
    }
    let Some(raw) = source.text(field) else {
        return Err(MergeError::InsufficientSearchInput {
            entity_kind: source.kind,
            entity_id: source.id.clone(),
            strategy: reason,
        });
    };
    let wanted = normalize_url(raw);

    // stored spelling as typed, plus its lowercase form when it differs
    let lookups: Vec<FieldValue> = [raw.to_string(), wanted.clone()]
        .into_iter()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .map(FieldValue::Text)
        .collect();
    logger.log_phase(
        "Looking up exact matches",
        Some(&format!("{} = '{}'", field, raw)),
    );
    let results = try_join_all(
        lookups
            .iter()
            .map(|value| store.query_by_equality(source.kind, field, value)),
    )
    .await
    .map_err(MergeError::SearchFailed)?;

    let mut hits: BTreeMap<String, Entity> = BTreeMap::new();
    for entity in results.into_iter().flatten() {
        hits.entry(entity.id.clone()).or_insert(entity);
    }
    let fetched = hits.len();

    let candidates: Vec<Candidate> = hits
        .into_values()
        .filter(|entity| entity.id != source.id)
        .filter(|entity| {
            if entity.is_merged(merged_category) {
                debug!("Skipping {} already merged away", entity.id);
                return false;
            }
            entity.text(field).map(normalize_url).as_deref() == Some(wanted.as_str())
        })
        .map(|entity| {
            let value = entity.text(field).unwrap_or_default().to_string();
            Candidate::by_contact_point(entity, reason, value)
        })
        .collect();
    logger.log_filtering_results(fetched, candidates.len());
    Ok(candidates)
}
