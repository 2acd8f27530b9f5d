// src/matching/name.rs
use log::debug;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::MergeError;
use crate::matching::similarity::{
    meets_threshold, normalize_company_name, similarity, strip_company_suffixes,
    NAME_SIMILARITY_THRESHOLD,
};
use crate::models::core::{Entity, EntityKind, FieldName};
use crate::models::matching::{Candidate, MatchReason};
use crate::store::EntityStore;
use crate::utils::logging::MergeLogger;

/// Name-similarity candidates for a contact or company.
///
/// Runs a broad substring query against the store, then keeps only records
/// whose names clear `NAME_SIMILARITY_THRESHOLD`. Results are sorted by
/// descending score, ties broken by id.
pub async fn find_name_candidates<S>(
    store: &S,
    source: &Entity,
    merged_category: &str,
    logger: &MergeLogger,
) -> Result<Vec<Candidate>, MergeError>
where
    S: EntityStore + ?Sized,
{
    let fetched = match source.kind {
        EntityKind::Contact => fetch_contact_pool(store, source).await?,
        EntityKind::Company => fetch_company_pool(store, source).await?,
    };
    let fetched_count = fetched.len();
    logger.log_data_loaded(fetched_count, source.kind.table());

    let mut candidates: Vec<Candidate> = fetched
        .into_values()
        .filter(|other| other.id != source.id && !other.is_merged(merged_category))
        .filter_map(|other| {
            let score = match source.kind {
                EntityKind::Contact => contact_name_score(source, &other),
                EntityKind::Company => company_name_score(source, &other),
            }?;
            Some(Candidate::by_name(other, score))
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
    logger.log_filtering_results(fetched_count, candidates.len());
    Ok(candidates)
}

fn insufficient(source: &Entity) -> MergeError {
    MergeError::InsufficientSearchInput {
        entity_kind: source.kind,
        entity_id: source.id.clone(),
        strategy: MatchReason::NameSimilarity,
    }
}

/// first_name ILIKE %first% ∪ last_name ILIKE %last%, keyed by id.
async fn fetch_contact_pool<S>(
    store: &S,
    source: &Entity,
) -> Result<BTreeMap<String, Entity>, MergeError>
where
    S: EntityStore + ?Sized,
{
    let first = source.text(FieldName::FirstName);
    let last = source.text(FieldName::LastName);
    if first.is_none() && last.is_none() {
        return Err(insufficient(source));
    }

    let by_first = async {
        match first {
            Some(first) => {
                store
                    .query_by_like(EntityKind::Contact, FieldName::FirstName, first)
                    .await
            }
            None => Ok(Vec::new()),
        }
    };
    let by_last = async {
        match last {
            Some(last) => {
                store
                    .query_by_like(EntityKind::Contact, FieldName::LastName, last)
                    .await
            }
            None => Ok(Vec::new()),
        }
    };
    let (by_first, by_last) =
        futures::try_join!(by_first, by_last).map_err(MergeError::SearchFailed)?;

    Ok(by_first
        .into_iter()
        .chain(by_last)
        .map(|e| (e.id.clone(), e))
        .collect())
}

/// name ILIKE %name%, plus the suffix-stripped name when it differs.
async fn fetch_company_pool<S>(
    store: &S,
    source: &Entity,
) -> Result<BTreeMap<String, Entity>, MergeError>
where
    S: EntityStore + ?Sized,
{
    let name = source
        .text(FieldName::Name)
        .filter(|n| !normalize_company_name(n).is_empty())
        .ok_or_else(|| insufficient(source))?;
    let stripped = strip_company_suffixes(name);

    let mut pool = BTreeMap::new();
    let mut terms = vec![name.to_string()];
    if !stripped.is_empty() && stripped != name {
        terms.push(stripped);
    }
    for term in terms {
        let found = store
            .query_by_like(EntityKind::Company, FieldName::Name, &term)
            .await
            .map_err(MergeError::SearchFailed)?;
        debug!("Company name query '{}' returned {} rows", term, found.len());
        pool.extend(found.into_iter().map(|e| (e.id.clone(), e)));
    }
    Ok(pool)
}

/// Lowest similarity over the name pairs present on both records, provided
/// every such pair clears the threshold. `None` rejects the record.
///
/// Both names present: both must match. One present: that one must match.
/// None present: rejected.
pub fn contact_name_score(source: &Entity, other: &Entity) -> Option<f64> {
    let scores: Vec<f64> = [FieldName::FirstName, FieldName::LastName]
        .iter()
        .filter_map(|field| match (source.text(*field), other.text(*field)) {
            (Some(a), Some(b)) => Some(similarity(a, b)),
            _ => None,
        })
        .collect();

    if scores.is_empty() {
        return None;
    }
    if !scores
        .iter()
        .all(|s| meets_threshold(*s, NAME_SIMILARITY_THRESHOLD))
    {
        return None;
    }
    scores.into_iter().reduce(f64::min)
}

pub fn company_name_score(source: &Entity, other: &Entity) -> Option<f64> {
    let a = normalize_company_name(source.text(FieldName::Name)?);
    let b = normalize_company_name(other.text(FieldName::Name)?);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let score = similarity(&a, &b);
    meets_threshold(score, NAME_SIMILARITY_THRESHOLD).then_some(score)
}
