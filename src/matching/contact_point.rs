// src/matching/contact_point.rs
use futures::future::try_join_all;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::MergeError;
use crate::matching::email::is_usable_email;
use crate::matching::phone::is_usable_phone;
use crate::models::core::{Entity, Relation};
use crate::models::matching::{Candidate, MatchReason};
use crate::store::EntityStore;
use crate::utils::logging::MergeLogger;

/// Association table holding the values a strategy compares.
pub fn relation_for(reason: MatchReason) -> Option<Relation> {
    match reason {
        MatchReason::SharedEmail => Some(Relation::ContactEmails),
        MatchReason::SharedPhone => Some(Relation::ContactMobiles),
        MatchReason::SharedDomain => Some(Relation::CompanyDomains),
        _ => None,
    }
}

fn is_usable(relation: Relation, canonical: &str) -> bool {
    match relation {
        Relation::ContactEmails => is_usable_email(canonical),
        Relation::ContactMobiles => is_usable_phone(canonical),
        Relation::CompanyDomains => canonical.contains('.'),
        _ => !canonical.is_empty(),
    }
}

/// Records sharing at least one normalized email, phone (contacts) or
/// domain (companies) with `source`.
///
/// Every candidate scores 1.0 and carries the first shared value found for it.
/// Output is ordered by id.
pub async fn find_contact_point_candidates<S>(
    store: &S,
    source: &Entity,
    reason: MatchReason,
    merged_category: &str,
    logger: &MergeLogger,
) -> Result<Vec<Candidate>, MergeError>
where
    S: EntityStore + ?Sized,
{
    let relation = relation_for(reason).ok_or_else(|| {
        MergeError::ValidationError(format!("{} is not a contact-point strategy", reason))
    })?;
    if source.kind != relation.owner_kind() {
        return Err(MergeError::ValidationError(format!(
            "{} search is only available for {}, not {}",
            reason,
            relation.owner_kind(),
            source.kind
        )));
    }

    let stored = store
        .list_associations(relation, &source.id)
        .await
        .map_err(MergeError::SearchFailed)?;
    let keys: BTreeSet<String> = stored
        .iter()
        .map(|v| relation.canonical(v))
        .filter(|v| is_usable(relation, v))
        .collect();
    if keys.is_empty() {
        return Err(MergeError::InsufficientSearchInput {
            entity_kind: source.kind,
            entity_id: source.id.clone(),
            strategy: reason,
        });
    }
    logger.log_phase(
        "Looking up shared values",
        Some(&format!("{} usable {} on {}", keys.len(), relation.relation_kind(), source.id)),
    );

    let keys: Vec<String> = keys.into_iter().collect();
    let rows = store
        .find_association_owners(relation, &keys)
        .await
        .map_err(MergeError::SearchFailed)?;

    // owner id -> first shared value seen for it
    let mut shared: BTreeMap<String, String> = BTreeMap::new();
    for (owner_id, value) in rows {
        if owner_id == source.id {
            continue;
        }
        shared.entry(owner_id).or_insert(value);
    }
    logger.log_data_loaded(shared.len(), "sharing owner");

    let owners = try_join_all(
        shared
            .keys()
            .map(|id| store.get_by_id(source.kind, id)),
    )
    .await
    .map_err(MergeError::SearchFailed)?;

    let fetched = shared.len();
    let candidates: Vec<Candidate> = shared
        .into_iter()
        .zip(owners)
        .filter_map(|((owner_id, value), entity)| match entity {
            Some(entity) if entity.is_merged(merged_category) => {
                debug!("Skipping {} already merged away", owner_id);
                None
            }
            Some(entity) => Some(Candidate::by_contact_point(entity, reason, value)),
            None => {
                warn!(
                    "{} row references missing {} {}",
                    relation.table(),
                    source.kind,
                    owner_id
                );
                None
            }
        })
        .collect();
    logger.log_filtering_results(fetched, candidates.len());
    Ok(candidates)
}
