// src/merge/planner.rs
use log::debug;

use crate::error::MergeError;
use crate::models::core::{Entity, FieldName};
use crate::models::merge::{FieldChoice, MergePlan, RelationStrategy};
use crate::utils::merge_config::MergeConfig;

/// Proposes a reviewable plan for merging `candidate` into `source`.
///
/// Fields keep the source value unless the source is empty and the candidate
/// is not, or the source category is still the unset sentinel and the
/// candidate has a real one. Relationships default to `Combine` so nothing is
/// lost unless the operator says otherwise. Nothing is applied here.
pub fn propose_plan(
    source: &Entity,
    candidate: &Entity,
    config: &MergeConfig,
) -> Result<MergePlan, MergeError> {
    if source.kind != candidate.kind {
        return Err(MergeError::ValidationError(format!(
            "cannot merge {} {} into {} {}",
            candidate.kind, candidate.id, source.kind, source.id
        )));
    }
    let mut plan = MergePlan::new(source.kind, source.id.clone(), candidate.id.clone())?;

    for field in source.kind.fields() {
        let choice = default_choice(*field, source, candidate, config);
        if choice == FieldChoice::Candidate {
            debug!("Proposing candidate value for {} on {}", field, source.id);
        }
        plan.select_field(*field, choice)?;
    }
    for relation in source.kind.relations() {
        plan.select_relation(*relation, RelationStrategy::Combine)?;
    }
    Ok(plan)
}

fn default_choice(
    field: FieldName,
    source: &Entity,
    candidate: &Entity,
    config: &MergeConfig,
) -> FieldChoice {
    let source_value = source.field(field);
    let candidate_value = candidate.field(field);

    if field == FieldName::Category {
        let source_unset = source
            .category()
            .map(|c| config.is_unset_category(c))
            .unwrap_or(true);
        let candidate_real = candidate
            .category()
            .map(|c| !config.is_unset_category(c) && !config.is_merged_category(c))
            .unwrap_or(false);
        return if source_unset && candidate_real {
            FieldChoice::Candidate
        } else {
            FieldChoice::Source
        };
    }

    if source_value.is_empty() && !candidate_value.is_empty() {
        FieldChoice::Candidate
    } else {
        FieldChoice::Source
    }
}
