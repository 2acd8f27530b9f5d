// src/merge/resolver.rs
use std::collections::BTreeSet;

use crate::models::merge::RelationStrategy;

/// Final relationship set for the source under `strategy`.
pub fn resolve(
    source: &BTreeSet<String>,
    candidate: &BTreeSet<String>,
    strategy: RelationStrategy,
) -> BTreeSet<String> {
    match strategy {
        RelationStrategy::SourceOnly => source.clone(),
        RelationStrategy::CandidateOnly => candidate.clone(),
        RelationStrategy::Combine => source.union(candidate).cloned().collect(),
    }
}

/// Minimal writes that turn the current association set into the resolved one.
///
/// Rows are only ever removed for `CandidateOnly`; the other strategies keep
/// everything the source already has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationDiff {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl AssociationDiff {
    pub fn between(
        current: &BTreeSet<String>,
        resolved: &BTreeSet<String>,
        strategy: RelationStrategy,
    ) -> Self {
        let to_add = resolved.difference(current).cloned().collect();
        let to_remove = match strategy {
            RelationStrategy::CandidateOnly => current.difference(resolved).cloned().collect(),
            RelationStrategy::SourceOnly | RelationStrategy::Combine => BTreeSet::new(),
        };
        Self { to_add, to_remove }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_combine_is_union_and_adds_only_missing() {
        let source = set(&["1", "2", "3"]);
        let candidate = set(&["2", "3", "4"]);
        let resolved = resolve(&source, &candidate, RelationStrategy::Combine);
        assert_eq!(resolved, set(&["1", "2", "3", "4"]));

        let diff = AssociationDiff::between(&source, &resolved, RelationStrategy::Combine);
        assert_eq!(diff.to_add, set(&["4"]));
        assert!(diff.to_remove.is_empty());
    }

    #[test]
    fn test_source_only_changes_nothing() {
        let source = set(&["1", "2"]);
        let resolved = resolve(&source, &set(&["9"]), RelationStrategy::SourceOnly);
        assert_eq!(resolved, source);
        assert!(AssociationDiff::between(&source, &resolved, RelationStrategy::SourceOnly).is_empty());
    }

    #[test]
    fn test_candidate_only_replaces() {
        let source = set(&["1", "2"]);
        let candidate = set(&["2", "5"]);
        let resolved = resolve(&source, &candidate, RelationStrategy::CandidateOnly);
        let diff = AssociationDiff::between(&source, &resolved, RelationStrategy::CandidateOnly);
        assert_eq!(diff.to_add, set(&["5"]));
        assert_eq!(diff.to_remove, set(&["1"]));
    }

    #[test]
    fn test_diff_against_already_applied_state_is_empty() {
        let current = set(&["1", "2", "4"]);
        let resolved = set(&["1", "2", "4"]);
        for strategy in [
            RelationStrategy::SourceOnly,
            RelationStrategy::CandidateOnly,
            RelationStrategy::Combine,
        ] {
            assert!(AssociationDiff::between(&current, &resolved, strategy).is_empty());
        }
    }
}
