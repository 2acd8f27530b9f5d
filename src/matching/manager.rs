// src/matching/manager.rs - Dispatches a duplicate search to the right strategy
use log::info;
use std::sync::Arc;

use crate::error::MergeError;
use crate::matching::contact_point::find_contact_point_candidates;
use crate::matching::name::find_name_candidates;
use crate::matching::url::find_url_candidates;
use crate::models::core::Entity;
use crate::models::matching::{Candidate, SearchStrategy};
use crate::store::EntityStore;
use crate::utils::logging::{MergeLogger, MergeOperation};

/// Read-only duplicate search over an `EntityStore`.
///
/// Never writes and never retries; store failures surface as
/// `MergeError::SearchFailed`.
pub struct CandidateFinder<S: EntityStore + ?Sized> {
    store: Arc<S>,
    merged_category: String,
}

impl<S: EntityStore + ?Sized> Clone for CandidateFinder<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            merged_category: self.merged_category.clone(),
        }
    }
}

impl<S: EntityStore + ?Sized> CandidateFinder<S> {
    pub fn new(store: Arc<S>, merged_category: impl Into<String>) -> Self {
        Self {
            store,
            merged_category: merged_category.into(),
        }
    }

    pub async fn find_candidates(
        &self,
        source: &Entity,
        strategy: SearchStrategy,
    ) -> Result<Vec<Candidate>, MergeError> {
        let logger = MergeLogger::new(MergeOperation::Search(strategy));
        logger.log_start(&format!("{} {}", source.kind, source.id));

        let result = match strategy {
            SearchStrategy::NameSimilarity => {
                find_name_candidates(self.store.as_ref(), source, &self.merged_category, &logger)
                    .await
            }
            SearchStrategy::SharedEmail
            | SearchStrategy::SharedPhone
            | SearchStrategy::SharedDomain => {
                find_contact_point_candidates(
                    self.store.as_ref(),
                    source,
                    strategy,
                    &self.merged_category,
                    &logger,
                )
                .await
            }
            SearchStrategy::SharedLinkedin | SearchStrategy::SharedWebsite => {
                find_url_candidates(
                    self.store.as_ref(),
                    source,
                    strategy,
                    &self.merged_category,
                    &logger,
                )
                .await
            }
        };

        match &result {
            Ok(candidates) => {
                logger.log_completion(&format!("{} candidate(s)", candidates.len()));
                if let Some(best) = candidates.first() {
                    info!(
                        "Best {} candidate for {}: {} ({:.2})",
                        strategy,
                        source.id,
                        best.entity.id,
                        best.score
                    );
                }
            }
            Err(MergeError::InsufficientSearchInput { .. }) => {
                logger.log_warning(&format!("{} has nothing to search with", source.id));
            }
            Err(e) => logger.log_error(&format!("search failed: {}", e)),
        }
        result
    }
}
