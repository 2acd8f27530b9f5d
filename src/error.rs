// src/error.rs
use thiserror::Error;
use uuid::Uuid;

use crate::models::core::{EntityKind, FieldName};
use crate::models::matching::MatchReason;

/// Failures raised by an `EntityStore` or `JobStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint or compare-and-set precondition did not hold.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    InvalidValue(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Backend hiccups worth repeating the same write for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Pool(_) | StoreError::Postgres(_)
        )
    }
}

impl From<bb8::RunError<tokio_postgres::Error>> for StoreError {
    fn from(err: bb8::RunError<tokio_postgres::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => StoreError::Postgres(e),
            bb8::RunError::TimedOut => {
                StoreError::Pool("timed out waiting for a connection".to_string())
            }
        }
    }
}

/// Every condition the merge core reports to its caller.
///
/// Each variant is distinct so a UI can render specific guidance
/// ("add an email before searching" vs. "merge failed, retry").
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{entity_kind} {entity_id} has nothing to search with for {strategy:?}")]
    InsufficientSearchInput {
        entity_kind: EntityKind,
        entity_id: String,
        strategy: MatchReason,
    },

    #[error("validation error: {0}")]
    ValidationError(String),

    /// Reserved for field types that need more than a two-way choice. Not raised today.
    #[error("field {0} needs more than a two-way resolution")]
    AmbiguousField(FieldName),

    #[error("another merge request for ({primary_id}, {duplicate_id}) won the race; retry the submit")]
    ConcurrentJobConflict {
        primary_id: String,
        duplicate_id: String,
    },

    #[error("merge failed during {step}: {message}")]
    ExecutionFailure { step: String, message: String },

    #[error("candidate search failed: {0}")]
    SearchFailed(#[source] StoreError),

    #[error("{0} {1} not found")]
    EntityNotFound(EntityKind, String),

    #[error("merge job {0} not found")]
    JobNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MergeError {
    /// True when simply repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MergeError::ConcurrentJobConflict { .. }
                | MergeError::SearchFailed(_)
                | MergeError::ExecutionFailure { .. }
        )
    }

    /// Short operator-facing guidance for the condition.
    pub fn user_hint(&self) -> &'static str {
        match self {
            MergeError::InsufficientSearchInput { strategy, .. } => match strategy {
                MatchReason::NameSimilarity => "Add a name before searching for duplicates",
                MatchReason::SharedEmail => "Add an email before searching for duplicates",
                MatchReason::SharedPhone => "Add a phone number before searching for duplicates",
                MatchReason::SharedLinkedin => "Add a LinkedIn URL before searching for duplicates",
                MatchReason::SharedWebsite => "Add a website before searching for duplicates",
                MatchReason::SharedDomain => "Add a domain before searching for duplicates",
            },
            MergeError::ValidationError(_) | MergeError::AmbiguousField(_) => {
                "Review the merge selections"
            }
            MergeError::ConcurrentJobConflict { .. } => {
                "This merge was just updated elsewhere, submit it again"
            }
            MergeError::ExecutionFailure { .. } => "Merge failed, resubmit to retry",
            MergeError::SearchFailed(_) => "Duplicate search failed, try again",
            MergeError::EntityNotFound(..) | MergeError::JobNotFound(_) => {
                "The record no longer exists"
            }
            MergeError::Store(_) => "Storage error, try again later",
        }
    }
}
