// src/lib.rs
//! Duplicate detection and merge resolution for CRM contacts and companies.
//!
//! The crate is organised leaf-first:
//! - `matching` finds candidate duplicates (name similarity, shared email, shared phone)
//! - `merge` plans, resolves, tracks and executes merges
//! - `store` holds the storage seams (`EntityStore`, `JobStore`) and their
//!   Postgres and in-memory implementations
//! - `service` is the API handed to the UI / automation layer

pub mod error;
pub mod matching;
pub mod merge;
pub mod models;
pub mod service;
pub mod store;
pub mod utils;

pub use error::{MergeError, StoreError};
pub use models::core::{Entity, EntityKind, FieldName, FieldValue, Relation, RelationKind};
pub use models::matching::{Candidate, MatchReason, SearchStrategy};
pub use models::merge::{FieldChoice, JobStatus, MergeJob, MergePlan, RelationStrategy};
pub use service::MergeService;
