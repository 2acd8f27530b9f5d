// src/store/mod.rs
//! Storage seams for the merge core.
//!
//! `EntityStore` is the minimal record-store capability the CRM tables offer
//! (lookup, filter, insert/update/delete, association rows). `JobStore`
//! persists `MergeJob` records and is where the one-job-per-pair invariant is
//! enforced atomically. `postgres` implements both over the CRM database;
//! `memory` implements both in process.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::core::{Entity, EntityKind, FieldName, FieldValue, Relation};
use crate::models::merge::{JobStatus, MergeJob};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, StoreError>;

    async fn query_by_equality(
        &self,
        kind: EntityKind,
        field: FieldName,
        value: &FieldValue,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Case-insensitive substring match on a text field.
    async fn query_by_like(
        &self,
        kind: EntityKind,
        field: FieldName,
        substring: &str,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Ids in a stable order, for bulk scans.
    async fn list_ids(
        &self,
        kind: EntityKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, StoreError>;

    async fn insert(&self, entity: &Entity) -> Result<(), StoreError>;

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &BTreeMap<FieldName, FieldValue>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// Related ids (as stored) for one owner.
    async fn list_associations(
        &self,
        relation: Relation,
        owner_id: &str,
    ) -> Result<BTreeSet<String>, StoreError>;

    /// Bulk insert of association rows. Rows already present are skipped;
    /// returns the number actually inserted.
    async fn add_associations(
        &self,
        relation: Relation,
        owner_id: &str,
        related_ids: &[String],
    ) -> Result<usize, StoreError>;

    /// Returns the number of rows removed.
    async fn remove_associations(
        &self,
        relation: Relation,
        owner_id: &str,
        related_ids: &[String],
    ) -> Result<usize, StoreError>;

    /// `(owner_id, stored_value)` rows whose canonical related value
    /// (see `Relation::canonical`) is one of `canonical_values`.
    async fn find_association_owners(
        &self,
        relation: Relation,
        canonical_values: &[String],
    ) -> Result<Vec<(String, String)>, StoreError>;

    /// Makes the owner's association set equal `final_ids` with the fewest writes.
    async fn replace_associations(
        &self,
        relation: Relation,
        owner_id: &str,
        final_ids: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let current = self.list_associations(relation, owner_id).await?;
        let to_remove: Vec<String> = current.difference(final_ids).cloned().collect();
        let to_add: Vec<String> = final_ids.difference(&current).cloned().collect();
        if !to_remove.is_empty() {
            self.remove_associations(relation, owner_id, &to_remove).await?;
        }
        if !to_add.is_empty() {
            self.add_associations(relation, owner_id, &to_add).await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_job_for_pair(
        &self,
        kind: EntityKind,
        primary_id: &str,
        duplicate_id: &str,
    ) -> Result<Option<MergeJob>, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<MergeJob>, StoreError>;

    /// Inserts a new job. `StoreError::Conflict` if the kind and pair already
    /// have one.
    async fn insert_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError>;

    /// Compare-and-set write: succeeds only while the stored version equals
    /// `job.version`, returning the stored job with its bumped version.
    /// `StoreError::Conflict` otherwise.
    async fn update_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError>;

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<MergeJob>, StoreError>;
}
