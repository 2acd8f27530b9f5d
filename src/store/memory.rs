// src/store/memory.rs
//! Process-local `EntityStore` + `JobStore`.
//!
//! Backs the test suite and dry runs. Association rows are keyed by their
//! physical table so `ContactCompanies` and `CompanyContacts` see the same rows,
//! exactly as they do in Postgres.

use async_trait::async_trait;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::core::{Entity, EntityKind, FieldName, FieldValue, Relation, ValueType};
use crate::models::merge::{JobStatus, MergeJob};
use crate::store::{EntityStore, JobStore};

/// `(left, right)` in table column order, e.g. `(contact_id, company_id)`.
type Row = (String, String);

#[derive(Default)]
pub struct InMemoryStore {
    entities: RwLock<BTreeMap<EntityKind, BTreeMap<String, Entity>>>,
    associations: RwLock<BTreeMap<&'static str, BTreeSet<Row>>>,
    jobs: Mutex<BTreeMap<Uuid, MergeJob>>,
    fail_association_writes: AtomicBool,
    fail_reads: AtomicBool,
}

fn to_row(relation: Relation, owner_id: &str, related_id: &str) -> Row {
    match relation {
        Relation::CompanyContacts => (related_id.to_string(), owner_id.to_string()),
        _ => (owner_id.to_string(), related_id.to_string()),
    }
}

/// `(owner, related)` as seen from `relation`.
fn from_row(relation: Relation, row: &Row) -> (&str, &str) {
    match relation {
        Relation::CompanyContacts => (&row.1, &row.0),
        _ => (&row.0, &row.1),
    }
}

fn check_value(kind: EntityKind, field: FieldName, value: &FieldValue) -> Result<(), StoreError> {
    if !kind.has_field(field) {
        return Err(StoreError::InvalidValue(format!(
            "{} has no field {}",
            kind, field
        )));
    }
    let ok = matches!(
        (field.value_type(), value),
        (_, FieldValue::Null)
            | (ValueType::Text, FieldValue::Text(_))
            | (ValueType::Integer, FieldValue::Integer(_))
            | (ValueType::Date, FieldValue::Date(_))
    );
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidValue(format!(
            "{:?} is not a valid value for {}.{}",
            value, kind, field
        )))
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes association inserts and deletes fail with `StoreError::Unavailable`
    /// until switched off again.
    pub fn fail_association_writes(&self, fail: bool) {
        self.fail_association_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every entity and association read fail with
    /// `StoreError::Unavailable` until switched off again.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_readable(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads are failing".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, relation: Relation) -> Result<(), StoreError> {
        if self.fail_association_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "{} is not accepting writes",
                relation.table()
            )));
        }
        Ok(())
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, StoreError> {
        self.check_readable()?;
        let entities = self.entities.read().await;
        Ok(entities.get(&kind).and_then(|m| m.get(id)).cloned())
    }

    async fn query_by_equality(
        &self,
        kind: EntityKind,
        field: FieldName,
        value: &FieldValue,
    ) -> Result<Vec<Entity>, StoreError> {
        self.check_readable()?;
        let entities = self.entities.read().await;
        Ok(entities
            .get(&kind)
            .map(|m| {
                m.values()
                    .filter(|e| e.field(field) == value)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_by_like(
        &self,
        kind: EntityKind,
        field: FieldName,
        substring: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        self.check_readable()?;
        let needle = substring.to_lowercase();
        let entities = self.entities.read().await;
        Ok(entities
            .get(&kind)
            .map(|m| {
                m.values()
                    .filter(|e| match e.field(field) {
                        FieldValue::Text(s) => s.to_lowercase().contains(&needle),
                        _ => false,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_ids(
        &self,
        kind: EntityKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check_readable()?;
        let entities = self.entities.read().await;
        Ok(entities
            .get(&kind)
            .map(|m| m.keys().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StoreError> {
        for (field, value) in &entity.fields {
            check_value(entity.kind, *field, value)?;
        }
        let mut entities = self.entities.write().await;
        let table = entities.entry(entity.kind).or_default();
        if table.contains_key(&entity.id) {
            return Err(StoreError::Conflict(format!(
                "{} {} already exists",
                entity.kind, entity.id
            )));
        }
        table.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &BTreeMap<FieldName, FieldValue>,
    ) -> Result<(), StoreError> {
        for (field, value) in patch {
            check_value(kind, *field, value)?;
        }
        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(&kind)
            .and_then(|m| m.get_mut(id))
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", kind, id)))?;
        for (field, value) in patch {
            entity.fields.insert(*field, value.clone());
        }
        debug!("Updated {} field(s) on {} {}", patch.len(), kind, id);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let removed = {
            let mut entities = self.entities.write().await;
            entities.get_mut(&kind).and_then(|m| m.remove(id))
        };
        if removed.is_none() {
            return Err(StoreError::NotFound(format!("{} {}", kind, id)));
        }
        let mut associations = self.associations.write().await;
        for relation in Relation::all_for(kind) {
            if let Some(rows) = associations.get_mut(relation.table()) {
                rows.retain(|row| from_row(relation, row).0 != id);
            }
        }
        Ok(())
    }

    async fn list_associations(
        &self,
        relation: Relation,
        owner_id: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        self.check_readable()?;
        let associations = self.associations.read().await;
        Ok(associations
            .get(relation.table())
            .map(|rows| {
                rows.iter()
                    .map(|row| from_row(relation, row))
                    .filter(|(owner, _)| *owner == owner_id)
                    .map(|(_, related)| related.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_associations(
        &self,
        relation: Relation,
        owner_id: &str,
        related_ids: &[String],
    ) -> Result<usize, StoreError> {
        self.check_writable(relation)?;
        let mut associations = self.associations.write().await;
        let rows = associations.entry(relation.table()).or_default();
        Ok(related_ids
            .iter()
            .filter(|related| rows.insert(to_row(relation, owner_id, related)))
            .count())
    }

    async fn remove_associations(
        &self,
        relation: Relation,
        owner_id: &str,
        related_ids: &[String],
    ) -> Result<usize, StoreError> {
        self.check_writable(relation)?;
        let mut associations = self.associations.write().await;
        let Some(rows) = associations.get_mut(relation.table()) else {
            return Ok(0);
        };
        Ok(related_ids
            .iter()
            .filter(|related| rows.remove(&to_row(relation, owner_id, related)))
            .count())
    }

    async fn find_association_owners(
        &self,
        relation: Relation,
        canonical_values: &[String],
    ) -> Result<Vec<(String, String)>, StoreError> {
        self.check_readable()?;
        let wanted: BTreeSet<&str> = canonical_values.iter().map(String::as_str).collect();
        let associations = self.associations.read().await;
        Ok(associations
            .get(relation.table())
            .map(|rows| {
                rows.iter()
                    .map(|row| from_row(relation, row))
                    .filter(|(_, related)| wanted.contains(relation.canonical(related).as_str()))
                    .map(|(owner, related)| (owner.to_string(), related.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn find_job_for_pair(
        &self,
        kind: EntityKind,
        primary_id: &str,
        duplicate_id: &str,
    ) -> Result<Option<MergeJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .find(|j| j.pair() == (kind, primary_id, duplicate_id))
            .cloned())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<MergeJob>, StoreError> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn insert_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.job_id) || jobs.values().any(|j| j.pair() == job.pair()) {
            return Err(StoreError::Conflict(format!(
                "a merge job already exists for {:?}",
                job.pair()
            )));
        }
        let mut stored = job.clone();
        stored.version = 1;
        jobs.insert(stored.job_id, stored.clone());
        Ok(stored)
    }

    async fn update_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let existing = jobs
            .get(&job.job_id)
            .ok_or_else(|| StoreError::NotFound(format!("merge job {}", job.job_id)))?;
        if existing.version != job.version {
            return Err(StoreError::Conflict(format!(
                "merge job {} is at version {}, not {}",
                job.job_id, existing.version, job.version
            )));
        }
        if existing.pair() != job.pair() {
            return Err(StoreError::InvalidValue(format!(
                "merge job {} cannot change its kind or entity pair",
                job.job_id
            )));
        }
        let mut stored = job.clone();
        stored.version += 1;
        jobs.insert(stored.job_id, stored.clone());
        Ok(stored)
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<MergeJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<MergeJob> =
            jobs.values().filter(|j| j.status == status).cloned().collect();
        matching.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        matching.truncate(limit);
        Ok(matching)
    }
}
