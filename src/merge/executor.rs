// src/merge/executor.rs
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{MergeError, StoreError};
use crate::merge::resolver::{resolve, AssociationDiff};
use crate::models::core::{Entity, FieldName, FieldValue, Relation};
use crate::models::merge::{JobStatus, MergeJob, MergePlan, RelationStrategy};
use crate::store::{EntityStore, JobStore};
use crate::utils::logging::{MergeLogger, MergeOperation};
use crate::utils::merge_config::MergeConfig;
use crate::utils::retry::{poll_until, RetryPolicy};

/// The executor's steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    Load,
    Fields,
    Relationships,
    MarkDuplicate,
}

impl MergeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStep::Load => "load",
            MergeStep::Fields => "fields",
            MergeStep::Relationships => "relationships",
            MergeStep::MarkDuplicate => "mark_duplicate",
        }
    }
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct StepFailure {
    step: MergeStep,
    message: String,
}

impl StepFailure {
    fn new(step: MergeStep, message: impl fmt::Display) -> Self {
        Self {
            step,
            message: message.to_string(),
        }
    }

    fn store(step: MergeStep) -> impl FnOnce(StoreError) -> StepFailure {
        move |e| StepFailure::new(step, e)
    }

    fn into_error(self) -> MergeError {
        MergeError::ExecutionFailure {
            step: self.step.to_string(),
            message: self.message,
        }
    }
}

/// What one application of a plan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub fields_updated: usize,
    pub associations_added: usize,
    pub associations_removed: usize,
    pub duplicate_marked: bool,
}

impl ApplySummary {
    pub fn is_noop(&self) -> bool {
        self.fields_updated == 0
            && self.associations_added == 0
            && self.associations_removed == 0
            && !self.duplicate_marked
    }
}

/// Note appended to the duplicate's description once it is merged away.
pub fn merge_note(primary_id: &str) -> String {
    format!("Merged into {}", primary_id)
}

fn append_merge_note(description: Option<&str>, primary_id: &str) -> Option<String> {
    let note = merge_note(primary_id);
    match description {
        Some(existing) if existing.trim_end().ends_with(&note) => None,
        Some(existing) if !existing.trim().is_empty() => {
            Some(format!("{}\n{}", existing.trim_end(), note))
        }
        _ => Some(note),
    }
}

fn strip_merge_note(description: &str, primary_id: &str) -> String {
    let note = merge_note(primary_id);
    let trimmed = description.trim_end();
    trimmed
        .strip_suffix(&note)
        .map(|rest| rest.trim_end().to_string())
        .unwrap_or_else(|| description.to_string())
}

/// Applies merge plans against the entity store and drives the job state
/// machine `pending -> processing -> completed | failed`.
pub struct MergeExecutor<S: EntityStore + ?Sized, J: JobStore + ?Sized> {
    entities: Arc<S>,
    jobs: Arc<J>,
    merged_category: String,
    claim_timeout: Duration,
    write_retry: RetryPolicy,
}

impl<S: EntityStore + ?Sized, J: JobStore + ?Sized> Clone for MergeExecutor<S, J> {
    fn clone(&self) -> Self {
        Self {
            entities: Arc::clone(&self.entities),
            jobs: Arc::clone(&self.jobs),
            merged_category: self.merged_category.clone(),
            claim_timeout: self.claim_timeout,
            write_retry: self.write_retry,
        }
    }
}

impl<S: EntityStore + ?Sized, J: JobStore + ?Sized> MergeExecutor<S, J> {
    pub fn new(entities: Arc<S>, jobs: Arc<J>, config: &MergeConfig) -> Self {
        Self {
            entities,
            jobs,
            merged_category: config.merged_category.clone(),
            claim_timeout: config.claim_timeout(),
            write_retry: RetryPolicy::for_writes(config),
        }
    }

    /// Runs a pending job to a terminal state.
    ///
    /// `completed` and `failed` jobs are returned unchanged (a failed job has
    /// to be resubmitted first). A job another worker is running yields
    /// `ConcurrentJobConflict`; one whose claim has expired is taken over.
    /// On failure the job is recorded as `failed` with `"<step>: <cause>"`
    /// and `ExecutionFailure` is returned.
    pub async fn execute(&self, job_id: Uuid) -> Result<MergeJob, MergeError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(MergeError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Completed | JobStatus::Failed => {
                debug!("Job {} already {}, nothing to do", job_id, job.status);
                return Ok(job);
            }
            JobStatus::Processing if !job.claim_expired(Utc::now(), self.claim_timeout) => {
                return Err(MergeError::ConcurrentJobConflict {
                    primary_id: job.primary_entity_id,
                    duplicate_id: job.duplicate_entity_id,
                })
            }
            JobStatus::Processing => {
                warn!(
                    "Job {} claimed at {:?} never finished, taking it over",
                    job_id, job.claimed_at
                );
            }
            JobStatus::Pending => {}
        }

        let claimed = self.claim(job).await?;
        let logger = MergeLogger::new(MergeOperation::Execute);
        logger.log_start(&format!(
            "job {} ({} {} <- {})",
            claimed.job_id,
            claimed.entity_kind,
            claimed.primary_entity_id,
            claimed.duplicate_entity_id
        ));

        let plan = claimed.plan.clone();
        let outcome = match plan.validate() {
            Ok(()) => self.run_steps(&plan, &logger).await,
            Err(e) => Err(StepFailure::new(MergeStep::Load, e)),
        };

        match outcome {
            Ok(summary) => {
                let finished = self.finish(claimed, &plan, Ok(())).await?;
                logger.log_completion(&format!(
                    "{} field(s), +{} / -{} associations, job {}",
                    summary.fields_updated,
                    summary.associations_added,
                    summary.associations_removed,
                    finished.status
                ));
                Ok(finished)
            }
            Err(failure) => {
                let message = format!("{}: {}", failure.step, failure.message);
                logger.log_error(&format!("job {} failed at {}", claimed.job_id, message));
                self.finish(claimed, &plan, Err(message)).await?;
                Err(failure.into_error())
            }
        }
    }

    /// The three merge steps without any job bookkeeping. Safe to repeat:
    /// a second run against already-merged data writes nothing.
    pub async fn apply_plan(&self, plan: &MergePlan) -> Result<ApplySummary, MergeError> {
        plan.validate()?;
        let logger = MergeLogger::new(MergeOperation::Execute);
        self.run_steps(plan, &logger)
            .await
            .map_err(StepFailure::into_error)
    }

    async fn claim(&self, mut job: MergeJob) -> Result<MergeJob, MergeError> {
        job.status = JobStatus::Processing;
        job.claimed_at = Some(Utc::now());
        match self.jobs.update_job(&job).await {
            Ok(claimed) => Ok(claimed),
            Err(StoreError::Conflict(msg)) => {
                debug!("Claim of job {} lost the race: {}", job.job_id, msg);
                Err(MergeError::ConcurrentJobConflict {
                    primary_id: job.primary_entity_id,
                    duplicate_id: job.duplicate_entity_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records the terminal state, retrying transient store failures. If
    /// every attempt fails the job stays `processing` until its claim
    /// expires and it is taken over or resubmitted.
    async fn finish(
        &self,
        claimed: MergeJob,
        applied: &MergePlan,
        outcome: Result<(), String>,
    ) -> Result<MergeJob, MergeError> {
        let job_id = claimed.job_id;
        let claimed = &claimed;
        let outcome = &outcome;
        let recorded = poll_until(self.write_retry, |attempt| async move {
            match self.record_outcome(claimed, applied, outcome).await {
                Ok(stored) => Ok(Some(stored)),
                Err(MergeError::Store(e)) if e.is_transient() => {
                    warn!(
                        "Recording the outcome of job {} failed (attempt {}): {}",
                        job_id, attempt, e
                    );
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await?;

        recorded.ok_or_else(|| {
            MergeError::Store(StoreError::Unavailable(format!(
                "could not record the outcome of job {} after {} attempt(s)",
                job_id, self.write_retry.attempts
            )))
        })
    }

    /// One attempt at the terminal write. If the plan was resubmitted while
    /// this run was in flight the job goes back to `pending` so the new plan
    /// runs next.
    async fn record_outcome(
        &self,
        claimed: &MergeJob,
        applied: &MergePlan,
        outcome: &Result<(), String>,
    ) -> Result<MergeJob, MergeError> {
        let mut job = claimed.clone();
        Self::set_outcome(&mut job, outcome);
        match self.jobs.update_job(&job).await {
            Ok(stored) => return Ok(stored),
            Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut current = self
            .jobs
            .get_job(job.job_id)
            .await?
            .ok_or(MergeError::JobNotFound(job.job_id))?;
        if current.status.is_terminal() && current.plan == *applied {
            // an earlier attempt landed even though it reported an error
            debug!("Outcome of job {} already recorded", current.job_id);
            return Ok(current);
        }
        if current.status != JobStatus::Processing || current.claimed_at != claimed.claimed_at {
            return Err(MergeError::ConcurrentJobConflict {
                primary_id: current.primary_entity_id,
                duplicate_id: current.duplicate_entity_id,
            });
        }
        if current.plan != *applied {
            info!(
                "Plan for job {} changed while it ran, requeueing",
                current.job_id
            );
            current.status = JobStatus::Pending;
            current.resolved_at = None;
            current.error_message = None;
            current.claimed_at = None;
        } else {
            Self::set_outcome(&mut current, &outcome);
        }
        self.jobs.update_job(&current).await.map_err(|e| match e {
            StoreError::Conflict(_) => MergeError::ConcurrentJobConflict {
                primary_id: current.primary_entity_id.clone(),
                duplicate_id: current.duplicate_entity_id.clone(),
            },
            other => other.into(),
        })
    }

    fn set_outcome(job: &mut MergeJob, outcome: &Result<(), String>) {
        job.resolved_at = Some(Utc::now());
        job.claimed_at = None;
        match outcome {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.error_message = None;
            }
            Err(message) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.clone());
            }
        }
    }

    async fn run_steps(
        &self,
        plan: &MergePlan,
        logger: &MergeLogger,
    ) -> Result<ApplySummary, StepFailure> {
        let kind = plan.entity_kind;
        let (primary, duplicate) = futures::try_join!(
            self.entities.get_by_id(kind, &plan.source_id),
            self.entities.get_by_id(kind, &plan.candidate_id),
        )
        .map_err(StepFailure::store(MergeStep::Load))?;
        let primary = primary.ok_or_else(|| {
            StepFailure::new(MergeStep::Load, format!("{} {} not found", kind, plan.source_id))
        })?;
        let duplicate = duplicate.ok_or_else(|| {
            StepFailure::new(
                MergeStep::Load,
                format!("{} {} not found", kind, plan.candidate_id),
            )
        })?;

        let mut summary = ApplySummary::default();

        logger.log_phase(MergeStep::Fields.as_str(), None);
        summary.fields_updated = self.apply_fields(plan, &primary, &duplicate).await?;

        logger.log_phase(MergeStep::Relationships.as_str(), None);
        for relation in Relation::all_for(kind) {
            let strategy = plan.relation_strategy(relation.relation_kind());
            let (added, removed) = self
                .apply_relation(relation, strategy, &primary.id, &duplicate.id)
                .await?;
            if added > 0 || removed > 0 {
                logger.log_relation_applied(relation.table(), added, removed);
            }
            summary.associations_added += added;
            summary.associations_removed += removed;
        }

        logger.log_phase(MergeStep::MarkDuplicate.as_str(), None);
        summary.duplicate_marked = self.mark_duplicate(&primary.id, &duplicate).await?;
        Ok(summary)
    }

    /// Step 1: copy candidate-chosen values that differ from the primary's.
    async fn apply_fields(
        &self,
        plan: &MergePlan,
        primary: &Entity,
        duplicate: &Entity,
    ) -> Result<usize, StepFailure> {
        let mut patch: BTreeMap<FieldName, FieldValue> = BTreeMap::new();
        for field in plan.candidate_fields() {
            let mut value = duplicate.field(field).clone();
            match field {
                // the duplicate's own merge bookkeeping never flows back
                FieldName::Category if duplicate.is_merged(&self.merged_category) => continue,
                FieldName::Description => {
                    if let FieldValue::Text(text) = &value {
                        value = FieldValue::Text(strip_merge_note(text, &primary.id));
                    }
                }
                _ => {}
            }
            let current = primary.field(field);
            if value == *current || (value.is_empty() && current.is_empty()) {
                continue;
            }
            patch.insert(field, value);
        }
        if patch.is_empty() {
            return Ok(0);
        }
        self.entities
            .update(plan.entity_kind, &primary.id, &patch)
            .await
            .map_err(StepFailure::store(MergeStep::Fields))?;
        Ok(patch.len())
    }

    /// Step 2 for one relation: snapshot both sides, resolve by canonical
    /// value, write the minimal difference onto the primary.
    async fn apply_relation(
        &self,
        relation: Relation,
        strategy: RelationStrategy,
        primary_id: &str,
        duplicate_id: &str,
    ) -> Result<(usize, usize), StepFailure> {
        if strategy == RelationStrategy::SourceOnly {
            return Ok((0, 0));
        }
        let (primary_rows, duplicate_rows) = futures::try_join!(
            self.entities.list_associations(relation, primary_id),
            self.entities.list_associations(relation, duplicate_id),
        )
        .map_err(StepFailure::store(MergeStep::Relationships))?;

        // canonical value -> stored spellings
        let mut primary_by_key: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for stored in primary_rows {
            primary_by_key
                .entry(relation.canonical(&stored))
                .or_default()
                .push(stored);
        }
        let mut duplicate_by_key: BTreeMap<String, String> = BTreeMap::new();
        for stored in duplicate_rows {
            duplicate_by_key
                .entry(relation.canonical(&stored))
                .or_insert(stored);
        }

        let current: BTreeSet<String> = primary_by_key.keys().cloned().collect();
        let candidate: BTreeSet<String> = duplicate_by_key.keys().cloned().collect();
        let resolved = resolve(&current, &candidate, strategy);
        let diff = AssociationDiff::between(&current, &resolved, strategy);
        if diff.is_empty() {
            return Ok((0, 0));
        }

        let mut removed = 0;
        if !diff.to_remove.is_empty() {
            let rows: Vec<String> = diff
                .to_remove
                .iter()
                .filter_map(|key| primary_by_key.get(key))
                .flatten()
                .cloned()
                .collect();
            removed = self
                .entities
                .remove_associations(relation, primary_id, &rows)
                .await
                .map_err(StepFailure::store(MergeStep::Relationships))?;
        }
        let mut added = 0;
        if !diff.to_add.is_empty() {
            let rows: Vec<String> = diff
                .to_add
                .iter()
                .filter_map(|key| duplicate_by_key.get(key))
                .cloned()
                .collect();
            added = self
                .entities
                .add_associations(relation, primary_id, &rows)
                .await
                .map_err(StepFailure::store(MergeStep::Relationships))?;
        }
        Ok((added, removed))
    }

    /// Step 3: category becomes the merged sentinel and the description
    /// records where the record went. Returns whether anything was written.
    async fn mark_duplicate(
        &self,
        primary_id: &str,
        duplicate: &Entity,
    ) -> Result<bool, StepFailure> {
        let mut patch: BTreeMap<FieldName, FieldValue> = BTreeMap::new();
        if !duplicate.is_merged(&self.merged_category) {
            patch.insert(
                FieldName::Category,
                FieldValue::Text(self.merged_category.clone()),
            );
        }
        if let Some(description) =
            append_merge_note(duplicate.text(FieldName::Description), primary_id)
        {
            patch.insert(FieldName::Description, FieldValue::Text(description));
        }
        if patch.is_empty() {
            return Ok(false);
        }
        self.entities
            .update(duplicate.kind, &duplicate.id, &patch)
            .await
            .map_err(StepFailure::store(MergeStep::MarkDuplicate))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_note_appended_once() {
        assert_eq!(append_merge_note(None, "p1").as_deref(), Some("Merged into p1"));
        assert_eq!(
            append_merge_note(Some("VIP"), "p1").as_deref(),
            Some("VIP\nMerged into p1")
        );
        assert_eq!(append_merge_note(Some("VIP\nMerged into p1"), "p1"), None);
    }

    #[test]
    fn test_merge_note_stripped_before_copying_back() {
        assert_eq!(strip_merge_note("VIP\nMerged into p1", "p1"), "VIP");
        assert_eq!(strip_merge_note("Merged into p1", "p1"), "");
        assert_eq!(strip_merge_note("VIP", "p1"), "VIP");
    }
}
