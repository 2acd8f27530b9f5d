// src/merge/tracker.rs
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{MergeError, StoreError};
use crate::models::merge::{JobStatus, MergeJob, MergePlan};
use crate::store::JobStore;
use crate::utils::logging::{MergeLogger, MergeOperation};
use crate::utils::merge_config::MergeConfig;

/// Persists merge requests, one job per ordered (primary, duplicate) pair.
pub struct MergeJobTracker<J: JobStore + ?Sized> {
    store: Arc<J>,
    claim_timeout: Duration,
}

impl<J: JobStore + ?Sized> Clone for MergeJobTracker<J> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            claim_timeout: self.claim_timeout,
        }
    }
}

fn conflict(plan: &MergePlan) -> MergeError {
    MergeError::ConcurrentJobConflict {
        primary_id: plan.source_id.clone(),
        duplicate_id: plan.candidate_id.clone(),
    }
}

impl<J: JobStore + ?Sized> MergeJobTracker<J> {
    pub fn new(store: Arc<J>) -> Self {
        Self {
            store,
            claim_timeout: MergeConfig::default().claim_timeout(),
        }
    }

    /// How long a `processing` claim is honoured before a resubmission may
    /// take the job back.
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Records `plan` for its pair and returns the job now holding it.
    ///
    /// A new pair gets a `pending` job. A job still `pending`/`processing`
    /// keeps its status and takes the new plan, unless its processing claim
    /// has expired. A `completed`/`failed` job, or one whose worker went
    /// away, is reset to `pending` with the new plan. Losing a race to
    /// another submit for the same pair is reported as
    /// `ConcurrentJobConflict`.
    pub async fn submit(&self, plan: MergePlan) -> Result<MergeJob, MergeError> {
        plan.validate()?;
        let logger = MergeLogger::new(MergeOperation::Submit);
        logger.log_start(&format!(
            "{} {} <- {}",
            plan.entity_kind, plan.source_id, plan.candidate_id
        ));

        let existing = self
            .store
            .find_job_for_pair(plan.entity_kind, &plan.source_id, &plan.candidate_id)
            .await?;
        let now = Utc::now();

        let job = match existing {
            None => {
                let job = MergeJob::new_pending(plan.clone(), now);
                match self.store.insert_job(&job).await {
                    Ok(stored) => {
                        info!("Created merge job {} for {:?}", stored.job_id, stored.pair());
                        stored
                    }
                    Err(StoreError::Conflict(msg)) => {
                        debug!("Insert lost the race for the pair: {}", msg);
                        return Err(conflict(&plan));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(mut job) => {
                let previous = job.status;
                let abandoned = job.claim_expired(now, self.claim_timeout);
                if abandoned {
                    warn!(
                        "Job {} was claimed at {:?} and never finished, requeueing",
                        job.job_id, job.claimed_at
                    );
                }
                if previous.is_terminal() || abandoned {
                    job.status = JobStatus::Pending;
                    job.resolved_at = None;
                    job.error_message = None;
                    job.claimed_at = None;
                }
                job.plan = plan.clone();
                job.detected_at = now;
                match self.store.update_job(&job).await {
                    Ok(stored) => {
                        info!(
                            "Updated merge job {} ({} -> {})",
                            stored.job_id, previous, stored.status
                        );
                        stored
                    }
                    Err(StoreError::Conflict(msg)) => {
                        debug!("Update of job {} lost the race: {}", job.job_id, msg);
                        return Err(conflict(&plan));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        logger.log_completion(&format!("job {} is {}", job.job_id, job.status));
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<MergeJob, MergeError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(MergeError::JobNotFound(job_id))
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatus, MergeError> {
        Ok(self.get_job(job_id).await?.status)
    }

    pub async fn list_pending(&self, limit: usize) -> Result<Vec<MergeJob>, MergeError> {
        Ok(self
            .store
            .list_jobs_by_status(JobStatus::Pending, limit)
            .await?)
    }
}
