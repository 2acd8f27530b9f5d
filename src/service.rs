// src/service.rs
use log::{debug, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::MergeError;
use crate::matching::CandidateFinder;
use crate::merge::{propose_plan, MergeExecutor, MergeJobTracker};
use crate::models::core::{Entity, EntityKind};
use crate::models::matching::{Candidate, SearchStrategy};
use crate::models::merge::{JobStatus, MergeJob, MergePlan};
use crate::store::{EntityStore, JobStore};
use crate::utils::logging::{MergeLogger, MergeOperation};
use crate::utils::merge_config::MergeConfig;
use crate::utils::retry::{poll_until, RetryPolicy};

/// Outcome counts for one worker pass over pending jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPass {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl WorkerPass {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// The merge API handed to the UI and automation layers.
pub struct MergeService<S: EntityStore + ?Sized, J: JobStore + ?Sized> {
    entities: Arc<S>,
    finder: CandidateFinder<S>,
    tracker: MergeJobTracker<J>,
    executor: MergeExecutor<S, J>,
    config: MergeConfig,
}

impl<S: EntityStore + ?Sized, J: JobStore + ?Sized> Clone for MergeService<S, J> {
    fn clone(&self) -> Self {
        Self {
            entities: Arc::clone(&self.entities),
            finder: self.finder.clone(),
            tracker: self.tracker.clone(),
            executor: self.executor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: EntityStore + ?Sized, J: JobStore + ?Sized> MergeService<S, J> {
    pub fn new(entities: Arc<S>, jobs: Arc<J>, config: MergeConfig) -> Self {
        Self {
            finder: CandidateFinder::new(Arc::clone(&entities), config.merged_category.clone()),
            tracker: MergeJobTracker::new(Arc::clone(&jobs))
                .with_claim_timeout(config.claim_timeout()),
            executor: MergeExecutor::new(Arc::clone(&entities), jobs, &config),
            entities,
            config,
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn tracker(&self) -> &MergeJobTracker<J> {
        &self.tracker
    }

    pub fn executor(&self) -> &MergeExecutor<S, J> {
        &self.executor
    }

    async fn load(&self, kind: EntityKind, id: &str) -> Result<Entity, MergeError> {
        self.entities
            .get_by_id(kind, id)
            .await?
            .ok_or_else(|| MergeError::EntityNotFound(kind, id.to_string()))
    }

    async fn load_source(&self, kind: EntityKind, id: &str) -> Result<Entity, MergeError> {
        match self.entities.get_by_id(kind, id).await {
            Ok(Some(source)) => Ok(source),
            Ok(None) => Err(MergeError::EntityNotFound(kind, id.to_string())),
            Err(e) => Err(MergeError::SearchFailed(e)),
        }
    }

    pub async fn find_candidates(
        &self,
        kind: EntityKind,
        entity_id: &str,
        strategy: SearchStrategy,
    ) -> Result<Vec<Candidate>, MergeError> {
        let source = self.load_source(kind, entity_id).await?;
        self.finder.find_candidates(&source, strategy).await
    }

    /// Bulk-scan variant of `find_candidates`: `None` when the source record
    /// has itself been merged away.
    pub async fn scan_candidates(
        &self,
        kind: EntityKind,
        entity_id: &str,
        strategy: SearchStrategy,
    ) -> Result<Option<Vec<Candidate>>, MergeError> {
        let source = self.load_source(kind, entity_id).await?;
        if source.is_merged(&self.config.merged_category) {
            debug!("{} {} was already merged away, not scanning it", kind, entity_id);
            return Ok(None);
        }
        self.finder.find_candidates(&source, strategy).await.map(Some)
    }

    /// Default plan for merging `candidate_id` into `entity_id`, for the
    /// operator to review and adjust before `submit_merge`.
    pub async fn propose_plan(
        &self,
        kind: EntityKind,
        entity_id: &str,
        candidate_id: &str,
    ) -> Result<MergePlan, MergeError> {
        let logger = MergeLogger::new(MergeOperation::Plan);
        logger.log_start(&format!("{} {} <- {}", kind, entity_id, candidate_id));
        let (source, candidate) =
            futures::try_join!(self.load(kind, entity_id), self.load(kind, candidate_id))?;
        let plan = propose_plan(&source, &candidate, &self.config)?;
        logger.log_completion(&format!(
            "{} field(s) from candidate",
            plan.candidate_fields().len()
        ));
        Ok(plan)
    }

    /// Records a reviewed plan; returns the pair's job id.
    pub async fn submit_merge(&self, plan: MergePlan) -> Result<Uuid, MergeError> {
        Ok(self.tracker.submit(plan).await?.job_id)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatus, MergeError> {
        self.tracker.get_status(job_id).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<MergeJob, MergeError> {
        self.tracker.get_job(job_id).await
    }

    /// Reads a job's status up to `policy.attempts` times (at least once),
    /// stopping early once it is terminal; returns the last status read.
    pub async fn wait_for_job(
        &self,
        job_id: Uuid,
        policy: RetryPolicy,
    ) -> Result<JobStatus, MergeError> {
        let reads = policy.attempts.max(1);
        let tracker = &self.tracker;
        let observed = poll_until(RetryPolicy::new(reads, policy.delay), |attempt| async move {
            let status = tracker.get_status(job_id).await?;
            debug!("Job {} is {} (read {}/{})", job_id, status, attempt, reads);
            Ok::<_, MergeError>((status.is_terminal() || attempt >= reads).then_some(status))
        })
        .await?;

        let status = match observed {
            Some(status) => status,
            None => tracker.get_status(job_id).await?,
        };
        if !status.is_terminal() {
            warn!("Job {} still {} after {} read(s)", job_id, status, reads);
        }
        Ok(status)
    }

    pub async fn execute_job(&self, job_id: Uuid) -> Result<MergeJob, MergeError> {
        self.executor.execute(job_id).await
    }

    /// One worker pass: runs up to `limit` pending jobs, oldest first.
    /// Failures are recorded on the jobs themselves and counted here.
    pub async fn process_pending(&self, limit: usize) -> Result<WorkerPass, MergeError> {
        let pending = self.tracker.list_pending(limit).await?;
        let mut pass = WorkerPass::default();
        if pending.is_empty() {
            return Ok(pass);
        }
        let logger = MergeLogger::new(MergeOperation::Worker);
        logger.log_data_loaded(pending.len(), "pending merge job");

        for job in pending {
            match self.executor.execute(job.job_id).await {
                Ok(done) if done.status == JobStatus::Completed => pass.completed += 1,
                Ok(_) => pass.skipped += 1,
                Err(MergeError::ExecutionFailure { step, message }) => {
                    logger.log_warning(&format!(
                        "job {} failed at {}: {}",
                        job.job_id, step, message
                    ));
                    pass.failed += 1;
                }
                Err(MergeError::ConcurrentJobConflict { .. }) => pass.skipped += 1,
                Err(e) => return Err(e),
            }
        }
        logger.log_completion(&format!(
            "{} completed, {} failed, {} skipped",
            pass.completed, pass.failed, pass.skipped
        ));
        Ok(pass)
    }
}
