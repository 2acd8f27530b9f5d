// tests/merge_flow.rs
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use dedupe_lib::matching::CandidateFinder;
use dedupe_lib::merge::ApplySummary;
use dedupe_lib::store::{EntityStore, InMemoryStore, JobStore};
use dedupe_lib::utils::merge_config::MergeConfig;
use dedupe_lib::utils::retry::RetryPolicy;
use dedupe_lib::{
    Entity, EntityKind, FieldChoice, FieldName, JobStatus, MatchReason, MergeError, MergeJob,
    MergePlan, MergeService, Relation, RelationKind, RelationStrategy, StoreError,
};

type Service = MergeService<InMemoryStore, InMemoryStore>;

fn setup() -> (Arc<InMemoryStore>, Service) {
    let store = Arc::new(InMemoryStore::new());
    let service = MergeService::new(store.clone(), store.clone(), MergeConfig::default());
    (store, service)
}

fn contact(id: &str, first: &str, last: &str) -> Entity {
    Entity::new(EntityKind::Contact, id)
        .with_field(FieldName::FirstName, first)
        .with_field(FieldName::LastName, last)
        .with_field(FieldName::Category, "Inbox")
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

async fn seed(store: &InMemoryStore, entity: Entity) {
    store.insert(&entity).await.unwrap();
}

async fn link(store: &InMemoryStore, relation: Relation, owner: &str, related: &[&str]) {
    store
        .add_associations(relation, owner, &ids(related))
        .await
        .unwrap();
}

fn plan_with_tags(strategy: RelationStrategy) -> MergePlan {
    let mut plan = MergePlan::new(EntityKind::Contact, "c1", "c2").unwrap();
    plan.select_relation(RelationKind::Tags, strategy).unwrap();
    plan
}

#[tokio::test]
async fn test_name_search_keeps_close_spellings_only() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    seed(&store, contact("c3", "Amy", "Jones")).await;
    seed(
        &store,
        contact("c4", "Jon", "Smith").with_field(FieldName::Category, "Skip"),
    )
    .await;

    let candidates = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::NameSimilarity)
        .await
        .unwrap();

    let found: Vec<&str> = candidates.iter().map(|c| c.entity.id.as_str()).collect();
    assert_eq!(found, vec!["c2"]);
    assert_eq!(candidates[0].reason, MatchReason::NameSimilarity);
    assert!(candidates[0].score >= 0.75);
}

#[tokio::test]
async fn test_company_name_search_ignores_legal_suffix() {
    let (store, service) = setup();
    seed(
        &store,
        Entity::new(EntityKind::Company, "co1").with_field(FieldName::Name, "Acme Ltd"),
    )
    .await;
    seed(
        &store,
        Entity::new(EntityKind::Company, "co2").with_field(FieldName::Name, "ACME"),
    )
    .await;
    seed(
        &store,
        Entity::new(EntityKind::Company, "co3").with_field(FieldName::Name, "Globex"),
    )
    .await;

    let candidates = service
        .find_candidates(EntityKind::Company, "co1", MatchReason::NameSimilarity)
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].entity.id, "co2");
    assert_eq!(candidates[0].score, 1.0);
}

#[tokio::test]
async fn test_contact_without_emails_cannot_search_by_email() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;

    let err = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::SharedEmail)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MergeError::InsufficientSearchInput {
            strategy: MatchReason::SharedEmail,
            ..
        }
    ));

    seed(
        &store,
        Entity::new(EntityKind::Company, "co1").with_field(FieldName::Name, "Acme"),
    )
    .await;
    let err = service
        .find_candidates(EntityKind::Company, "co1", MatchReason::SharedPhone)
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::ValidationError(_)));
}

#[tokio::test]
async fn test_shared_email_merge_end_to_end() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Ann", "Lee")).await;
    seed(&store, contact("c2", "Annie", "Lee")).await;
    link(&store, Relation::ContactEmails, "c1", &["a@x.com"]).await;
    link(&store, Relation::ContactEmails, "c2", &[" A@X.com"]).await;
    link(&store, Relation::ContactTags, "c1", &["t1"]).await;
    link(&store, Relation::ContactTags, "c2", &["t2"]).await;

    let candidates = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::SharedEmail)
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].entity.id, "c2");
    assert_eq!(candidates[0].score, 1.0);
    assert_eq!(candidates[0].matched_value.as_deref(), Some(" A@X.com"));

    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();
    assert_eq!(service.get_job_status(job_id).await.unwrap(), JobStatus::Pending);

    let job = service.execute_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.resolved_at.is_some());

    let tags = store
        .list_associations(Relation::ContactTags, "c1")
        .await
        .unwrap();
    assert_eq!(tags, set(&["t1", "t2"]));

    let duplicate = store.get_by_id(EntityKind::Contact, "c2").await.unwrap().unwrap();
    assert_eq!(duplicate.category(), Some("Skip"));
    assert_eq!(duplicate.text(FieldName::Description), Some("Merged into c1"));

    // merged records drop out of later searches
    let again = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::SharedEmail)
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_combine_inserts_only_missing_rows() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    link(&store, Relation::ContactTags, "c1", &["1", "2", "3"]).await;
    link(&store, Relation::ContactTags, "c2", &["2", "3", "4"]).await;

    let plan = plan_with_tags(RelationStrategy::Combine);
    let summary = service.executor().apply_plan(&plan).await.unwrap();
    assert_eq!(summary.associations_added, 1);
    assert_eq!(summary.associations_removed, 0);
    assert!(summary.duplicate_marked);
    assert_eq!(
        store.list_associations(Relation::ContactTags, "c1").await.unwrap(),
        set(&["1", "2", "3", "4"])
    );

    let second = service.executor().apply_plan(&plan).await.unwrap();
    assert_eq!(second, ApplySummary::default());
    assert!(second.is_noop());
}

#[tokio::test]
async fn test_source_only_leaves_source_relations_alone() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    link(&store, Relation::ContactTags, "c1", &["1", "2"]).await;
    link(&store, Relation::ContactTags, "c2", &["3"]).await;

    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::SourceOnly))
        .await
        .unwrap();
    service.execute_job(job_id).await.unwrap();

    assert_eq!(
        store.list_associations(Relation::ContactTags, "c1").await.unwrap(),
        set(&["1", "2"])
    );
    assert_eq!(
        store.list_associations(Relation::ContactTags, "c2").await.unwrap(),
        set(&["3"])
    );
}

#[tokio::test]
async fn test_candidate_only_replaces_contact_points() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    link(&store, Relation::ContactMobiles, "c1", &["333 111 2222", "+39 444 5555555"]).await;
    link(&store, Relation::ContactMobiles, "c2", &["3331112222"]).await;

    let mut plan = MergePlan::new(EntityKind::Contact, "c1", "c2").unwrap();
    plan.select_relation(RelationKind::Mobiles, RelationStrategy::CandidateOnly)
        .unwrap();
    let summary = service.executor().apply_plan(&plan).await.unwrap();

    // "333 111 2222" and "3331112222" are the same number, so only the other one goes
    assert_eq!(summary.associations_removed, 1);
    assert_eq!(summary.associations_added, 0);
    assert_eq!(
        store.list_associations(Relation::ContactMobiles, "c1").await.unwrap(),
        set(&["333 111 2222"])
    );
}

#[tokio::test]
async fn test_candidate_field_values_copied_to_primary() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(
        &store,
        contact("c2", "John", "Smith")
            .with_field(FieldName::JobRole, "CTO")
            .with_field(FieldName::Category, "Client"),
    )
    .await;

    let plan = service
        .propose_plan(EntityKind::Contact, "c1", "c2")
        .await
        .unwrap();
    assert_eq!(plan.field_choice(FieldName::JobRole), FieldChoice::Candidate);
    assert_eq!(plan.field_choice(FieldName::Category), FieldChoice::Candidate);
    assert_eq!(plan.field_choice(FieldName::FirstName), FieldChoice::Source);

    let mut plan = plan;
    plan.select_field(FieldName::FirstName, FieldChoice::Candidate)
        .unwrap();
    let job_id = service.submit_merge(plan).await.unwrap();
    service.execute_job(job_id).await.unwrap();

    let primary = store.get_by_id(EntityKind::Contact, "c1").await.unwrap().unwrap();
    assert_eq!(primary.text(FieldName::FirstName), Some("John"));
    assert_eq!(primary.text(FieldName::JobRole), Some("CTO"));
    assert_eq!(primary.category(), Some("Client"));
}

#[tokio::test]
async fn test_propose_plan_for_missing_record() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    let err = service
        .propose_plan(EntityKind::Contact, "c1", "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::EntityNotFound(EntityKind::Contact, ref id) if id == "nope"));
}

#[tokio::test]
async fn test_double_submit_keeps_one_job_with_latest_plan() {
    let (store, service) = setup();
    let first = service
        .submit_merge(plan_with_tags(RelationStrategy::SourceOnly))
        .await
        .unwrap();
    let second = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(store.job_count().await, 1);
    let job = service.get_job(first).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(
        job.plan.relation_strategy(RelationKind::Tags),
        RelationStrategy::Combine
    );
}

#[tokio::test]
async fn test_concurrent_submits_never_create_two_jobs() {
    let (store, service) = setup();
    let (a, b) = tokio::join!(
        service.submit_merge(plan_with_tags(RelationStrategy::Combine)),
        service.submit_merge(plan_with_tags(RelationStrategy::SourceOnly)),
    );
    let results = [a, b];
    assert!(results.iter().any(|r| r.is_ok()));
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, MergeError::ConcurrentJobConflict { .. }));
        }
    }
    assert_eq!(store.job_count().await, 1);
}

#[tokio::test]
async fn test_reexecution_is_idempotent() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(
        &store,
        contact("c2", "John", "Smith").with_field(FieldName::Description, "met at expo"),
    )
    .await;
    link(&store, Relation::ContactTags, "c1", &["1"]).await;
    link(&store, Relation::ContactTags, "c2", &["2"]).await;

    let mut plan = plan_with_tags(RelationStrategy::Combine);
    plan.select_field(FieldName::Description, FieldChoice::Candidate)
        .unwrap();
    let job_id = service.submit_merge(plan.clone()).await.unwrap();
    let first = service.execute_job(job_id).await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    let primary_after_first = store.get_by_id(EntityKind::Contact, "c1").await.unwrap();
    let duplicate_after_first = store.get_by_id(EntityKind::Contact, "c2").await.unwrap();

    // a completed job is left alone
    let unchanged = service.execute_job(job_id).await.unwrap();
    assert_eq!(unchanged.version, first.version);

    // resubmitting the same plan runs it again without further changes
    service.submit_merge(plan).await.unwrap();
    let rerun = service.execute_job(job_id).await.unwrap();
    assert_eq!(rerun.status, JobStatus::Completed);

    assert_eq!(
        store.get_by_id(EntityKind::Contact, "c1").await.unwrap(),
        primary_after_first
    );
    assert_eq!(
        store.get_by_id(EntityKind::Contact, "c2").await.unwrap(),
        duplicate_after_first
    );
    assert_eq!(
        store.list_associations(Relation::ContactTags, "c1").await.unwrap(),
        set(&["1", "2"])
    );
    let primary = primary_after_first.unwrap();
    assert_eq!(primary.text(FieldName::Description), Some("met at expo"));
}

#[tokio::test]
async fn test_failed_execution_is_recorded_and_resubmit_resets() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    link(&store, Relation::ContactTags, "c2", &["t9"]).await;

    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    store.fail_association_writes(true);
    let err = service.execute_job(job_id).await.unwrap_err();
    match &err {
        MergeError::ExecutionFailure { step, .. } => assert_eq!(step, "relationships"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_retryable());

    let failed = service.get_job(job_id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    let message = failed.error_message.unwrap_or_default();
    assert!(message.starts_with("relationships:"), "{}", message);

    // failed jobs are not retried until resubmitted
    let still_failed = service.execute_job(job_id).await.unwrap();
    assert_eq!(still_failed.status, JobStatus::Failed);

    store.fail_association_writes(false);
    service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();
    let reset = service.get_job(job_id).await.unwrap();
    assert_eq!(reset.status, JobStatus::Pending);
    assert!(reset.error_message.is_none());

    let pass = service.process_pending(10).await.unwrap();
    assert_eq!(pass.completed, 1);
    assert_eq!(
        store.list_associations(Relation::ContactTags, "c1").await.unwrap(),
        set(&["t9"])
    );
}

#[tokio::test]
async fn test_polling_stops_at_terminal_state() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    let status = service
        .wait_for_job(job_id, RetryPolicy::immediate(3))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Pending);

    service.execute_job(job_id).await.unwrap();
    let status = service
        .wait_for_job(job_id, RetryPolicy::immediate(3))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Completed);
}

#[tokio::test]
async fn test_company_merge_combines_contacts() {
    let (store, service) = setup();
    seed(
        &store,
        Entity::new(EntityKind::Company, "co1").with_field(FieldName::Name, "Acme"),
    )
    .await;
    seed(
        &store,
        Entity::new(EntityKind::Company, "co2")
            .with_field(FieldName::Name, "Acme Ltd")
            .with_field(FieldName::Description, "EU branch"),
    )
    .await;
    link(&store, Relation::ContactCompanies, "c1", &["co1"]).await;
    link(&store, Relation::ContactCompanies, "c2", &["co2"]).await;

    let plan = service
        .propose_plan(EntityKind::Company, "co1", "co2")
        .await
        .unwrap();
    assert_eq!(
        plan.relation_strategy(RelationKind::Contacts),
        RelationStrategy::Combine
    );
    let job_id = service.submit_merge(plan).await.unwrap();
    service.execute_job(job_id).await.unwrap();

    assert_eq!(
        store.list_associations(Relation::CompanyContacts, "co1").await.unwrap(),
        set(&["c1", "c2"])
    );
    let duplicate = store.get_by_id(EntityKind::Company, "co2").await.unwrap().unwrap();
    assert_eq!(duplicate.category(), Some("Skip"));
    assert_eq!(
        duplicate.text(FieldName::Description),
        Some("EU branch\nMerged into co1")
    );
}

/// Job store over `InMemoryStore` that can fail terminal writes, swap in a
/// newer plan right before the executor records its outcome, and count reads.
struct ScriptedJobs {
    inner: Arc<InMemoryStore>,
    failing_terminal_writes: AtomicU32,
    replan_before_finish: Mutex<Option<MergePlan>>,
    reads: AtomicUsize,
}

impl ScriptedJobs {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            failing_terminal_writes: AtomicU32::new(0),
            replan_before_finish: Mutex::new(None),
            reads: AtomicUsize::new(0),
        }
    }

    fn fail_terminal_writes(&self, count: u32) {
        self.failing_terminal_writes.store(count, Ordering::SeqCst);
    }

    fn replan_before_finish(&self, plan: MergePlan) {
        *self.replan_before_finish.lock().unwrap() = Some(plan);
    }
}

#[async_trait]
impl JobStore for ScriptedJobs {
    async fn find_job_for_pair(
        &self,
        kind: EntityKind,
        primary_id: &str,
        duplicate_id: &str,
    ) -> Result<Option<MergeJob>, StoreError> {
        self.inner.find_job_for_pair(kind, primary_id, duplicate_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<MergeJob>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_job(job_id).await
    }

    async fn insert_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError> {
        self.inner.insert_job(job).await
    }

    async fn update_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError> {
        if job.status.is_terminal() {
            let replan = self.replan_before_finish.lock().unwrap().take();
            if let Some(plan) = replan {
                let mut current = self.inner.get_job(job.job_id).await?.unwrap();
                current.plan = plan;
                self.inner.update_job(&current).await?;
            }
            let failing = self.failing_terminal_writes.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_terminal_writes.store(failing - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
        }
        self.inner.update_job(job).await
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<MergeJob>, StoreError> {
        self.inner.list_jobs_by_status(status, limit).await
    }
}

type ScriptedService = MergeService<InMemoryStore, ScriptedJobs>;

fn quick_config() -> MergeConfig {
    MergeConfig {
        write_retry_attempts: 2,
        write_retry_delay_ms: 0,
        ..MergeConfig::default()
    }
}

async fn scripted_setup(
    config: MergeConfig,
) -> (Arc<InMemoryStore>, Arc<ScriptedJobs>, ScriptedService) {
    let store = Arc::new(InMemoryStore::new());
    let jobs = Arc::new(ScriptedJobs::new(store.clone()));
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    link(&store, Relation::ContactTags, "c2", &["t2"]).await;
    let service = MergeService::new(store.clone(), jobs.clone(), config);
    (store, jobs, service)
}

#[tokio::test]
async fn test_transient_final_write_failure_is_retried() {
    let (store, jobs, service) = scripted_setup(quick_config()).await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    jobs.fail_terminal_writes(1);
    let job = service.execute_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.claimed_at.is_none());
    assert_eq!(jobs.failing_terminal_writes.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.list_associations(Relation::ContactTags, "c1").await.unwrap(),
        set(&["t2"])
    );
}

#[tokio::test]
async fn test_unrecorded_outcome_is_recovered_after_claim_expires() {
    let (store, jobs, service) = scripted_setup(quick_config()).await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    jobs.fail_terminal_writes(5);
    let err = service.execute_job(job_id).await.unwrap_err();
    assert!(
        matches!(err, MergeError::Store(StoreError::Unavailable(_))),
        "{:?}",
        err
    );
    let stuck = service.get_job(job_id).await.unwrap();
    assert_eq!(stuck.status, JobStatus::Processing);
    assert!(stuck.claimed_at.is_some());

    // the claim is still fresh under the default timeout
    let err = service.execute_job(job_id).await.unwrap_err();
    assert!(matches!(err, MergeError::ConcurrentJobConflict { .. }));
    let pass = service.process_pending(10).await.unwrap();
    assert_eq!(pass.total(), 0);

    jobs.fail_terminal_writes(0);
    let expiring = MergeService::new(
        store.clone(),
        jobs.clone(),
        MergeConfig {
            claim_timeout_secs: 0,
            ..quick_config()
        },
    );
    let job = expiring.execute_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        store.list_associations(Relation::ContactTags, "c1").await.unwrap(),
        set(&["t2"])
    );
}

#[tokio::test]
async fn test_abandoned_job_is_requeued_by_resubmit() {
    let (_store, jobs, service) = scripted_setup(MergeConfig {
        claim_timeout_secs: 0,
        ..quick_config()
    })
    .await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();
    jobs.fail_terminal_writes(5);
    service.execute_job(job_id).await.unwrap_err();
    jobs.fail_terminal_writes(0);

    service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();
    let requeued = service.get_job(job_id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert!(requeued.claimed_at.is_none());

    let pass = service.process_pending(10).await.unwrap();
    assert_eq!(pass.completed, 1);
}

#[tokio::test]
async fn test_plan_changed_mid_run_goes_back_to_pending() {
    let (store, jobs, service) = scripted_setup(quick_config()).await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    let newer = plan_with_tags(RelationStrategy::SourceOnly);
    jobs.replan_before_finish(newer.clone());
    let job = service.execute_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.plan, newer);
    assert!(job.claimed_at.is_none());
    assert!(job.resolved_at.is_none());

    // the claimed plan already ran; the newer one runs on the next pass
    assert_eq!(
        store.list_associations(Relation::ContactTags, "c1").await.unwrap(),
        set(&["t2"])
    );
    let pass = service.process_pending(10).await.unwrap();
    assert_eq!(pass.completed, 1);
    assert_eq!(
        service.get_job_status(job_id).await.unwrap(),
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_execute_on_running_job_conflicts() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    let mut running = store.get_job(job_id).await.unwrap().unwrap();
    running.status = JobStatus::Processing;
    running.claimed_at = Some(chrono::Utc::now());
    store.update_job(&running).await.unwrap();

    let err = service.execute_job(job_id).await.unwrap_err();
    assert!(
        matches!(err, MergeError::ConcurrentJobConflict { ref primary_id, .. } if primary_id == "c1"),
        "{:?}",
        err
    );
    assert!(err.is_retryable());
    assert_eq!(
        service.get_job_status(job_id).await.unwrap(),
        JobStatus::Processing
    );
}

#[tokio::test]
async fn test_resubmit_while_running_keeps_processing() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();
    let mut running = store.get_job(job_id).await.unwrap().unwrap();
    running.status = JobStatus::Processing;
    running.claimed_at = Some(chrono::Utc::now());
    store.update_job(&running).await.unwrap();

    let newer = plan_with_tags(RelationStrategy::CandidateOnly);
    let same_id = service.submit_merge(newer.clone()).await.unwrap();
    assert_eq!(same_id, job_id);
    let job = service.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.plan, newer);
}

#[tokio::test]
async fn test_read_failures_surface_as_search_failed() {
    let (store, service) = setup();
    let source = contact("c1", "Jon", "Smith");
    seed(&store, source.clone()).await;
    seed(&store, contact("c2", "John", "Smith")).await;
    link(&store, Relation::ContactEmails, "c1", &["jon@x.com"]).await;

    store.fail_reads(true);
    let err = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::NameSimilarity)
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::SearchFailed(_)), "{:?}", err);
    assert!(err.is_retryable());

    let finder = CandidateFinder::new(store.clone(), "Skip");
    for strategy in [MatchReason::NameSimilarity, MatchReason::SharedEmail] {
        let err = finder.find_candidates(&source, strategy).await.unwrap_err();
        assert!(matches!(err, MergeError::SearchFailed(_)), "{:?}", err);
    }

    store.fail_reads(false);
    let found = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::NameSimilarity)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_contact_linkedin_search_ignores_case_and_padding() {
    let (store, service) = setup();
    seed(
        &store,
        contact("c1", "Jon", "Smith").with_field(FieldName::Linkedin, "https://linkedin.com/in/jsmith"),
    )
    .await;
    seed(
        &store,
        contact("c2", "J", "S").with_field(FieldName::Linkedin, "https://linkedin.com/in/jsmith"),
    )
    .await;
    seed(
        &store,
        contact("c3", "Jon", "Smith").with_field(FieldName::Linkedin, "https://linkedin.com/in/other"),
    )
    .await;
    seed(&store, contact("c4", "Jon", "Smith")).await;

    let candidates = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::SharedLinkedin)
        .await
        .unwrap();
    let found: Vec<&str> = candidates.iter().map(|c| c.entity.id.as_str()).collect();
    assert_eq!(found, vec!["c2"]);
    assert_eq!(candidates[0].score, 1.0);
    assert_eq!(candidates[0].reason, MatchReason::SharedLinkedin);

    let err = service
        .find_candidates(EntityKind::Contact, "c4", MatchReason::SharedLinkedin)
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::InsufficientSearchInput { .. }));
}

#[tokio::test]
async fn test_company_website_and_domain_search() {
    let (store, service) = setup();
    let company = |id: &str, website: &str| {
        Entity::new(EntityKind::Company, id)
            .with_field(FieldName::Name, "Acme")
            .with_field(FieldName::Website, website)
            .with_field(FieldName::Category, "Inbox")
    };
    seed(&store, company("co1", "https://acme.io")).await;
    seed(&store, company("co2", "https://acme.io")).await;
    seed(&store, company("co3", "https://acme.com")).await;
    link(&store, Relation::CompanyDomains, "co1", &["acme.io"]).await;
    link(&store, Relation::CompanyDomains, "co3", &["www.Acme.io"]).await;

    let by_site = service
        .find_candidates(EntityKind::Company, "co1", MatchReason::SharedWebsite)
        .await
        .unwrap();
    let found: Vec<&str> = by_site.iter().map(|c| c.entity.id.as_str()).collect();
    assert_eq!(found, vec!["co2"]);

    let by_domain = service
        .find_candidates(EntityKind::Company, "co1", MatchReason::SharedDomain)
        .await
        .unwrap();
    let found: Vec<&str> = by_domain.iter().map(|c| c.entity.id.as_str()).collect();
    assert_eq!(found, vec!["co3"]);
    assert_eq!(by_domain[0].matched_value.as_deref(), Some("www.Acme.io"));

    seed(&store, contact("c1", "Jon", "Smith")).await;
    let err = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::SharedWebsite)
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::ValidationError(_)), "{:?}", err);
    let err = service
        .find_candidates(EntityKind::Contact, "c1", MatchReason::SharedDomain)
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::ValidationError(_)), "{:?}", err);
}

#[tokio::test]
async fn test_scan_skips_records_already_merged_away() {
    let (store, service) = setup();
    seed(&store, contact("c1", "Jon", "Smith")).await;
    seed(
        &store,
        contact("c2", "John", "Smith").with_field(FieldName::Category, "Skip"),
    )
    .await;

    let from_merged = service
        .scan_candidates(EntityKind::Contact, "c2", MatchReason::NameSimilarity)
        .await
        .unwrap();
    assert!(from_merged.is_none());

    let from_live = service
        .scan_candidates(EntityKind::Contact, "c1", MatchReason::NameSimilarity)
        .await
        .unwrap();
    assert_eq!(from_live.map(|found| found.len()), Some(0));
}

#[tokio::test]
async fn test_wait_for_job_reads_at_most_attempts_times() {
    let (_store, jobs, service) = scripted_setup(quick_config()).await;
    let job_id = service
        .submit_merge(plan_with_tags(RelationStrategy::Combine))
        .await
        .unwrap();

    jobs.reads.store(0, Ordering::SeqCst);
    let status = service
        .wait_for_job(job_id, RetryPolicy::immediate(3))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Pending);
    assert_eq!(jobs.reads.load(Ordering::SeqCst), 3);

    jobs.reads.store(0, Ordering::SeqCst);
    service
        .wait_for_job(job_id, RetryPolicy::immediate(0))
        .await
        .unwrap();
    assert_eq!(jobs.reads.load(Ordering::SeqCst), 1);

    service.execute_job(job_id).await.unwrap();
    jobs.reads.store(0, Ordering::SeqCst);
    let status = service
        .wait_for_job(job_id, RetryPolicy::immediate(3))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(jobs.reads.load(Ordering::SeqCst), 1);
}
