// src/models/merge.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MergeError;
use crate::models::core::{EntityKind, FieldName, RelationKind};

/// Which side's value a scalar field keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldChoice {
    Source,
    Candidate,
}

impl FromStr for FieldChoice {
    type Err = MergeError;

    // "primary"/"duplicate" are the spellings the CRM screens send.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "source" | "primary" => Ok(FieldChoice::Source),
            "candidate" | "duplicate" => Ok(FieldChoice::Candidate),
            other => Err(MergeError::ValidationError(format!(
                "unknown field choice '{}'",
                other
            ))),
        }
    }
}

/// How a relationship set is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationStrategy {
    SourceOnly,
    CandidateOnly,
    Combine,
}

impl FromStr for RelationStrategy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "source_only" | "source" | "primary" => Ok(RelationStrategy::SourceOnly),
            "candidate_only" | "candidate" | "duplicate" => Ok(RelationStrategy::CandidateOnly),
            "combine" => Ok(RelationStrategy::Combine),
            other => Err(MergeError::ValidationError(format!(
                "unknown relationship strategy '{}'",
                other
            ))),
        }
    }
}

/// The reviewed set of field and relationship resolutions for merging
/// `candidate_id` into `source_id`.
///
/// Every field and relationship of `entity_kind` always has exactly one
/// selection: construction fills `Source` / `SourceOnly` and the selection
/// setters reject names that do not belong to the entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub entity_kind: EntityKind,
    pub source_id: String,
    pub candidate_id: String,
    field_selections: BTreeMap<FieldName, FieldChoice>,
    relationship_selections: BTreeMap<RelationKind, RelationStrategy>,
}

impl MergePlan {
    pub fn new(
        entity_kind: EntityKind,
        source_id: impl Into<String>,
        candidate_id: impl Into<String>,
    ) -> Result<Self, MergeError> {
        let source_id = source_id.into();
        let candidate_id = candidate_id.into();
        if source_id.trim().is_empty() || candidate_id.trim().is_empty() {
            return Err(MergeError::ValidationError(
                "merge plan needs both a source and a candidate id".to_string(),
            ));
        }
        if source_id == candidate_id {
            return Err(MergeError::ValidationError(format!(
                "cannot merge {} {} into itself",
                entity_kind, source_id
            )));
        }

        let field_selections = entity_kind
            .fields()
            .iter()
            .map(|f| (*f, FieldChoice::Source))
            .collect();
        let relationship_selections = entity_kind
            .relations()
            .iter()
            .map(|r| (*r, RelationStrategy::SourceOnly))
            .collect();

        Ok(Self {
            entity_kind,
            source_id,
            candidate_id,
            field_selections,
            relationship_selections,
        })
    }

    /// Builds a plan from the loosely-typed maps a UI submits, e.g.
    /// `{"first_name": "duplicate"}` and `{"tags": "combine"}`.
    pub fn from_raw_selections(
        entity_kind: EntityKind,
        source_id: impl Into<String>,
        candidate_id: impl Into<String>,
        fields: &HashMap<String, String>,
        relations: &HashMap<String, String>,
    ) -> Result<Self, MergeError> {
        let mut plan = Self::new(entity_kind, source_id, candidate_id)?;
        for (name, choice) in fields {
            plan.select_field(name.parse()?, choice.parse()?)?;
        }
        for (name, strategy) in relations {
            plan.select_relation(name.parse()?, strategy.parse()?)?;
        }
        Ok(plan)
    }

    pub fn select_field(
        &mut self,
        field: FieldName,
        choice: FieldChoice,
    ) -> Result<&mut Self, MergeError> {
        if !self.entity_kind.has_field(field) {
            return Err(MergeError::ValidationError(format!(
                "field '{}' does not exist on {}",
                field, self.entity_kind
            )));
        }
        self.field_selections.insert(field, choice);
        Ok(self)
    }

    pub fn select_relation(
        &mut self,
        relation: RelationKind,
        strategy: RelationStrategy,
    ) -> Result<&mut Self, MergeError> {
        if !self.entity_kind.has_relation(relation) {
            return Err(MergeError::ValidationError(format!(
                "relationship '{}' does not exist on {}",
                relation, self.entity_kind
            )));
        }
        self.relationship_selections.insert(relation, strategy);
        Ok(self)
    }

    pub fn field_choice(&self, field: FieldName) -> FieldChoice {
        self.field_selections
            .get(&field)
            .copied()
            .unwrap_or(FieldChoice::Source)
    }

    pub fn relation_strategy(&self, relation: RelationKind) -> RelationStrategy {
        self.relationship_selections
            .get(&relation)
            .copied()
            .unwrap_or(RelationStrategy::SourceOnly)
    }

    pub fn field_selections(&self) -> impl Iterator<Item = (FieldName, FieldChoice)> + '_ {
        self.field_selections.iter().map(|(f, c)| (*f, *c))
    }

    pub fn relationship_selections(
        &self,
    ) -> impl Iterator<Item = (RelationKind, RelationStrategy)> + '_ {
        self.relationship_selections.iter().map(|(r, s)| (*r, *s))
    }

    /// Fields whose value will be taken from the candidate.
    pub fn candidate_fields(&self) -> Vec<FieldName> {
        self.field_selections()
            .filter(|(_, c)| *c == FieldChoice::Candidate)
            .map(|(f, _)| f)
            .collect()
    }

    /// Re-checks the selection invariant, for plans read back from storage.
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.source_id == self.candidate_id {
            return Err(MergeError::ValidationError(format!(
                "cannot merge {} {} into itself",
                self.entity_kind, self.source_id
            )));
        }
        for field in self.field_selections.keys() {
            if !self.entity_kind.has_field(*field) {
                return Err(MergeError::ValidationError(format!(
                    "field '{}' does not exist on {}",
                    field, self.entity_kind
                )));
            }
        }
        for relation in self.relationship_selections.keys() {
            if !self.entity_kind.has_relation(*relation) {
                return Err(MergeError::ValidationError(format!(
                    "relationship '{}' does not exist on {}",
                    relation, self.entity_kind
                )));
            }
        }
        if self.field_selections.len() != self.entity_kind.fields().len()
            || self.relationship_selections.len() != self.entity_kind.relations().len()
        {
            return Err(MergeError::ValidationError(
                "merge plan is missing selections".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(MergeError::ValidationError(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Durable record of a merge request for one ordered entity pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeJob {
    pub job_id: Uuid,
    pub entity_kind: EntityKind,
    pub primary_entity_id: String,
    pub duplicate_entity_id: String,
    pub plan: MergePlan,
    pub status: JobStatus,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// When the current `processing` run claimed the job.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Compare-and-set token, bumped by the store on every successful write.
    pub version: i64,
}

impl MergeJob {
    pub fn new_pending(plan: MergePlan, detected_at: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            entity_kind: plan.entity_kind,
            primary_entity_id: plan.source_id.clone(),
            duplicate_entity_id: plan.candidate_id.clone(),
            plan,
            status: JobStatus::Pending,
            detected_at,
            resolved_at: None,
            error_message: None,
            claimed_at: None,
            version: 0,
        }
    }

    /// Uniqueness key: one job per kind and ordered pair.
    pub fn pair(&self) -> (EntityKind, &str, &str) {
        (self.entity_kind, &self.primary_entity_id, &self.duplicate_entity_id)
    }

    /// A `processing` job whose claim is older than `timeout` (or was never
    /// stamped) belongs to a worker that is gone.
    pub fn claim_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == JobStatus::Processing
            && self.claimed_at.map_or(true, |at| now - at >= timeout)
    }
}
