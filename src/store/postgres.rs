// src/store/postgres.rs
//! `EntityStore` + `JobStore` over the CRM Postgres database.
//!
//! Column and table names come from the closed `FieldName` / `Relation`
//! enums, so they are interpolated into SQL; every value is a bound parameter.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info};
use std::collections::{BTreeMap, BTreeSet};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::core::{Entity, EntityKind, FieldName, FieldValue, Relation, ValueType};
use crate::models::merge::{JobStatus, MergeJob, MergePlan};
use crate::store::{EntityStore, JobStore};
use crate::utils::db_connect::PgPool;

type Params = Vec<Box<dyn ToSql + Sync + Send>>;

const JOB_COLUMNS: &str = "job_id, entity_kind, primary_entity_id, duplicate_entity_id, plan, \
     status, detected_at, resolved_at, error_message, claimed_at, version";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn as_params(params: &Params) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn select_columns(kind: EntityKind) -> String {
    std::iter::once("id")
        .chain(kind.fields().iter().map(|f| f.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Boxes a field value for binding, with a typed NULL for the column.
fn bind_value(field: FieldName, value: &FieldValue) -> Result<Box<dyn ToSql + Sync + Send>, StoreError> {
    let boxed: Box<dyn ToSql + Sync + Send> = match (field.value_type(), value) {
        (ValueType::Text, FieldValue::Text(s)) => Box::new(s.clone()),
        (ValueType::Text, FieldValue::Null) => Box::new(None::<String>),
        (ValueType::Integer, FieldValue::Integer(v)) => {
            let v = i32::try_from(*v).map_err(|_| {
                StoreError::InvalidValue(format!("{} out of range for {}", v, field))
            })?;
            Box::new(v)
        }
        (ValueType::Integer, FieldValue::Null) => Box::new(None::<i32>),
        (ValueType::Date, FieldValue::Date(d)) => Box::new(*d),
        (ValueType::Date, FieldValue::Null) => Box::new(None::<NaiveDate>),
        (_, other) => {
            return Err(StoreError::InvalidValue(format!(
                "{:?} is not a valid value for {}",
                other, field
            )))
        }
    };
    Ok(boxed)
}

fn entity_from_row(kind: EntityKind, row: &Row) -> Result<Entity, StoreError> {
    let mut entity = Entity::new(kind, row.try_get::<_, String>("id")?);
    for field in kind.fields() {
        let column = field.as_str();
        let value = match field.value_type() {
            ValueType::Text => FieldValue::from(row.try_get::<_, Option<String>>(column)?),
            ValueType::Integer => {
                FieldValue::from(row.try_get::<_, Option<i32>>(column)?.map(i64::from))
            }
            ValueType::Date => FieldValue::from(row.try_get::<_, Option<NaiveDate>>(column)?),
        };
        entity.fields.insert(*field, value);
    }
    Ok(entity)
}

fn check_field(kind: EntityKind, field: FieldName) -> Result<(), StoreError> {
    if kind.has_field(field) {
        Ok(())
    } else {
        Err(StoreError::InvalidValue(format!("{} has no field {}", kind, field)))
    }
}

/// SQL expression producing the canonical form of a related value,
/// matching `Relation::canonical`.
fn canonical_sql(relation: Relation) -> String {
    let column = relation.related_column();
    match relation {
        Relation::ContactEmails => format!("lower(trim({}))", column),
        Relation::ContactMobiles => format!(r"regexp_replace({}, '[\s\-\(\)\.]', '', 'g')", column),
        Relation::CompanyDomains => format!(
            r"split_part(split_part(regexp_replace(lower(trim({})), '^(https?://)?(www\.)?', ''), '/', 1), ':', 1)",
            column
        ),
        _ => format!("trim({})", column),
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', r"\\").replace('%', r"\%").replace('_', r"\_")
}

fn job_from_row(row: &Row) -> Result<MergeJob, StoreError> {
    let kind: String = row.try_get("entity_kind")?;
    let status: String = row.try_get("status")?;
    let plan: serde_json::Value = row.try_get("plan")?;
    let plan: MergePlan = serde_json::from_value(plan)?;
    Ok(MergeJob {
        job_id: row.try_get("job_id")?,
        entity_kind: kind
            .parse()
            .map_err(|e| StoreError::InvalidValue(format!("{}", e)))?,
        primary_entity_id: row.try_get("primary_entity_id")?,
        duplicate_entity_id: row.try_get("duplicate_entity_id")?,
        plan,
        status: status
            .parse()
            .map_err(|e| StoreError::InvalidValue(format!("{}", e)))?,
        detected_at: row.try_get::<_, DateTime<Utc>>("detected_at")?,
        resolved_at: row.try_get::<_, Option<DateTime<Utc>>>("resolved_at")?,
        error_message: row.try_get("error_message")?,
        claimed_at: row.try_get::<_, Option<DateTime<Utc>>>("claimed_at")?,
        version: row.try_get("version")?,
    })
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates `merge_jobs` if it does not exist yet. The CRM tables are
    /// owned by the CRM itself and are never created here.
    pub async fn ensure_merge_job_table(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS merge_jobs (
                job_id uuid PRIMARY KEY,
                entity_kind text NOT NULL,
                primary_entity_id text NOT NULL,
                duplicate_entity_id text NOT NULL,
                plan jsonb NOT NULL,
                status text NOT NULL DEFAULT 'pending',
                detected_at timestamptz NOT NULL DEFAULT now(),
                resolved_at timestamptz,
                error_message text,
                claimed_at timestamptz,
                version bigint NOT NULL DEFAULT 1,
                UNIQUE (entity_kind, primary_entity_id, duplicate_entity_id)
            );
            ALTER TABLE merge_jobs ADD COLUMN IF NOT EXISTS claimed_at timestamptz;
            CREATE INDEX IF NOT EXISTS merge_jobs_status_idx
                ON merge_jobs (status, detected_at);",
        )
        .await?;
        info!("merge_jobs table is ready");
        Ok(())
    }

    async fn query_entities(
        &self,
        kind: EntityKind,
        where_clause: &str,
        params: Params,
    ) -> Result<Vec<Entity>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id",
            select_columns(kind),
            kind.table(),
            where_clause
        );
        let conn = self.pool.get().await?;
        let rows = conn.query(sql.as_str(), &as_params(&params)).await.map_err(|e| {
            error!("Entity query on {} failed: {}", kind.table(), e);
            e
        })?;
        rows.iter().map(|row| entity_from_row(kind, row)).collect()
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, StoreError> {
        let params: Params = vec![Box::new(id.to_string())];
        Ok(self
            .query_entities(kind, "id = $1", params)
            .await?
            .into_iter()
            .next())
    }

    async fn query_by_equality(
        &self,
        kind: EntityKind,
        field: FieldName,
        value: &FieldValue,
    ) -> Result<Vec<Entity>, StoreError> {
        check_field(kind, field)?;
        if matches!(value, FieldValue::Null) {
            let clause = format!("{} IS NULL", field.as_str());
            return self.query_entities(kind, &clause, Vec::new()).await;
        }
        let clause = format!("{} = $1", field.as_str());
        self.query_entities(kind, &clause, vec![bind_value(field, value)?])
            .await
    }

    async fn query_by_like(
        &self,
        kind: EntityKind,
        field: FieldName,
        substring: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        check_field(kind, field)?;
        if field.value_type() != ValueType::Text {
            return Err(StoreError::InvalidValue(format!(
                "{} is not a text field",
                field
            )));
        }
        let clause = format!("{} ILIKE $1", field.as_str());
        let pattern = format!("%{}%", escape_like(substring.trim()));
        self.query_entities(kind, &clause, vec![Box::new(pattern)])
            .await
    }

    async fn list_ids(
        &self,
        kind: EntityKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, StoreError> {
        let sql = format!("SELECT id FROM {} ORDER BY id LIMIT $1 OFFSET $2", kind.table());
        let conn = self.pool.get().await?;
        let rows = conn
            .query(sql.as_str(), &[&(limit as i64), &(offset as i64)])
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>("id").map_err(StoreError::from))
            .collect()
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StoreError> {
        let mut columns = vec!["id"];
        let mut params: Params = vec![Box::new(entity.id.clone())];
        for (field, value) in &entity.fields {
            check_field(entity.kind, *field)?;
            columns.push(field.as_str());
            params.push(bind_value(*field, value)?);
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            entity.kind.table(),
            columns.join(", "),
            placeholders.join(", ")
        );
        let conn = self.pool.get().await?;
        match conn.execute(sql.as_str(), &as_params(&params)).await {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "{} {} already exists",
                entity.kind, entity.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &BTreeMap<FieldName, FieldValue>,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut assignments = Vec::with_capacity(patch.len());
        let mut params: Params = vec![Box::new(id.to_string())];
        for (field, value) in patch {
            check_field(kind, *field)?;
            params.push(bind_value(*field, value)?);
            assignments.push(format!("{} = ${}", field.as_str(), params.len()));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE id = $1",
            kind.table(),
            assignments.join(", ")
        );
        let conn = self.pool.get().await?;
        let updated = conn.execute(sql.as_str(), &as_params(&params)).await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("{} {}", kind, id)));
        }
        debug!("Updated {} field(s) on {} {}", patch.len(), kind, id);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", kind.table());
        let conn = self.pool.get().await?;
        let deleted = conn.execute(sql.as_str(), &[&id]).await?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("{} {}", kind, id)));
        }
        Ok(())
    }

    async fn list_associations(
        &self,
        relation: Relation,
        owner_id: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        let sql = format!(
            "SELECT {related} FROM {table} WHERE {owner} = $1",
            related = relation.related_column(),
            table = relation.table(),
            owner = relation.owner_column()
        );
        let conn = self.pool.get().await?;
        let rows = conn.query(sql.as_str(), &[&owner_id]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(StoreError::from))
            .collect()
    }

    async fn add_associations(
        &self,
        relation: Relation,
        owner_id: &str,
        related_ids: &[String],
    ) -> Result<usize, StoreError> {
        if related_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {table} ({owner}, {related})
             SELECT DISTINCT $1::text, x FROM unnest($2::text[]) AS x
             ON CONFLICT ({owner}, {related}) DO NOTHING",
            table = relation.table(),
            owner = relation.owner_column(),
            related = relation.related_column()
        );
        let conn = self.pool.get().await?;
        let inserted = conn.execute(sql.as_str(), &[&owner_id, &related_ids]).await?;
        debug!(
            "{}: inserted {} of {} row(s) for {}",
            relation.table(),
            inserted,
            related_ids.len(),
            owner_id
        );
        Ok(inserted as usize)
    }

    async fn remove_associations(
        &self,
        relation: Relation,
        owner_id: &str,
        related_ids: &[String],
    ) -> Result<usize, StoreError> {
        if related_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {table} WHERE {owner} = $1 AND {related} = ANY($2)",
            table = relation.table(),
            owner = relation.owner_column(),
            related = relation.related_column()
        );
        let conn = self.pool.get().await?;
        let removed = conn.execute(sql.as_str(), &[&owner_id, &related_ids]).await?;
        Ok(removed as usize)
    }

    async fn find_association_owners(
        &self,
        relation: Relation,
        canonical_values: &[String],
    ) -> Result<Vec<(String, String)>, StoreError> {
        if canonical_values.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {owner}, {related} FROM {table}
             WHERE {canonical} = ANY($1)
             ORDER BY {owner}, {related}",
            owner = relation.owner_column(),
            related = relation.related_column(),
            table = relation.table(),
            canonical = canonical_sql(relation)
        );
        let conn = self.pool.get().await?;
        let rows = conn.query(sql.as_str(), &[&canonical_values]).await?;
        rows.iter()
            .map(|row| -> Result<(String, String), StoreError> {
                Ok((row.try_get(0)?, row.try_get(1)?))
            })
            .collect()
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn find_job_for_pair(
        &self,
        kind: EntityKind,
        primary_id: &str,
        duplicate_id: &str,
    ) -> Result<Option<MergeJob>, StoreError> {
        let sql = format!(
            "SELECT {} FROM merge_jobs
             WHERE entity_kind = $1 AND primary_entity_id = $2 AND duplicate_entity_id = $3",
            JOB_COLUMNS
        );
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(sql.as_str(), &[&kind.as_str(), &primary_id, &duplicate_id])
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<MergeJob>, StoreError> {
        let sql = format!("SELECT {} FROM merge_jobs WHERE job_id = $1", JOB_COLUMNS);
        let conn = self.pool.get().await?;
        let row = conn.query_opt(sql.as_str(), &[&job_id]).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn insert_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError> {
        let plan_json = serde_json::to_value(&job.plan)?;
        let sql = format!(
            "INSERT INTO merge_jobs (
                job_id, entity_kind, primary_entity_id, duplicate_entity_id, plan,
                status, detected_at, resolved_at, error_message, claimed_at, version
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1)
             ON CONFLICT (entity_kind, primary_entity_id, duplicate_entity_id) DO NOTHING
             RETURNING {}",
            JOB_COLUMNS
        );
        let params: Params = vec![
            Box::new(job.job_id),
            Box::new(job.entity_kind.as_str().to_string()),
            Box::new(job.primary_entity_id.clone()),
            Box::new(job.duplicate_entity_id.clone()),
            Box::new(plan_json),
            Box::new(job.status.as_str().to_string()),
            Box::new(job.detected_at),
            Box::new(job.resolved_at),
            Box::new(job.error_message.clone()),
            Box::new(job.claimed_at),
        ];
        let conn = self.pool.get().await?;
        let row = match conn.query_opt(sql.as_str(), &as_params(&params)).await {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => None,
            Err(e) => return Err(e.into()),
        };
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::Conflict(format!(
                "a merge job already exists for {} ({}, {})",
                job.entity_kind, job.primary_entity_id, job.duplicate_entity_id
            ))),
        }
    }

    async fn update_job(&self, job: &MergeJob) -> Result<MergeJob, StoreError> {
        let plan_json = serde_json::to_value(&job.plan)?;
        let sql = format!(
            "UPDATE merge_jobs SET
                plan = $2,
                status = $3,
                detected_at = $4,
                resolved_at = $5,
                error_message = $6,
                claimed_at = $10,
                version = version + 1
             WHERE job_id = $1 AND version = $7
               AND primary_entity_id = $8 AND duplicate_entity_id = $9
               AND entity_kind = $11
             RETURNING {}",
            JOB_COLUMNS
        );
        let params: Params = vec![
            Box::new(job.job_id),
            Box::new(plan_json),
            Box::new(job.status.as_str().to_string()),
            Box::new(job.detected_at),
            Box::new(job.resolved_at),
            Box::new(job.error_message.clone()),
            Box::new(job.version),
            Box::new(job.primary_entity_id.clone()),
            Box::new(job.duplicate_entity_id.clone()),
            Box::new(job.claimed_at),
            Box::new(job.entity_kind.as_str().to_string()),
        ];
        let conn = self.pool.get().await?;
        if let Some(row) = conn.query_opt(sql.as_str(), &as_params(&params)).await? {
            return job_from_row(&row);
        }

        let current = conn
            .query_opt("SELECT version FROM merge_jobs WHERE job_id = $1", &[&job.job_id])
            .await?;
        match current {
            Some(row) => {
                let version: i64 = row.try_get(0)?;
                Err(StoreError::Conflict(format!(
                    "merge job {} is at version {}, not {}",
                    job.job_id, version, job.version
                )))
            }
            None => Err(StoreError::NotFound(format!("merge job {}", job.job_id))),
        }
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<MergeJob>, StoreError> {
        let sql = format!(
            "SELECT {} FROM merge_jobs WHERE status = $1
             ORDER BY detected_at, job_id LIMIT $2",
            JOB_COLUMNS
        );
        let conn = self.pool.get().await?;
        let rows = conn
            .query(sql.as_str(), &[&status.as_str(), &(limit as i64)])
            .await?;
        rows.iter().map(job_from_row).collect()
    }
}
