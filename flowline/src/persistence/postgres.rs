use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{PersistenceConfig, StoreConfig};
use crate::error::{FlowError, Result};
use crate::job::{ErrorEntry, JobId, JobRecord};
use crate::lock::{LockHandle, LockProvider};
use crate::store::record::{decode_ids, decode_timestamp, encode_ids, encode_timestamp};
use crate::store::{PayloadValue, WorkflowStore};
use crate::workflow::{Workflow, WorkflowId};

/// Tables used by [`PostgresStore`] and [`PostgresLockProvider`].
///
/// Timestamps on job rows are epoch seconds with microsecond precision.
/// Every row carries `expires_at`; reads ignore rows past it and
/// [`PostgresStore::purge_expired`] deletes them.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flowline_workflows (
    id            UUID PRIMARY KEY,
    workflow_type TEXT NOT NULL,
    job_ids       TEXT NOT NULL DEFAULT '',
    expires_at    TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS flowline_jobs (
    id          UUID PRIMARY KEY,
    workflow_id UUID NOT NULL,
    job_type    TEXT NOT NULL,
    args        JSONB,
    before_ids  TEXT,
    after_ids   TEXT,
    enqueued_at DOUBLE PRECISION,
    started_at  DOUBLE PRECISION,
    finished_at DOUBLE PRECISION,
    error_at    DOUBLE PRECISION,
    failed_at   DOUBLE PRECISION,
    errors      JSONB,
    expires_at  TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS flowline_jobs_workflow_idx ON flowline_jobs (workflow_id);

CREATE TABLE IF NOT EXISTS flowline_payloads (
    workflow_id UUID NOT NULL,
    name        TEXT NOT NULL,
    value       TEXT NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (workflow_id, name)
);

CREATE TABLE IF NOT EXISTS flowline_locks (
    key        TEXT PRIMARY KEY,
    token      UUID NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
"#;

/// Create the flowline tables if they do not exist.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(FlowError::store)?;
    info!("flowline schema applied");
    Ok(())
}

/// Open a connection pool sized by `config`.
pub async fn connect(config: &PersistenceConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.connection_string)
        .await
        .map_err(FlowError::store)
}

fn ttl_secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

/// PostgreSQL-backed [`WorkflowStore`].
///
/// `save_workflow` runs in a single transaction, so a failed job write
/// leaves nothing behind.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
    ttl: Duration,
}

impl PostgresStore {
    pub fn new(pool: PgPool, config: &StoreConfig) -> Self {
        Self {
            pool,
            ttl: config.ttl(),
        }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete rows whose TTL has elapsed. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let mut removed = 0;
        for table in ["flowline_jobs", "flowline_workflows", "flowline_payloads", "flowline_locks"] {
            let done = sqlx::query(&format!("DELETE FROM {table} WHERE expires_at <= NOW()"))
                .execute(&self.pool)
                .await
                .map_err(FlowError::store)?;
            removed += done.rows_affected();
        }
        if removed > 0 {
            debug!(removed, "purged expired rows");
        }
        Ok(removed)
    }

    async fn upsert_job<'e, E>(executor: E, job: &JobRecord, ttl: Duration) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        let args = (!job.args.is_empty()).then(|| Value::Array(job.args.clone()));
        let errors = if job.errors.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&job.errors).map_err(FlowError::store)?)
        };
        let before = (!job.before.is_empty()).then(|| encode_ids(&job.before));
        let after = (!job.after.is_empty()).then(|| encode_ids(&job.after));

        sqlx::query(
            r#"
            INSERT INTO flowline_jobs (
                id, workflow_id, job_type, args, before_ids, after_ids,
                enqueued_at, started_at, finished_at, error_at, failed_at,
                errors, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    NOW() + make_interval(secs => $13))
            ON CONFLICT (id) DO UPDATE SET
                workflow_id = EXCLUDED.workflow_id,
                job_type = EXCLUDED.job_type,
                args = EXCLUDED.args,
                before_ids = EXCLUDED.before_ids,
                after_ids = EXCLUDED.after_ids,
                enqueued_at = EXCLUDED.enqueued_at,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                error_at = EXCLUDED.error_at,
                failed_at = EXCLUDED.failed_at,
                errors = EXCLUDED.errors,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(job.id.0)
        .bind(job.workflow_id.0)
        .bind(&job.job_type)
        .bind(args)
        .bind(before)
        .bind(after)
        .bind(job.enqueued_at.as_ref().map(encode_timestamp))
        .bind(job.started_at.as_ref().map(encode_timestamp))
        .bind(job.finished_at.as_ref().map(encode_timestamp))
        .bind(job.error_at.as_ref().map(encode_timestamp))
        .bind(job.failed_at.as_ref().map(encode_timestamp))
        .bind(errors)
        .bind(ttl_secs(ttl))
        .execute(executor)
        .await
        .map_err(FlowError::store)?;
        Ok(())
    }

    fn row_to_job(row: &PgRow) -> Result<JobRecord> {
        let id = JobId(row.try_get::<Uuid, _>("id").map_err(FlowError::store)?);
        let key = format!("flowline_jobs/{id}");
        let get = |name: &str| -> Result<Option<f64>> { row.try_get(name).map_err(FlowError::store) };
        let timestamp = |name: &str| -> Result<Option<DateTime<Utc>>> {
            match get(name)? {
                None => Ok(None),
                Some(secs) => decode_timestamp(secs)
                    .map(Some)
                    .ok_or_else(|| FlowError::corrupt(&key, format!("`{name}` is not an epoch timestamp"))),
            }
        };

        let args = match row.try_get::<Option<Value>, _>("args").map_err(FlowError::store)? {
            None => Vec::new(),
            Some(Value::Array(args)) => args,
            Some(other) => return Err(FlowError::corrupt(&key, format!("args is not a list: {other}"))),
        };
        let errors: Vec<ErrorEntry> = match row.try_get::<Option<Value>, _>("errors").map_err(FlowError::store)? {
            None => Vec::new(),
            Some(raw) => serde_json::from_value(raw).map_err(|err| FlowError::corrupt(&key, err))?,
        };
        let ids = |name: &str| -> Result<Vec<JobId>> {
            match row.try_get::<Option<String>, _>(name).map_err(FlowError::store)? {
                None => Ok(Vec::new()),
                Some(raw) => decode_ids(&key, &raw),
            }
        };

        Ok(JobRecord {
            id,
            workflow_id: WorkflowId(row.try_get("workflow_id").map_err(FlowError::store)?),
            job_type: row.try_get("job_type").map_err(FlowError::store)?,
            args,
            before: ids("before_ids")?.into_iter().collect(),
            after: ids("after_ids")?.into_iter().collect(),
            enqueued_at: timestamp("enqueued_at")?,
            started_at: timestamp("started_at")?,
            finished_at: timestamp("finished_at")?,
            error_at: timestamp("error_at")?,
            failed_at: timestamp("failed_at")?,
            errors,
        })
    }
}

const JOB_COLUMNS: &str = "id, workflow_id, job_type, args, before_ids, after_ids, \
     enqueued_at, started_at, finished_at, error_at, failed_at, errors";

#[async_trait]
impl WorkflowStore for PostgresStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(FlowError::store)?;
        sqlx::query(
            r#"
            INSERT INTO flowline_workflows (id, workflow_type, job_ids, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (id) DO UPDATE SET
                workflow_type = EXCLUDED.workflow_type,
                job_ids = EXCLUDED.job_ids,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(workflow.id.0)
        .bind(&workflow.workflow_type)
        .bind(encode_ids(workflow.jobs.keys()))
        .bind(ttl_secs(self.ttl))
        .execute(&mut *tx)
        .await
        .map_err(FlowError::store)?;

        for job in workflow.jobs.values() {
            Self::upsert_job(&mut *tx, job, self.ttl).await?;
        }
        tx.commit().await.map_err(FlowError::store)?;
        debug!(workflow_id = %workflow.id, jobs = workflow.jobs.len(), "workflow saved");
        Ok(())
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        let row = sqlx::query(
            r#"
            SELECT workflow_type, job_ids
            FROM flowline_workflows
            WHERE id = $1 AND expires_at > NOW()
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(FlowError::store)?
        .ok_or(FlowError::WorkflowNotFound(id))?;

        let workflow_type: String = row.try_get("workflow_type").map_err(FlowError::store)?;
        let raw_ids: String = row.try_get("job_ids").map_err(FlowError::store)?;
        let job_ids = decode_ids(&format!("flowline_workflows/{id}"), &raw_ids)?;
        let jobs = self.load_jobs(&job_ids).await?;

        Ok(Workflow {
            id,
            workflow_type,
            jobs: jobs.into_iter().collect(),
        })
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        Self::upsert_job(&self.pool, job, self.ttl).await
    }

    async fn load_job(&self, id: JobId) -> Result<JobRecord> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM flowline_jobs WHERE id = $1 AND expires_at > NOW()"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(FlowError::store)?
        .ok_or(FlowError::JobNotFound(id))?;
        Self::row_to_job(&row)
    }

    async fn load_jobs(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let raw: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM flowline_jobs WHERE id = ANY($1) AND expires_at > NOW()"
        ))
        .bind(raw)
        .fetch_all(&self.pool)
        .await
        .map_err(FlowError::store)?;

        let mut jobs = HashMap::with_capacity(rows.len());
        for row in &rows {
            let job = Self::row_to_job(row)?;
            jobs.insert(job.id, job);
        }
        if let Some(missing) = ids.iter().find(|id| !jobs.contains_key(id)) {
            return Err(FlowError::JobNotFound(*missing));
        }
        Ok(jobs)
    }

    async fn set_payload(&self, workflow_id: WorkflowId, name: &str, value: &PayloadValue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flowline_payloads (workflow_id, name, value, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (workflow_id, name) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(workflow_id.0)
        .bind(name)
        .bind(value.encode()?)
        .bind(ttl_secs(self.ttl))
        .execute(&self.pool)
        .await
        .map_err(FlowError::store)?;
        Ok(())
    }

    async fn get_payload_raw(&self, workflow_id: WorkflowId, name: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT value FROM flowline_payloads
            WHERE workflow_id = $1 AND name = $2 AND expires_at > NOW()
            "#,
        )
        .bind(workflow_id.0)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(FlowError::store)
    }
}

/// Row-based [`LockProvider`].
///
/// A key is free when it has no row or its row has expired; acquisition
/// takes over expired rows in the same statement.
#[derive(Clone, Debug)]
pub struct PostgresLockProvider {
    pool: PgPool,
}

impl PostgresLockProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockProvider for PostgresLockProvider {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let handle = LockHandle::new(key, ttl);
        let acquired = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO flowline_locks (key, token, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET
                token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at
            WHERE flowline_locks.expires_at <= NOW()
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(handle.token.0)
        .bind(ttl_secs(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(FlowError::store)?;

        Ok(acquired.filter(|token| *token == handle.token.0).map(|_| handle))
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        sqlx::query("DELETE FROM flowline_locks WHERE key = $1 AND token = $2")
            .bind(&handle.key)
            .bind(handle.token.0)
            .execute(&self.pool)
            .await
            .map_err(FlowError::store)?;
        Ok(())
    }
}
