use std::time::Duration;

use async_trait::async_trait;
use common::retry::RetryAttempt;
use common::{JobClaim, JobFilter, JobId, NewJob, QueuedJob, TenantId};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, QueryResult,
    Statement, Value,
};
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::traits::{JobLedger, validate_queue};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queued_jobs (
    queue              TEXT        NOT NULL,
    id                 TEXT        NOT NULL,
    sequence           BIGSERIAL   NOT NULL,
    stream_row_id      BIGINT      NOT NULL,
    tenant             TEXT        NOT NULL,
    parameters         JSONB       NOT NULL DEFAULT '{}'::jsonb,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
    executing          BOOLEAN     NOT NULL DEFAULT FALSE,
    executing_identity TEXT,
    execution_start    TIMESTAMPTZ,
    execution_end      TIMESTAMPTZ,
    finished           BOOLEAN     NOT NULL DEFAULT FALSE,
    error_count        INTEGER     NOT NULL DEFAULT 0,
    last_error         TEXT,
    history            JSONB       NOT NULL DEFAULT '[]'::jsonb,
    PRIMARY KEY (queue, id)
)"#;

const CLAIM_INDEX: &str = "CREATE INDEX IF NOT EXISTS queued_jobs_claimable \
     ON queued_jobs (queue, sequence) WHERE NOT finished AND NOT executing";

const COLUMNS: &str = "queue, id, sequence, stream_row_id, tenant, parameters::text AS parameters, \
     created_at, executing, executing_identity, execution_start, execution_end, finished, \
     error_count, last_error, history::text AS history";

/// Job ledger shared by many hosts through PostgreSQL.
///
/// The claim is a single `UPDATE ... RETURNING` over a `FOR UPDATE SKIP
/// LOCKED` sub-select, so concurrent claimers never block on, or receive,
/// the same row.
pub struct PostgresLedger {
    db: DatabaseConnection,
}

impl PostgresLedger {
    pub async fn connect(url: &str) -> Result<Self> {
        let mut opt = ConnectOptions::new(url.to_owned());
        opt.max_connections(20)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(8))
            .acquire_timeout(Duration::from_secs(8))
            .sqlx_logging(false);

        let db = Database::connect(opt).await?;
        Self::with_connection(db).await
    }

    pub async fn with_connection(db: DatabaseConnection) -> Result<Self> {
        for sql in [SCHEMA, CLAIM_INDEX] {
            db.execute_raw(Statement::from_string(DbBackend::Postgres, sql.to_string()))
                .await?;
        }
        Ok(Self { db })
    }

    async fn fetch_one(&self, sql: String, values: Vec<Value>) -> Result<Option<QueuedJob>> {
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);
        match self.db.query_one_raw(stmt).await? {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Explain why an outcome update touched no row.
    async fn missing_claim(&self, queue: &str, job_id: &JobId) -> LedgerError {
        match self.get(queue, job_id).await {
            Ok(Some(_)) => LedgerError::NotExecuting(job_id.clone()),
            Ok(None) => LedgerError::NotFound {
                queue: queue.to_string(),
                job_id: job_id.clone(),
            },
            Err(e) => e,
        }
    }
}

fn job_from_row(row: &QueryResult) -> Result<QueuedJob> {
    let parameters: String = row.try_get("", "parameters")?;
    let history: String = row.try_get("", "history")?;
    let history: Vec<RetryAttempt> = serde_json::from_str(&history)?;

    Ok(QueuedJob {
        id: JobId::new(row.try_get::<String>("", "id")?),
        queue: row.try_get("", "queue")?,
        stream_row_id: row.try_get::<i64>("", "stream_row_id")? as u64,
        tenant: TenantId::new(row.try_get::<String>("", "tenant")?),
        parameters: serde_json::from_str(&parameters)?,
        sequence: row.try_get::<i64>("", "sequence")? as u64,
        created_at: row.try_get("", "created_at")?,
        executing: row.try_get("", "executing")?,
        executing_identity: row.try_get("", "executing_identity")?,
        execution_start: row.try_get("", "execution_start")?,
        execution_end: row.try_get("", "execution_end")?,
        finished: row.try_get("", "finished")?,
        error_count: row.try_get::<i32>("", "error_count")? as u32,
        last_error: row.try_get("", "last_error")?,
        history,
    })
}

#[async_trait]
impl JobLedger for PostgresLedger {
    async fn upsert(&self, job: NewJob) -> Result<bool> {
        validate_queue(&job.queue)?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "INSERT INTO queued_jobs (queue, id, stream_row_id, tenant, parameters) \
             VALUES ($1, $2, $3, $4, $5::jsonb) ON CONFLICT (queue, id) DO NOTHING",
            [
                job.queue.clone().into(),
                job.id.as_str().into(),
                (job.stream_row_id as i64).into(),
                job.tenant.as_str().into(),
                serde_json::to_string(&job.parameters)?.into(),
            ],
        );
        let inserted = self.db.execute_raw(stmt).await?.rows_affected() == 1;
        if inserted {
            debug!(queue = %job.queue, job_id = %job.id, "Queued job");
        }
        Ok(inserted)
    }

    async fn claim_next(&self, queue: &str, identity: &str) -> Result<Option<QueuedJob>> {
        validate_queue(queue)?;
        let sql = format!(
            "UPDATE queued_jobs \
             SET executing = TRUE, executing_identity = $2, execution_start = now(), last_error = NULL \
             WHERE queue = $1 AND id = ( \
                 SELECT id FROM queued_jobs \
                 WHERE queue = $1 AND NOT finished AND NOT executing \
                 ORDER BY sequence LIMIT 1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {COLUMNS}"
        );
        self.fetch_one(sql, vec![queue.into(), identity.into()])
            .await
    }

    async fn complete(&self, queue: &str, claim: &JobClaim) -> Result<QueuedJob> {
        let sql = format!(
            "UPDATE queued_jobs SET executing = FALSE, finished = TRUE, execution_end = now() \
             WHERE queue = $1 AND id = $2 AND executing \
               AND executing_identity = $3 AND execution_start = $4 \
             RETURNING {COLUMNS}"
        );
        let values = vec![
            queue.into(),
            claim.job_id.as_str().into(),
            claim.identity.as_str().into(),
            claim.started.into(),
        ];
        match self.fetch_one(sql, values).await? {
            Some(job) => Ok(job),
            None => Err(self.missing_claim(queue, &claim.job_id).await),
        }
    }

    async fn fail(
        &self,
        queue: &str,
        claim: &JobClaim,
        message: &str,
        max_failures: u32,
    ) -> Result<QueuedJob> {
        let sql = format!(
            "UPDATE queued_jobs SET \
                 error_count = error_count + 1, \
                 last_error = $3, \
                 history = history || jsonb_build_array(jsonb_build_object( \
                     'attempt', error_count + 1, 'identity', executing_identity, \
                     'error', $3::text, 'timestamp', now())), \
                 finished = (error_count + 1) >= $4, \
                 executing = FALSE, \
                 execution_end = now() \
             WHERE queue = $1 AND id = $2 AND executing \
               AND executing_identity = $5 AND execution_start = $6 \
             RETURNING {COLUMNS}"
        );
        let values = vec![
            queue.into(),
            claim.job_id.as_str().into(),
            message.into(),
            (max_failures as i32).into(),
            claim.identity.as_str().into(),
            claim.started.into(),
        ];
        match self.fetch_one(sql, values).await? {
            Some(job) => Ok(job),
            None => Err(self.missing_claim(queue, &claim.job_id).await),
        }
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> Result<Option<QueuedJob>> {
        let sql = format!("SELECT {COLUMNS} FROM queued_jobs WHERE queue = $1 AND id = $2");
        self.fetch_one(sql, vec![queue.into(), job_id.as_str().into()])
            .await
    }

    async fn list(&self, queue: &str, filter: &JobFilter) -> Result<Vec<QueuedJob>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!("SELECT {COLUMNS} FROM queued_jobs WHERE queue = $1 ORDER BY sequence"),
            [queue.into()],
        );
        let rows = self.db.query_all_raw(stmt).await?;
        let mut jobs = Vec::new();
        for row in &rows {
            let job = job_from_row(row)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
            if filter.limit.is_some_and(|limit| jobs.len() >= limit) {
                break;
            }
        }
        Ok(jobs)
    }
}
