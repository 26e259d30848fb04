//! Job repository.

use async_trait::async_trait;

use crate::database::models::{JobDbModel, JobExecutionDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::DbPool;
use crate::domain::{Job, JobExecution, JobStatus};
use crate::{Error, Result};

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Job>;
    /// Insert a PENDING job unless an open job already covers the same
    /// (collector, artifact, range). Returns whether a row was created.
    async fn create_if_absent(&self, job: &Job) -> Result<bool>;
    /// Atomically move the oldest PENDING job of `group` to RUNNING.
    async fn claim_next_pending(&self, group: &str) -> Result<Option<Job>>;
    /// Move a RUNNING job to a terminal status.
    async fn finish_job(&self, id: &str, status: JobStatus) -> Result<()>;
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    // Executions
    async fn create_execution(&self, execution: &JobExecution) -> Result<()>;
    async fn finish_execution(
        &self,
        id: &str,
        status: JobStatus,
        error_detail: Option<&str>,
    ) -> Result<()>;
    async fn count_executions(&self, job_id: &str) -> Result<i64>;
    async fn list_executions(&self, job_id: &str) -> Result<Vec<JobExecution>>;
}

pub struct SqlxJobRepository {
    pool: DbPool,
}

impl SqlxJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<Job> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
            .and_then(Job::try_from)
    }

    async fn create_if_absent(&self, job: &Job) -> Result<bool> {
        let row = JobDbModel::from(job);
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO job (
                id, collector_name, group_name, artifact_id, base_date,
                range_start, range_end, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.collector_name)
        .bind(&row.group_name)
        .bind(row.artifact_id)
        .bind(row.base_date)
        .bind(row.range_start)
        .bind(row.range_end)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_next_pending(&self, group: &str) -> Result<Option<Job>> {
        let pool = &self.pool;
        let row = retry_on_sqlite_busy("claim_next_pending", || async move {
            let now = now_ms();
            let row = sqlx::query_as::<_, JobDbModel>(
                r#"
                UPDATE job
                SET status = 'RUNNING', started_at = ?1, updated_at = ?1
                WHERE id = (
                    SELECT id FROM job
                    WHERE status = 'PENDING' AND group_name = ?2
                    ORDER BY created_at, rowid
                    LIMIT 1
                )
                AND status = 'PENDING'
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(group)
            .fetch_optional(pool)
            .await?;
            Ok(row)
        })
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn finish_job(&self, id: &str, status: JobStatus) -> Result<()> {
        let current = self.get_job(id).await?;
        current.status.transition_to(status)?;

        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE job SET status = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidStateTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }
        Ok(())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY created_at, rowid",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn create_execution(&self, execution: &JobExecution) -> Result<()> {
        let row = JobExecutionDbModel::from(execution);
        sqlx::query(
            r#"
            INSERT INTO job_execution (id, job_id, attempt, status, started_at, completed_at, error_detail)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.job_id)
        .bind(row.attempt)
        .bind(&row.status)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(&row.error_detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: &str,
        status: JobStatus,
        error_detail: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_execution SET status = ?, completed_at = ?, error_detail = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(status.as_str())
        .bind(now_ms())
        .bind(error_detail)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Running job execution", id));
        }
        Ok(())
    }

    async fn count_executions(&self, job_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_execution WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_executions(&self, job_id: &str) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, JobExecutionDbModel>(
            "SELECT * FROM job_execution WHERE job_id = ? ORDER BY attempt",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobExecution::try_from).collect()
    }
}
