//! Job database models.

use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, ms_to_range};
use crate::domain::{Job, JobExecution, JobStatus};
use crate::{Error, Result};

fn parse_status(raw: &str) -> Result<JobStatus> {
    JobStatus::parse(raw).ok_or_else(|| Error::Database(format!("unknown job status {raw}")))
}

#[derive(Debug, Clone, FromRow)]
pub struct JobDbModel {
    pub id: String,
    pub collector_name: String,
    pub group_name: String,
    pub artifact_id: Option<i64>,
    pub base_date: i64,
    pub range_start: i64,
    pub range_end: i64,
    /// PENDING, RUNNING, COMPLETED, FAILED
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl From<&Job> for JobDbModel {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            collector_name: job.collector.clone(),
            group_name: job.group.clone(),
            artifact_id: job.artifact_id,
            base_date: datetime_to_ms(job.base_date),
            range_start: datetime_to_ms(job.range.start()),
            range_end: datetime_to_ms(job.range.end()),
            status: job.status.as_str().to_string(),
            created_at: datetime_to_ms(job.created_at),
            updated_at: datetime_to_ms(job.updated_at),
            started_at: job.started_at.map(datetime_to_ms),
            completed_at: job.completed_at.map(datetime_to_ms),
        }
    }
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        Ok(Job {
            range: ms_to_range(row.range_start, row.range_end)?,
            status: parse_status(&row.status)?,
            id: row.id,
            collector: row.collector_name,
            group: row.group_name,
            artifact_id: row.artifact_id,
            base_date: ms_to_datetime(row.base_date),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            started_at: row.started_at.map(ms_to_datetime),
            completed_at: row.completed_at.map(ms_to_datetime),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobExecutionDbModel {
    pub id: String,
    pub job_id: String,
    pub attempt: i64,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub error_detail: Option<String>,
}

impl From<&JobExecution> for JobExecutionDbModel {
    fn from(execution: &JobExecution) -> Self {
        Self {
            id: execution.id.clone(),
            job_id: execution.job_id.clone(),
            attempt: execution.attempt,
            status: execution.status.as_str().to_string(),
            started_at: datetime_to_ms(execution.started_at),
            completed_at: execution.completed_at.map(datetime_to_ms),
            error_detail: execution.error_detail.clone(),
        }
    }
}

impl TryFrom<JobExecutionDbModel> for JobExecution {
    type Error = Error;

    fn try_from(row: JobExecutionDbModel) -> Result<Self> {
        Ok(JobExecution {
            status: parse_status(&row.status)?,
            id: row.id,
            job_id: row.job_id,
            attempt: row.attempt,
            started_at: ms_to_datetime(row.started_at),
            completed_at: row.completed_at.map(ms_to_datetime),
            error_detail: row.error_detail,
        })
    }
}
