//! Job queueing and execution.
//!
//! `queue_all` turns (collector, in-scope artifact) pairs with uncovered
//! ranges into PENDING jobs. `run_worker` drains one group's queue in
//! creation order, running each job through a fresh recorder session and
//! advancing the event pointers only when every flush of that session
//! succeeded.

use chrono::{DateTime, Utc};
use date_range::Range;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::pointers::EventPointerManager;
use super::spawner::WorkerSpawner;
use crate::cache::TimeSeriesCache;
use crate::collector::{CollectorContext, CollectorDescriptor, CollectorRegistry, Schedule};
use crate::config::IndexerConfig;
use crate::database::DbPool;
use crate::database::repositories::{
    ArtifactRepository, EventPointerRepository, EventRepository, JobRepository,
    SqlxArtifactRepository, SqlxEventPointerRepository, SqlxEventRepository, SqlxJobRepository,
};
use crate::domain::{Artifact, Job, JobExecution, JobStatus};
use crate::recorder::{ActorDirectory, EventRecorder};
use crate::{Error, Result};

/// Storage the scheduler runs against.
#[derive(Clone)]
pub struct SchedulerRepositories {
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub events: Arc<dyn EventRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub pointers: Arc<dyn EventPointerRepository>,
}

impl SchedulerRepositories {
    pub fn sqlx(pool: DbPool) -> Self {
        Self {
            artifacts: Arc::new(SqlxArtifactRepository::new(pool.clone())),
            events: Arc::new(SqlxEventRepository::new(pool.clone())),
            jobs: Arc::new(SqlxJobRepository::new(pool.clone())),
            pointers: Arc::new(SqlxEventPointerRepository::new(pool)),
        }
    }
}

/// A group whose remote worker could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    pub group: String,
    pub error: String,
}

/// Outcome of one `queue_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSummary {
    /// Jobs inserted by this pass.
    pub created: Vec<Job>,
    /// Uncovered ranges that already had an open job.
    pub already_queued: usize,
    /// Groups a remote worker was dispatched for.
    pub dispatched: Vec<String>,
    pub dispatch_failures: Vec<DispatchFailure>,
}

impl QueueSummary {
    pub fn created_count(&self) -> usize {
        self.created.len()
    }
}

/// A job that ended FAILED during `run_worker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub job_id: String,
    pub collector: String,
    pub artifact_id: Option<i64>,
    pub error: String,
}

pub struct Scheduler {
    config: Arc<IndexerConfig>,
    registry: CollectorRegistry,
    repos: SchedulerRepositories,
    pointers: EventPointerManager,
    directory: Arc<ActorDirectory>,
    cache: Arc<TimeSeriesCache>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
}

impl Scheduler {
    pub fn new(config: Arc<IndexerConfig>, repos: SchedulerRepositories) -> Self {
        let pointers = EventPointerManager::new(repos.pointers.clone(), config.batch_size);
        let directory = Arc::new(ActorDirectory::new(repos.artifacts.clone()));
        let cache = Arc::new(TimeSeriesCache::new(config.cache_dir.clone()));
        Self {
            config,
            registry: CollectorRegistry::new(),
            repos,
            pointers,
            directory,
            cache,
            spawner: None,
        }
    }

    /// SQLite-backed scheduler over an initialized pool.
    pub fn from_pool(config: Arc<IndexerConfig>, pool: DbPool) -> Self {
        Self::new(config, SchedulerRepositories::sqlx(pool))
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn register_collector(&mut self, descriptor: CollectorDescriptor) -> Result<()> {
        debug!(
            collector = %descriptor.name,
            group = %descriptor.group,
            schedule = %descriptor.schedule,
            "Registering collector"
        );
        self.registry.register(descriptor)
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    pub fn pointers(&self) -> &EventPointerManager {
        &self.pointers
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Enqueue every uncovered (collector, artifact) range through `base_date`,
    /// then start one remote worker per group that received new jobs.
    pub async fn queue_all(&self, base_date: DateTime<Utc>) -> Result<QueueSummary> {
        let mut summary = QueueSummary::default();
        let mut groups = BTreeSet::new();

        for descriptor in self.registry.iter() {
            if descriptor.schedule == Schedule::Manual {
                debug!(collector = %descriptor.name, "Manual collector, not queueing");
                continue;
            }

            let artifacts = self.repos.artifacts.list_in_scope(&descriptor.scope()).await?;
            let ids: Vec<i64> = artifacts.iter().map(|a| a.id).collect();
            let uncovered = self
                .pointers
                .uncovered_ranges_for(&ids, &descriptor.name, descriptor.schedule, base_date)
                .await?;

            let mut created = 0;
            for (artifact_id, range) in uncovered {
                let job = Job::new(
                    descriptor.name.clone(),
                    descriptor.group.clone(),
                    Some(artifact_id),
                    base_date,
                    range,
                );
                if self.repos.jobs.create_if_absent(&job).await? {
                    created += 1;
                    summary.created.push(job);
                } else {
                    summary.already_queued += 1;
                }
            }

            if created > 0 {
                groups.insert(descriptor.group.clone());
            }
            info!(
                collector = %descriptor.name,
                group = %descriptor.group,
                artifacts = artifacts.len(),
                created,
                "Queued collector"
            );
        }

        if let Some(spawner) = &self.spawner {
            for group in groups {
                match spawner.spawn(&group).await {
                    Ok(()) => summary.dispatched.push(group),
                    Err(e) => {
                        warn!(group = %group, "Failed to dispatch worker: {}", e);
                        summary.dispatch_failures.push(DispatchFailure {
                            group,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Enqueue one ad-hoc job over every in-scope artifact of `collector`,
    /// regardless of what is already covered.
    pub async fn queue_job(
        &self,
        collector: &str,
        base_date: DateTime<Utc>,
        range: Range,
    ) -> Result<Job> {
        let descriptor = self.registry.get(collector)?;
        let job = Job::new(
            descriptor.name.clone(),
            descriptor.group.clone(),
            None,
            base_date,
            range,
        );
        if !self.repos.jobs.create_if_absent(&job).await? {
            return Err(Error::validation(format!(
                "an open job for {collector} over {range} already exists"
            )));
        }
        info!(job_id = %job.id, collector, %range, "Queued ad-hoc job");
        Ok(job)
    }

    /// Run every pending job of `group` until the queue is empty.
    ///
    /// Job failures are recorded and returned; only storage errors while
    /// claiming abort the loop.
    pub async fn run_worker(&self, group: &str) -> Result<Vec<JobFailure>> {
        let mut failures = Vec::new();
        let mut completed = 0usize;

        info!(group, "Worker started");
        while let Some(job) = self.repos.jobs.claim_next_pending(group).await? {
            match self.run_job(&job).await {
                Ok(()) => completed += 1,
                Err(e) => failures.push(JobFailure {
                    job_id: job.id.clone(),
                    collector: job.collector.clone(),
                    artifact_id: job.artifact_id,
                    error: e.to_string(),
                }),
            }
        }
        info!(group, completed, failed = failures.len(), "Worker finished");

        Ok(failures)
    }

    /// Run a collector over `range` for all its in-scope artifacts without
    /// creating job rows.
    pub async fn execute_for_range(&self, collector: &str, range: Range) -> Result<()> {
        let descriptor = self.registry.get(collector)?;
        let artifacts = self.repos.artifacts.list_in_scope(&descriptor.scope()).await?;
        info!(collector, %range, artifacts = artifacts.len(), "Executing collector");
        self.collect_and_commit(descriptor, &artifacts, range).await
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        let execution = match self.start_execution(job).await {
            Ok(execution) => execution,
            Err(e) => {
                error!(job_id = %job.id, "Failed to record job execution: {}", e);
                self.fail_job(job).await;
                return Err(e);
            }
        };

        info!(
            job_id = %job.id,
            collector = %job.collector,
            artifact_id = ?job.artifact_id,
            range = %job.range,
            attempt = execution.attempt,
            "Running job"
        );

        match self.execute_job(job).await {
            Ok(()) => {
                let finished = async {
                    self.repos
                        .jobs
                        .finish_execution(&execution.id, JobStatus::Completed, None)
                        .await?;
                    self.repos.jobs.finish_job(&job.id, JobStatus::Completed).await
                }
                .await;
                if let Err(e) = finished {
                    error!(job_id = %job.id, "Failed to mark job completed: {}", e);
                    self.fail_job(job).await;
                    return Err(e);
                }
                info!(job_id = %job.id, collector = %job.collector, "Job completed");
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                error!(job_id = %job.id, collector = %job.collector, "Job failed: {}", detail);
                if let Err(store_err) = self
                    .repos
                    .jobs
                    .finish_execution(&execution.id, JobStatus::Failed, Some(&detail))
                    .await
                {
                    error!(job_id = %job.id, "Failed to record execution failure: {}", store_err);
                }
                self.fail_job(job).await;
                Err(e)
            }
        }
    }

    async fn start_execution(&self, job: &Job) -> Result<JobExecution> {
        let attempt = self.repos.jobs.count_executions(&job.id).await? + 1;
        let execution = JobExecution::start(job.id.clone(), attempt);
        self.repos.jobs.create_execution(&execution).await?;
        Ok(execution)
    }

    /// Move a claimed job to FAILED so it stops blocking re-queueing. Storage
    /// errors here are logged only.
    async fn fail_job(&self, job: &Job) {
        if let Err(e) = self.repos.jobs.finish_job(&job.id, JobStatus::Failed).await {
            error!(job_id = %job.id, "Failed to mark job failed: {}", e);
        }
    }

    async fn execute_job(&self, job: &Job) -> Result<()> {
        let descriptor = self.registry.get(&job.collector)?;
        let artifacts: Vec<Artifact> = match job.artifact_id {
            Some(id) => vec![self.repos.artifacts.get(id).await?],
            None => self.repos.artifacts.list_in_scope(&descriptor.scope()).await?,
        };
        self.collect_and_commit(descriptor, &artifacts, job.range).await
    }

    fn new_recorder(&self, descriptor: &CollectorDescriptor, range: Range) -> EventRecorder {
        let recorder = EventRecorder::new(
            self.directory.clone(),
            self.repos.events.clone(),
            self.config.recorder.clone(),
        );
        recorder.set_actor_scope(&descriptor.artifact_scope, &descriptor.artifact_type_scope);
        recorder.set_range(range);
        recorder
    }

    /// Run the collector in its own recorder session; extend the pointers of
    /// `artifacts` only if the collector and every flush succeeded.
    async fn collect_and_commit(
        &self,
        descriptor: &CollectorDescriptor,
        artifacts: &[Artifact],
        range: Range,
    ) -> Result<()> {
        let recorder = self.new_recorder(descriptor, range);
        let context = CollectorContext {
            config: self.config.clone(),
            recorder: recorder.clone(),
            cache: self.cache.clone(),
        };

        let collected = match descriptor.build(context) {
            Ok(collector) => collector.collect(artifacts, &range).await,
            Err(e) => Err(e),
        };
        // Always close so buffered events are flushed and handles resolve.
        let closed = recorder.close().await;
        let report = match (collected, closed) {
            (Ok(()), closed) => closed?,
            (Err(e), Ok(_)) => return Err(e),
            (Err(e), Err(close_err)) => {
                warn!(
                    collector = %descriptor.name,
                    "Failed to close recorder after collector error: {}", close_err
                );
                return Err(e);
            }
        };

        if !report.is_ok() {
            return Err(Error::Recorder(format!(
                "{} of {} flushes failed: {}",
                report.errors.len(),
                report.flushes,
                report.errors.join("; ")
            )));
        }
        debug!(
            collector = %descriptor.name,
            records = report.records,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "Recorder closed"
        );

        for artifact in artifacts {
            self.pointers
                .extend_range(artifact.id, &descriptor.name, range)
                .await?;
        }
        Ok(())
    }
}
