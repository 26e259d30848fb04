//! Integration tests for queueing and running jobs.

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oso_indexer::collector::{Schedule, github};
use oso_indexer::database::repositories::{
    EventRepository, JobRepository, SqlxEventRepository, SqlxJobRepository,
};
use oso_indexer::domain::{Job, JobExecution, JobStatus};
use oso_indexer::scheduler::{Scheduler, SchedulerRepositories, WorkerSpawner};
use oso_indexer::{Error, Result};

use common::*;

/// Records every group it is asked to spawn; fails for `fail_group`.
#[derive(Default)]
struct CountingSpawner {
    calls: parking_lot::Mutex<Vec<String>>,
    fail_group: Option<String>,
}

#[async_trait]
impl WorkerSpawner for CountingSpawner {
    async fn spawn(&self, group: &str) -> Result<()> {
        self.calls.lock().push(group.to_string());
        if self.fail_group.as_deref() == Some(group) {
            return Err(Error::Dispatch(format!("group {group}: refused")));
        }
        Ok(())
    }
}

/// SQLite job storage whose execution writes can be made to fail.
struct FlakyJobs {
    inner: SqlxJobRepository,
    fail_create_execution: bool,
    fail_finish_execution: bool,
}

impl FlakyJobs {
    fn new(env: &TestEnv) -> Self {
        Self {
            inner: SqlxJobRepository::new(env.pool.clone()),
            fail_create_execution: false,
            fail_finish_execution: false,
        }
    }
}

#[async_trait]
impl JobRepository for FlakyJobs {
    async fn get_job(&self, id: &str) -> Result<Job> {
        self.inner.get_job(id).await
    }

    async fn create_if_absent(&self, job: &Job) -> Result<bool> {
        self.inner.create_if_absent(job).await
    }

    async fn claim_next_pending(&self, group: &str) -> Result<Option<Job>> {
        self.inner.claim_next_pending(group).await
    }

    async fn finish_job(&self, id: &str, status: JobStatus) -> Result<()> {
        self.inner.finish_job(id, status).await
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.inner.list_jobs_by_status(status).await
    }

    async fn create_execution(&self, execution: &JobExecution) -> Result<()> {
        if self.fail_create_execution {
            return Err(Error::Recorder("execution table unavailable".to_string()));
        }
        self.inner.create_execution(execution).await
    }

    async fn finish_execution(
        &self,
        id: &str,
        status: JobStatus,
        error_detail: Option<&str>,
    ) -> Result<()> {
        if self.fail_finish_execution {
            return Err(Error::Recorder("execution table unavailable".to_string()));
        }
        self.inner.finish_execution(id, status, error_detail).await
    }

    async fn count_executions(&self, job_id: &str) -> Result<i64> {
        self.inner.count_executions(job_id).await
    }

    async fn list_executions(&self, job_id: &str) -> Result<Vec<JobExecution>> {
        self.inner.list_executions(job_id).await
    }
}

fn scheduler_with_jobs(env: &TestEnv, jobs: FlakyJobs) -> Scheduler {
    let repos = SchedulerRepositories {
        jobs: Arc::new(jobs),
        ..SchedulerRepositories::sqlx(env.pool.clone())
    };
    Scheduler::new(arc_config(env), repos)
}

fn scheduler(env: &TestEnv) -> Scheduler {
    Scheduler::new(arc_config(env), SchedulerRepositories::sqlx(env.pool.clone()))
}

mod queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_all_is_idempotent() {
        let env = setup().await;
        seed_artifacts(&env.pool, &[repo_key("o/a"), repo_key("o/b"), repo_key("o/c")]).await;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("daily", "g", Schedule::Daily, Behavior::RecordOne))
            .unwrap();

        let first = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(first.created_count(), 3);
        assert!(first.created.iter().all(|job| job.range == jan_range(9, 10)));

        let second = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(second.created_count(), 0);
        assert_eq!(second.already_queued, 3);
    }

    #[tokio::test]
    async fn test_weekly_window_and_manual_collectors() {
        let env = setup().await;
        seed_artifacts(&env.pool, &[repo_key("o/a")]).await;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("weekly", "g", Schedule::Weekly, Behavior::RecordOne))
            .unwrap();
        scheduler
            .register_collector(fake_descriptor("manual", "g", Schedule::Manual, Behavior::RecordOne))
            .unwrap();

        let summary = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(summary.created_count(), 1);
        assert_eq!(summary.created[0].collector, "weekly");
        assert_eq!(summary.created[0].range, jan_range(3, 10));
    }

    #[tokio::test]
    async fn test_partially_covered_window_queues_the_gap_span() {
        let env = setup().await;
        let artifacts = seed_artifacts(&env.pool, &[repo_key("o/a")]).await;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("weekly", "g", Schedule::Weekly, Behavior::RecordOne))
            .unwrap();
        scheduler
            .pointers()
            .extend_range(artifacts[0].id, "weekly", jan_range(3, 6))
            .await
            .unwrap();

        let summary = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(summary.created[0].range, jan_range(6, 10));
    }

    #[tokio::test]
    async fn test_duplicate_collector_names_are_rejected() {
        let env = setup().await;
        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("c", "g", Schedule::Daily, Behavior::RecordOne))
            .unwrap();
        let err = scheduler
            .register_collector(fake_descriptor("c", "other", Schedule::Weekly, Behavior::Fail))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_one_dispatch_per_group_with_new_jobs() {
        let env = setup().await;
        seed_artifacts(&env.pool, &[repo_key("o/a"), repo_key("o/b")]).await;

        let spawner = Arc::new(CountingSpawner {
            fail_group: Some("npm".to_string()),
            ..Default::default()
        });
        let mut scheduler = scheduler(&env).with_spawner(spawner.clone());
        for (name, group) in [("one", "github"), ("two", "github"), ("three", "npm")] {
            scheduler
                .register_collector(fake_descriptor(name, group, Schedule::Daily, Behavior::RecordOne))
                .unwrap();
        }

        let summary = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(summary.created_count(), 6);
        assert_eq!(summary.dispatched, vec!["github".to_string()]);
        assert_eq!(summary.dispatch_failures.len(), 1);
        assert_eq!(summary.dispatch_failures[0].group, "npm");
        assert_eq!(*spawner.calls.lock(), vec!["github", "npm"]);

        // Dispatch failures leave the jobs queued; nothing new means no dispatch.
        let again = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(again.created_count(), 0);
        assert_eq!(spawner.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_job_for_unknown_collector() {
        let env = setup().await;
        let scheduler = scheduler(&env);
        let err = scheduler
            .queue_job("missing", jan(10), jan_range(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}

mod worker_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_job_does_not_stop_the_worker() {
        let env = setup().await;
        let artifacts = seed_artifacts(&env.pool, &[repo_key("o/a")]).await;
        let id = artifacts[0].id;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("broken", "g", Schedule::Daily, Behavior::Fail))
            .unwrap();
        scheduler
            .register_collector(fake_descriptor("good", "g", Schedule::Daily, Behavior::RecordOne))
            .unwrap();
        let queued = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(queued.created_count(), 2);

        let failures = scheduler.run_worker("g").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].collector, "broken");
        assert!(failures[0].error.contains("boom"));

        let pointers = scheduler.pointers();
        assert!(pointers.covered(id, "broken").await.unwrap().is_empty());
        assert!(pointers.covered(id, "good").await.unwrap().covers(&jan_range(9, 10)));

        let jobs = SchedulerRepositories::sqlx(env.pool.clone()).jobs;
        let failed = jobs.list_jobs_by_status(JobStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        let executions = jobs.list_executions(&failed[0].id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].attempt, 1);
        assert_eq!(executions[0].status, JobStatus::Failed);
        assert!(executions[0].error_detail.as_deref().unwrap_or_default().contains("boom"));
        assert_eq!(
            jobs.list_jobs_by_status(JobStatus::Completed).await.unwrap().len(),
            1
        );

        let events = SqlxEventRepository::new(env.pool.clone())
            .list_by_type("TEST_EVENT")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        // The failed range is queued again; the completed one is not.
        let requeued = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(requeued.created_count(), 1);
        assert_eq!(requeued.created[0].collector, "broken");
    }

    #[tokio::test]
    async fn test_job_for_unregistered_collector_fails() {
        let env = setup().await;
        let scheduler = scheduler(&env);
        let jobs = SchedulerRepositories::sqlx(env.pool.clone()).jobs;
        let job = Job::new("ghost", "g", None, jan(10), jan_range(9, 10));
        jobs.create_if_absent(&job).await.unwrap();

        let failures = scheduler.run_worker("g").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].job_id, job.id);
        assert_eq!(jobs.get_job(&job.id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_job_fails_when_execution_cannot_be_recorded() {
        let env = setup().await;
        let artifacts = seed_artifacts(&env.pool, &[repo_key("o/a")]).await;

        let mut jobs = FlakyJobs::new(&env);
        jobs.fail_create_execution = true;
        let mut scheduler = scheduler_with_jobs(&env, jobs);
        scheduler
            .register_collector(fake_descriptor("c", "g", Schedule::Daily, Behavior::RecordOne))
            .unwrap();
        let queued = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(queued.created_count(), 1);

        let failures = scheduler.run_worker("g").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("execution table unavailable"));

        let store = SqlxJobRepository::new(env.pool.clone());
        let job = store.get_job(&queued.created[0].id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(
            scheduler
                .pointers()
                .covered(artifacts[0].id, "c")
                .await
                .unwrap()
                .is_empty()
        );

        // The range is no longer held by an open job.
        let requeued = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(requeued.created_count(), 1);
    }

    #[tokio::test]
    async fn test_job_fails_when_execution_result_cannot_be_stored() {
        let env = setup().await;
        seed_artifacts(&env.pool, &[repo_key("o/a")]).await;

        let mut jobs = FlakyJobs::new(&env);
        jobs.fail_finish_execution = true;
        let mut scheduler = scheduler_with_jobs(&env, jobs);
        scheduler
            .register_collector(fake_descriptor("broken", "g", Schedule::Daily, Behavior::Fail))
            .unwrap();
        let queued = scheduler.queue_all(jan(10)).await.unwrap();

        let failures = scheduler.run_worker("g").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("boom"));

        let store = SqlxJobRepository::new(env.pool.clone());
        let job = store.get_job(&queued.created[0].id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_collector_error_survives_a_failed_close() {
        let env = setup().await;
        seed_artifacts(&env.pool, &[repo_key("o/a")]).await;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor(
                "closer",
                "g",
                Schedule::Daily,
                Behavior::CloseThenFail,
            ))
            .unwrap();
        scheduler.queue_all(jan(10)).await.unwrap();

        let failures = scheduler.run_worker("g").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("boom after close"), "{}", failures[0].error);
    }

    #[tokio::test]
    async fn test_other_groups_are_left_alone() {
        let env = setup().await;
        seed_artifacts(&env.pool, &[repo_key("o/a")]).await;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("c", "other", Schedule::Daily, Behavior::RecordOne))
            .unwrap();
        scheduler.queue_all(jan(10)).await.unwrap();

        assert!(scheduler.run_worker("g").await.unwrap().is_empty());
        let jobs = SchedulerRepositories::sqlx(env.pool.clone()).jobs;
        assert_eq!(
            jobs.list_jobs_by_status(JobStatus::Pending).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_ad_hoc_job_covers_every_in_scope_artifact() {
        let env = setup().await;
        let artifacts =
            seed_artifacts(&env.pool, &[repo_key("o/a"), user_key("octocat")]).await;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("c", "g", Schedule::Manual, Behavior::RecordOne))
            .unwrap();
        let job = scheduler
            .queue_job("c", jan(10), jan_range(1, 3))
            .await
            .unwrap();
        assert_eq!(job.artifact_id, None);

        let err = scheduler
            .queue_job("c", jan(10), jan_range(1, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(scheduler.run_worker("g").await.unwrap().is_empty());
        for artifact in &artifacts {
            let covered = scheduler.pointers().covered(artifact.id, "c").await.unwrap();
            assert!(covered.covers(&jan_range(1, 3)));
        }
    }

    #[tokio::test]
    async fn test_execute_for_range_skips_the_queue() {
        let env = setup().await;
        let artifacts = seed_artifacts(&env.pool, &[repo_key("o/a")]).await;

        let mut scheduler = scheduler(&env);
        scheduler
            .register_collector(fake_descriptor("c", "g", Schedule::Manual, Behavior::RecordOne))
            .unwrap();
        scheduler
            .register_collector(fake_descriptor("bad", "g", Schedule::Manual, Behavior::Fail))
            .unwrap();

        scheduler.execute_for_range("c", jan_range(1, 2)).await.unwrap();
        assert!(
            scheduler
                .pointers()
                .covered(artifacts[0].id, "c")
                .await
                .unwrap()
                .covers(&jan_range(1, 2))
        );

        let err = scheduler
            .execute_for_range("bad", jan_range(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Collector { .. }));
        assert!(
            scheduler
                .pointers()
                .covered(artifacts[0].id, "bad")
                .await
                .unwrap()
                .is_empty()
        );

        let jobs = SchedulerRepositories::sqlx(env.pool.clone()).jobs;
        for status in [JobStatus::Pending, JobStatus::Completed, JobStatus::Failed] {
            assert!(jobs.list_jobs_by_status(status).await.unwrap().is_empty());
        }
    }
}

mod github_tests {
    use super::*;

    const OWNER_REPO: &str = "opensource-observer/oso";

    async fn mock_commits(server: &MockServer, hits: Arc<AtomicUsize>) {
        let body = json!([
            {
                "sha": "c0ffee",
                "commit": {
                    "author": {"name": "Octo", "email": "octo@example.com", "date": "2024-01-09T12:00:00Z"},
                    "committer": {"name": "Octo", "email": "octo@example.com", "date": "2024-01-09T12:00:00Z"}
                },
                "author": {"login": "octocat"}
            },
            {
                "sha": "late",
                "commit": {
                    "author": {"name": "Octo", "email": "octo@example.com", "date": "2024-01-10T01:00:00Z"},
                    "committer": null
                },
                "author": {"login": "octocat"}
            }
        ]);
        Mock::given(method("GET"))
            .and(path(format!("/repos/{OWNER_REPO}/commits")))
            .and(query_param("since", "2024-01-09T00:00:00Z"))
            .and(query_param("until", "2024-01-10T00:00:00Z"))
            .and(query_param("page", "1"))
            .respond_with(move |_: &wiremock::Request| {
                hits.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_json(body.clone())
            })
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_daily_github_commits_scenario() {
        let server = MockServer::start().await;
        let hits = Arc::new(AtomicUsize::new(0));
        mock_commits(&server, hits.clone()).await;

        let mut env = setup().await;
        env.config.github_api_url = server.uri();
        let artifacts = seed_artifacts(&env.pool, &[user_key("octocat"), repo_key(OWNER_REPO)]).await;

        let mut scheduler = scheduler(&env);
        scheduler.register_collector(github::descriptor()).unwrap();

        let queued = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(queued.created_count(), 2);
        for job in &queued.created {
            assert_eq!(job.range, jan_range(9, 10));
            assert_eq!(job.group, "github");
        }

        let failures = scheduler.run_worker("github").await.unwrap();
        assert!(failures.is_empty(), "{failures:?}");
        for artifact in &artifacts {
            let covered = scheduler
                .pointers()
                .covered(artifact.id, github::COLLECTOR_NAME)
                .await
                .unwrap();
            assert!(covered.covers(&jan_range(9, 10)));
        }

        // Only the commit inside the day is recorded, credited to the user.
        let events = SqlxEventRepository::new(env.pool.clone())
            .list_by_type("COMMIT_CODE")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source_id, "c0ffee");
        assert_eq!(events[0].to_artifact_id, artifacts[1].id);
        assert_eq!(events[0].from_artifact_id, Some(artifacts[0].id));

        let again = scheduler.queue_all(jan(10)).await.unwrap();
        assert_eq!(again.created_count(), 0);

        // A forced re-run of the same day is served from the cache.
        scheduler
            .execute_for_range(github::COLLECTOR_NAME, jan_range(9, 10))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            SqlxEventRepository::new(env.pool.clone())
                .list_by_type("COMMIT_CODE")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_rebased_commit_is_recorded_on_its_commit_day() {
        let server = MockServer::start().await;
        let body = json!([{
            "sha": "rebased",
            "commit": {
                "author": {"name": "Octo", "email": "octo@example.com", "date": "2024-01-05T08:00:00Z"},
                "committer": {"name": "Bot", "email": "bot@example.com", "date": "2024-01-09T10:00:00Z"}
            },
            "author": {"login": "octocat"}
        }]);
        Mock::given(method("GET"))
            .and(path(format!("/repos/{OWNER_REPO}/commits")))
            .and(query_param("since", "2024-01-09T00:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/repos/{OWNER_REPO}/commits")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let mut env = setup().await;
        env.config.github_api_url = server.uri();
        seed_artifacts(&env.pool, &[repo_key(OWNER_REPO)]).await;

        let mut scheduler = scheduler(&env);
        scheduler.register_collector(github::descriptor()).unwrap();
        scheduler
            .execute_for_range(github::COLLECTOR_NAME, jan_range(3, 10))
            .await
            .unwrap();

        let events = SqlxEventRepository::new(env.pool.clone())
            .list_by_type("COMMIT_CODE")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source_id, "rebased");
        assert_eq!(events[0].time.to_rfc3339(), "2024-01-09T10:00:00+00:00");
    }

    #[tokio::test]
    async fn test_api_errors_fail_the_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let mut env = setup().await;
        env.config.github_api_url = server.uri();
        let artifacts = seed_artifacts(&env.pool, &[repo_key(OWNER_REPO)]).await;

        let mut scheduler = scheduler(&env);
        scheduler.register_collector(github::descriptor()).unwrap();
        scheduler.queue_all(jan(10)).await.unwrap();

        let failures = scheduler.run_worker("github").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("upstream down"));
        assert!(
            scheduler
                .pointers()
                .covered(artifacts[0].id, github::COLLECTOR_NAME)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
