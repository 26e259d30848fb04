//! Integration tests for storage and the event recorder.
//!
//! Every test runs against a fresh file-backed SQLite database with the real
//! migrations applied.

mod common;

use std::sync::Arc;
use std::time::Duration;

use oso_indexer::config::RecorderConfig;
use oso_indexer::database::repositories::{
    EventPointerRepository, EventRepository, JobRepository, SqlxArtifactRepository,
    SqlxEventPointerRepository, SqlxEventRepository, SqlxJobRepository,
};
use oso_indexer::database::DbPool;
use oso_indexer::domain::{ArtifactNamespace, ArtifactType, Job, JobExecution, JobStatus};
use oso_indexer::recorder::{
    ActorDirectory, EventRecorder, FlushTrigger, GenericEventTypeStrategy, RecordError,
    RecordOutcome, RecorderOptions, wait,
};
use oso_indexer::Error;

use common::*;

fn recorder(pool: &DbPool, config: RecorderConfig) -> EventRecorder {
    let directory = Arc::new(ActorDirectory::new(Arc::new(SqlxArtifactRepository::new(
        pool.clone(),
    ))));
    let recorder = EventRecorder::new(
        directory,
        Arc::new(SqlxEventRepository::new(pool.clone())),
        config,
    );
    recorder.register_event_type(GenericEventTypeStrategy::new(test_event_type()));
    recorder
}

fn quiet_config() -> RecorderConfig {
    RecorderConfig {
        max_batch_size: 1000,
        flush_interval_ms: 60_000,
    }
}

mod storage_tests {
    use super::*;
    use oso_indexer::database::repositories::ArtifactRepository;
    use oso_indexer::domain::{ArtifactKey, ArtifactScope};

    #[tokio::test]
    async fn test_claim_follows_creation_order_within_group() {
        let env = setup().await;
        let jobs = SqlxJobRepository::new(env.pool.clone());

        let first = Job::new("a", "github", None, jan(10), jan_range(1, 2));
        let other_group = Job::new("b", "npm", None, jan(10), jan_range(1, 2));
        let second = Job::new("a", "github", None, jan(10), jan_range(2, 3));
        for job in [&first, &other_group, &second] {
            assert!(jobs.create_if_absent(job).await.unwrap());
        }

        let claimed = jobs.claim_next_pending("github").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let claimed = jobs.claim_next_pending("github").await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(jobs.claim_next_pending("github").await.unwrap().is_none());
        assert_eq!(
            jobs.list_jobs_by_status(JobStatus::Pending).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_open_job_is_not_duplicated() {
        let env = setup().await;
        let artifacts = seed_artifacts(&env.pool, &[repo_key("o/r")]).await;
        let jobs = SqlxJobRepository::new(env.pool.clone());

        let job = Job::new("c", "g", Some(artifacts[0].id), jan(10), jan_range(9, 10));
        let twin = Job::new("c", "g", Some(artifacts[0].id), jan(10), jan_range(9, 10));
        assert!(jobs.create_if_absent(&job).await.unwrap());
        assert!(!jobs.create_if_absent(&twin).await.unwrap());

        // Once the job is terminal, the same range may be queued again.
        jobs.claim_next_pending("g").await.unwrap().unwrap();
        jobs.finish_job(&job.id, JobStatus::Failed).await.unwrap();
        assert!(jobs.create_if_absent(&twin).await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_job_rejects_invalid_transition() {
        let env = setup().await;
        let jobs = SqlxJobRepository::new(env.pool.clone());
        let job = Job::new("c", "g", None, jan(10), jan_range(9, 10));
        jobs.create_if_absent(&job).await.unwrap();

        let err = jobs
            .finish_job(&job.id, JobStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(jobs.get_job(&job.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_executions_are_counted_per_job() {
        let env = setup().await;
        let jobs = SqlxJobRepository::new(env.pool.clone());
        let job = Job::new("c", "g", None, jan(10), jan_range(9, 10));
        jobs.create_if_absent(&job).await.unwrap();

        let execution = JobExecution::start(job.id.clone(), 1);
        jobs.create_execution(&execution).await.unwrap();
        jobs.finish_execution(&execution.id, JobStatus::Failed, Some("boom"))
            .await
            .unwrap();

        assert_eq!(jobs.count_executions(&job.id).await.unwrap(), 1);
        let executions = jobs.list_executions(&job.id).await.unwrap();
        assert_eq!(executions[0].status, JobStatus::Failed);
        assert_eq!(executions[0].error_detail.as_deref(), Some("boom"));
        assert!(executions[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pointer_extend_coalesces() {
        let env = setup().await;
        let artifacts = seed_artifacts(&env.pool, &[repo_key("o/r")]).await;
        let id = artifacts[0].id;
        let pointers = SqlxEventPointerRepository::new(env.pool.clone());

        assert!(pointers.get(id, "c").await.unwrap().is_none());

        pointers.extend(id, "c", jan_range(1, 2)).await.unwrap();
        pointers.extend(id, "c", jan_range(3, 4)).await.unwrap();
        let covered = pointers.extend(id, "c", jan_range(2, 3)).await.unwrap();
        assert_eq!(covered.as_slice(), &[jan_range(1, 4)]);

        let stored = pointers.get(id, "c").await.unwrap().unwrap();
        assert_eq!(stored, covered);

        // Pointers are per collector.
        assert!(pointers.get(id, "other").await.unwrap().is_none());
        let listed = pointers.list_for_artifacts("c", &[id, id + 100]).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[&id].covers(&jan_range(2, 4)));
    }

    #[tokio::test]
    async fn test_artifacts_in_scope() {
        let env = setup().await;
        seed_artifacts(
            &env.pool,
            &[
                repo_key("o/r"),
                user_key("octocat"),
                ArtifactKey::new(ArtifactNamespace::Optimism, ArtifactType::EoaAddress, "0x1"),
            ],
        )
        .await;
        let repo = SqlxArtifactRepository::new(env.pool.clone());

        let github = ArtifactScope::new(vec![ArtifactNamespace::Github], vec![]);
        assert_eq!(repo.list_in_scope(&github).await.unwrap().len(), 2);

        let repos_only = ArtifactScope::new(
            vec![ArtifactNamespace::Github],
            vec![ArtifactType::GitRepository],
        );
        let found = repo.list_in_scope(&repos_only).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "o/r");

        assert_eq!(
            repo.list_in_scope(&ArtifactScope::default())
                .await
                .unwrap()
                .len(),
            3
        );
    }
}

mod recorder_tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_source_ids_write_one_row() {
        let env = setup().await;
        let recorder = recorder(&env.pool, quiet_config());

        let handles: Vec<_> = [1.0, 2.0, 3.0]
            .into_iter()
            .map(|amount| {
                let mut event = test_event("sha-1", jan(9), repo_key("o/r"));
                event.amount = amount;
                recorder.record(event).unwrap()
            })
            .collect();

        let report = recorder.close().await.unwrap();
        assert!(report.is_ok());
        assert_eq!((report.inserted, report.skipped), (1, 2));

        let results = wait(handles, Some(Duration::from_secs(5))).await;
        assert!(results.is_ok());
        let ids: Vec<_> = results.successes.values().map(|r| r.event_id).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(
            results.successes.values().next().unwrap().outcome,
            RecordOutcome::Inserted
        );

        let rows = SqlxEventRepository::new(env.pool.clone())
            .list_by_type("TEST_EVENT")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 1.0);
        assert_eq!(rows[0].source_id, "sha-1");
    }

    #[tokio::test]
    async fn test_existing_rows_are_skipped_then_overwritten() {
        let env = setup().await;
        let events = SqlxEventRepository::new(env.pool.clone());

        let first = recorder(&env.pool, quiet_config());
        first.record(test_event("sha-1", jan(9), repo_key("o/r"))).unwrap();
        first.close().await.unwrap();

        let second = recorder(&env.pool, quiet_config());
        let mut event = test_event("sha-1", jan(9), repo_key("o/r"));
        event.amount = 7.0;
        let handle = second.record(event).unwrap();
        second.close().await.unwrap();
        assert_eq!(handle.wait().await.unwrap().outcome, RecordOutcome::Skipped);
        assert_eq!(events.list_by_type("TEST_EVENT").await.unwrap()[0].amount, 1.0);

        let third = recorder(&env.pool, quiet_config());
        third.set_options(RecorderOptions {
            overwrite_existing_events: true,
        });
        let mut handles = Vec::new();
        for amount in [4.0, 5.0] {
            let mut event = test_event("sha-1", jan(9), repo_key("o/r"));
            event.amount = amount;
            handles.push(third.record(event).unwrap());
        }
        let report = third.close().await.unwrap();
        assert_eq!((report.updated, report.skipped), (1, 1));

        let rows = events.list_by_type("TEST_EVENT").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 5.0);

        let results = wait(handles, None).await;
        let outcomes: Vec<_> = results.successes.values().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![RecordOutcome::Skipped, RecordOutcome::Updated]);
    }

    #[tokio::test]
    async fn test_unknown_artifacts_are_created() {
        let env = setup().await;
        let recorder = recorder(&env.pool, quiet_config());

        let event = test_event("sha-1", jan(9), repo_key("o/r")).with_from(user_key("octocat"));
        let handle = recorder.record(event).unwrap();
        recorder.close().await.unwrap();
        let response = handle.wait().await.unwrap();

        let rows = SqlxEventRepository::new(env.pool.clone())
            .list_by_type("TEST_EVENT")
            .await
            .unwrap();
        assert_eq!(rows[0].id, response.event_id);
        assert!(rows[0].from_artifact_id.is_some());
        assert_ne!(rows[0].from_artifact_id, Some(rows[0].to_artifact_id));
    }

    #[tokio::test]
    async fn test_stored_events_follow_type_and_session_range() {
        let env = setup().await;

        let writer = recorder(&env.pool, quiet_config());
        for (source_id, day) in [("a", 3), ("b", 9), ("c", 12)] {
            writer.record(test_event(source_id, jan(day), repo_key("o/r"))).unwrap();
        }
        writer.close().await.unwrap();

        let reader = recorder(&env.pool, quiet_config());
        let everything = reader.stored_events(&test_event_type()).await.unwrap();
        assert_eq!(everything.len(), 3);

        reader.set_range(jan_range(5, 12));
        let windowed = reader.stored_events(&test_event_type()).await.unwrap();
        let ids: Vec<_> = windowed.iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);

        let unknown = oso_indexer::domain::EventType::new("UNKNOWN", 1);
        assert!(matches!(
            reader.stored_events(&unknown).await,
            Err(Error::Validation(_))
        ));
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_validation() {
        let env = setup().await;
        let recorder = recorder(&env.pool, quiet_config());
        recorder.set_actor_scope(&[ArtifactNamespace::Github], &[ArtifactType::GitRepository]);
        recorder.set_range(jan_range(9, 10));

        // Unregistered type
        let mut event = test_event("x", jan(9), repo_key("o/r"));
        event.event_type = oso_indexer::domain::EventType::new("UNKNOWN", 1);
        assert!(matches!(recorder.record(event), Err(Error::Validation(_))));

        // `from` outside the scope
        let event = test_event("x", jan(9), repo_key("o/r")).with_from(user_key("octocat"));
        assert!(matches!(recorder.record(event), Err(Error::Validation(_))));

        // Outside the range; the end is exclusive.
        let event = test_event("x", jan(10), repo_key("o/r"));
        assert!(matches!(recorder.record(event), Err(Error::Validation(_))));

        let event = test_event("", jan(9), repo_key("o/r"));
        assert!(matches!(recorder.record(event), Err(Error::Validation(_))));

        let report = recorder.close().await.unwrap();
        assert_eq!(report.records, 0);

        // Closed
        let event = test_event("x", jan(9), repo_key("o/r"));
        assert!(matches!(recorder.record(event), Err(Error::Recorder(_))));
        assert!(recorder.close().await.is_err());
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_and_publishes() {
        let env = setup().await;
        let recorder = recorder(
            &env.pool,
            RecorderConfig {
                max_batch_size: 2,
                flush_interval_ms: 60_000,
            },
        );
        let mut reports = recorder.subscribe();

        let a = recorder.record(test_event("a", jan(9), repo_key("o/r"))).unwrap();
        let b = recorder.record(test_event("b", jan(9), repo_key("o/r"))).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.trigger, FlushTrigger::Size);
        assert_eq!((report.records, report.inserted), (2, 2));

        assert_eq!(a.wait().await.unwrap().outcome, RecordOutcome::Inserted);
        assert_eq!(b.wait().await.unwrap().outcome, RecordOutcome::Inserted);
        recorder.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_trigger_flushes() {
        let env = setup().await;
        let recorder = recorder(
            &env.pool,
            RecorderConfig {
                max_batch_size: 1000,
                flush_interval_ms: 50,
            },
        );
        let mut reports = recorder.subscribe();

        let handle = recorder.record(test_event("a", jan(9), repo_key("o/r"))).unwrap();
        let response = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.outcome, RecordOutcome::Inserted);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.trigger, FlushTrigger::Interval);

        let summary = recorder.close().await.unwrap();
        assert_eq!(summary.flushes, 1);
    }

    #[tokio::test]
    async fn test_explicit_flush_returns_its_report() {
        let env = setup().await;
        let recorder = recorder(&env.pool, quiet_config());

        let empty = recorder.flush().await.unwrap();
        assert_eq!(empty.records, 0);

        recorder.record(test_event("a", jan(9), repo_key("o/r"))).unwrap();
        let report = recorder.flush().await.unwrap();
        assert_eq!(report.trigger, FlushTrigger::Explicit);
        assert_eq!(report.inserted, 1);
        assert!(report.flush_id > empty.flush_id);

        let summary = recorder.close().await.unwrap();
        assert_eq!((summary.flushes, summary.inserted), (1, 1));
    }

    #[tokio::test]
    async fn test_storage_failure_fails_every_handle() {
        let env = setup().await;
        let recorder = recorder(&env.pool, quiet_config());

        let handles = vec![
            recorder.record(test_event("a", jan(9), repo_key("o/r"))).unwrap(),
            recorder.record(test_event("b", jan(9), repo_key("o/r"))).unwrap(),
        ];
        env.pool.close().await;

        let report = recorder.flush().await.unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.records, 2);

        let results = wait(handles, Some(Duration::from_secs(5))).await;
        assert!(results.successes.is_empty());
        assert_eq!(results.failures.len(), 2);
        assert!(
            results
                .failures
                .values()
                .all(|e| matches!(e, RecordError::Flush(_)))
        );

        let summary = recorder.close().await.unwrap();
        assert!(!summary.is_ok());
        assert_eq!(summary.errors.len(), 1);
    }
}
