//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use date_range::Range;
use std::sync::Arc;
use tempfile::TempDir;

use oso_indexer::collector::{Collector, CollectorDescriptor, Schedule};
use oso_indexer::config::IndexerConfig;
use oso_indexer::database::repositories::{ArtifactRepository, SqlxArtifactRepository};
use oso_indexer::database::{DbPool, connect};
use oso_indexer::domain::{
    Artifact, ArtifactKey, ArtifactNamespace, ArtifactType, EventType, IncompleteEvent,
};
use oso_indexer::recorder::{EventRecorder, GenericEventTypeStrategy};
use oso_indexer::{Error, Result};

pub struct TestEnv {
    pub dir: TempDir,
    pub pool: DbPool,
    pub config: IndexerConfig,
}

/// A migrated file-backed database plus a config whose directories live in
/// the same temp dir.
pub async fn setup() -> TestEnv {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("indexer.db").display());
    let pool = connect(&url).await.expect("Failed to open test database");

    let config = IndexerConfig {
        database_url: url,
        cache_dir: dir.path().join("cache"),
        run_dir: dir.path().join("run"),
        batch_size: 2,
        ..IndexerConfig::default()
    };

    TestEnv { dir, pool, config }
}

pub fn jan(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

pub fn jan_range(start: u32, end: u32) -> Range {
    Range::new(jan(start), jan(end)).unwrap()
}

pub fn repo_key(name: &str) -> ArtifactKey {
    ArtifactKey::new(ArtifactNamespace::Github, ArtifactType::GitRepository, name)
}

pub fn user_key(name: &str) -> ArtifactKey {
    ArtifactKey::new(ArtifactNamespace::Github, ArtifactType::GithubUser, name)
}

pub async fn seed_artifacts(pool: &DbPool, keys: &[ArtifactKey]) -> Vec<Artifact> {
    let mut artifacts = SqlxArtifactRepository::new(pool.clone())
        .create_many(keys)
        .await
        .expect("Failed to seed artifacts");
    artifacts.sort_by_key(|a| a.id);
    artifacts
}

pub fn test_event_type() -> EventType {
    EventType::new("TEST_EVENT", 1)
}

pub fn test_event(source_id: &str, time: DateTime<Utc>, to: ArtifactKey) -> IncompleteEvent {
    IncompleteEvent::new(time, test_event_type(), source_id, to, 1.0)
}

/// What a [`FakeCollector`] does when run.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Record one event per artifact at the start of the range.
    RecordOne,
    Fail,
    /// Close the session's recorder, then fail.
    CloseThenFail,
}

pub struct FakeCollector {
    name: String,
    behavior: Behavior,
    recorder: EventRecorder,
}

#[async_trait]
impl Collector for FakeCollector {
    async fn collect(&self, artifacts: &[Artifact], range: &Range) -> Result<()> {
        match self.behavior {
            Behavior::Fail => Err(Error::collector(&self.name, "boom")),
            Behavior::CloseThenFail => {
                self.recorder.close().await?;
                Err(Error::collector(&self.name, "boom after close"))
            }
            Behavior::RecordOne => {
                for artifact in artifacts {
                    let source_id = format!(
                        "{}:{}:{}",
                        self.name,
                        artifact.id,
                        range.start().timestamp()
                    );
                    self.recorder
                        .record(test_event(&source_id, range.start(), artifact.key()))?;
                }
                Ok(())
            }
        }
    }
}

pub fn fake_descriptor(
    name: &str,
    group: &str,
    schedule: Schedule,
    behavior: Behavior,
) -> CollectorDescriptor {
    let collector_name = name.to_string();
    CollectorDescriptor::new(name, group, schedule, move |context| {
        context
            .recorder
            .register_event_type(GenericEventTypeStrategy::new(test_event_type()));
        Ok(Box::new(FakeCollector {
            name: collector_name.clone(),
            behavior,
            recorder: context.recorder,
        }) as Box<dyn Collector>)
    })
    .with_scope(
        [ArtifactNamespace::Github],
        [ArtifactType::GitRepository, ArtifactType::GithubUser],
    )
}

pub fn arc_config(env: &TestEnv) -> Arc<IndexerConfig> {
    Arc::new(env.config.clone())
}
