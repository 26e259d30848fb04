//! Collector contract.
//!
//! A collector fetches events from one external source for a date range and
//! hands them to the recorder. The scheduler builds a fresh collector per job
//! through the factory in its [`CollectorDescriptor`].

pub mod github;
pub mod registry;

pub use registry::CollectorRegistry;

use async_trait::async_trait;
use date_range::Range;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::cache::TimeSeriesCache;
use crate::config::IndexerConfig;
use crate::domain::{Artifact, ArtifactNamespace, ArtifactScope, ArtifactType};
use crate::recorder::EventRecorder;
use crate::Result;

#[async_trait]
pub trait Collector: Send + Sync {
    /// Record every event of `artifacts` inside `range`.
    ///
    /// Must be safe to re-run over the same range: the recorder deduplicates
    /// on each event's source id.
    async fn collect(&self, artifacts: &[Artifact], range: &Range) -> Result<()>;
}

/// Everything a collector is built from.
#[derive(Clone)]
pub struct CollectorContext {
    pub config: Arc<IndexerConfig>,
    pub recorder: EventRecorder,
    pub cache: Arc<TimeSeriesCache>,
}

/// How often `queue_all` enqueues a collector.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    Daily,
    Weekly,
    /// Only run through `execute_for_range` or ad-hoc jobs.
    Manual,
}

impl Schedule {
    /// Days of lookback per scheduler pass; `None` for manual collectors.
    pub fn lookback_days(&self) -> Option<i64> {
        match self {
            Self::Daily => Some(1),
            Self::Weekly => Some(7),
            Self::Manual => None,
        }
    }
}

pub type CollectorFactory =
    Arc<dyn Fn(CollectorContext) -> Result<Box<dyn Collector>> + Send + Sync>;

/// Registration record for a collector.
#[derive(Clone)]
pub struct CollectorDescriptor {
    pub name: String,
    pub description: String,
    /// Worker pool this collector's jobs run in.
    pub group: String,
    pub schedule: Schedule,
    pub artifact_scope: Vec<ArtifactNamespace>,
    pub artifact_type_scope: Vec<ArtifactType>,
    pub factory: CollectorFactory,
}

impl CollectorDescriptor {
    pub fn new<F>(
        name: impl Into<String>,
        group: impl Into<String>,
        schedule: Schedule,
        factory: F,
    ) -> Self
    where
        F: Fn(CollectorContext) -> Result<Box<dyn Collector>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            group: group.into(),
            schedule,
            artifact_scope: Vec::new(),
            artifact_type_scope: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_scope(
        mut self,
        namespaces: impl IntoIterator<Item = ArtifactNamespace>,
        types: impl IntoIterator<Item = ArtifactType>,
    ) -> Self {
        self.artifact_scope = namespaces.into_iter().collect();
        self.artifact_type_scope = types.into_iter().collect();
        self
    }

    pub fn scope(&self) -> ArtifactScope {
        ArtifactScope::new(self.artifact_scope.clone(), self.artifact_type_scope.clone())
    }

    pub fn build(&self, context: CollectorContext) -> Result<Box<dyn Collector>> {
        (self.factory)(context)
    }
}

impl fmt::Debug for CollectorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorDescriptor")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("schedule", &self.schedule)
            .field("artifact_scope", &self.artifact_scope)
            .field("artifact_type_scope", &self.artifact_type_scope)
            .finish_non_exhaustive()
    }
}
