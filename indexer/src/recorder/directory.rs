//! Artifact identity resolution with an in-process id cache.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::database::repositories::ArtifactRepository;
use crate::domain::{Artifact, ArtifactKey};
use crate::{Error, Result};

/// Maps artifact keys to persisted ids, creating unknown artifacts on demand.
///
/// Resolved ids are cached for the lifetime of the directory; artifacts are
/// never deleted so cached entries stay valid.
pub struct ActorDirectory {
    repo: Arc<dyn ArtifactRepository>,
    ids: DashMap<ArtifactKey, i64>,
}

/// Result of [`ActorDirectory::partition`].
#[derive(Debug, Default)]
pub struct Partitioned {
    pub known: HashMap<ArtifactKey, i64>,
    pub unknown: Vec<ArtifactKey>,
}

impl ActorDirectory {
    pub fn new(repo: Arc<dyn ArtifactRepository>) -> Self {
        Self {
            repo,
            ids: DashMap::new(),
        }
    }

    fn remember(&self, artifacts: impl IntoIterator<Item = Artifact>) -> HashMap<ArtifactKey, i64> {
        artifacts
            .into_iter()
            .map(|artifact| {
                let key = artifact.key();
                self.ids.insert(key.clone(), artifact.id);
                (key, artifact.id)
            })
            .collect()
    }

    /// Split `keys` into persisted (with ids) and not yet persisted.
    pub async fn partition(&self, keys: &[ArtifactKey]) -> Result<Partitioned> {
        let mut partitioned = Partitioned::default();
        let mut misses = Vec::new();
        let mut seen = HashSet::new();

        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.ids.get(key) {
                Some(id) => {
                    partitioned.known.insert(key.clone(), *id);
                }
                None => misses.push(key.clone()),
            }
        }

        if !misses.is_empty() {
            let found = self.remember(self.repo.find_by_keys(&misses).await?);
            for key in misses {
                match found.get(&key) {
                    Some(id) => {
                        partitioned.known.insert(key, *id);
                    }
                    None => partitioned.unknown.push(key),
                }
            }
        }

        Ok(partitioned)
    }

    /// Resolve every key to an id, creating the missing artifacts.
    pub async fn resolve(&self, keys: &[ArtifactKey]) -> Result<HashMap<ArtifactKey, i64>> {
        let Partitioned { mut known, unknown } = self.partition(keys).await?;
        if unknown.is_empty() {
            return Ok(known);
        }

        debug!(count = unknown.len(), "Creating unknown artifacts");
        let created = self.remember(self.repo.create_many(&unknown).await?);
        for key in unknown {
            let id = created
                .get(&key)
                .copied()
                .ok_or_else(|| Error::Database(format!("artifact {key} was not created")))?;
            known.insert(key, id);
        }
        Ok(known)
    }

    pub fn cached_len(&self) -> usize {
        self.ids.len()
    }
}
