//! Artifact repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};

use crate::database::models::ArtifactDbModel;
use crate::database::time::now_ms;
use crate::database::{BULK_CHUNK_SIZE, DbPool};
use crate::domain::{Artifact, ArtifactKey, ArtifactScope};
use crate::{Error, Result};

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn get(&self, id: i64) -> Result<Artifact>;
    /// Look up persisted artifacts for the given keys; unknown keys are absent from the result.
    async fn find_by_keys(&self, keys: &[ArtifactKey]) -> Result<Vec<Artifact>>;
    /// Create any missing artifacts and return all of them, persisted.
    async fn create_many(&self, keys: &[ArtifactKey]) -> Result<Vec<Artifact>>;
    async fn list_in_scope(&self, scope: &ArtifactScope) -> Result<Vec<Artifact>>;
}

pub struct SqlxArtifactRepository {
    pool: DbPool,
}

impl SqlxArtifactRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn into_artifacts(rows: Vec<ArtifactDbModel>) -> Result<Vec<Artifact>> {
    rows.into_iter().map(Artifact::try_from).collect()
}

#[async_trait]
impl ArtifactRepository for SqlxArtifactRepository {
    async fn get(&self, id: i64) -> Result<Artifact> {
        sqlx::query_as::<_, ArtifactDbModel>("SELECT * FROM artifact WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Artifact", id.to_string()))
            .and_then(Artifact::try_from)
    }

    async fn find_by_keys(&self, keys: &[ArtifactKey]) -> Result<Vec<Artifact>> {
        let mut found = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(BULK_CHUNK_SIZE) {
            let keys_json = serde_json::to_string(chunk)?;
            let rows = sqlx::query_as::<_, ArtifactDbModel>(
                r#"
                SELECT a.* FROM artifact a
                JOIN json_each(?) k
                  ON a.namespace = json_extract(k.value, '$.namespace')
                 AND a.type = json_extract(k.value, '$.type')
                 AND a.name = json_extract(k.value, '$.name')
                "#,
            )
            .bind(&keys_json)
            .fetch_all(&self.pool)
            .await?;
            found.extend(into_artifacts(rows)?);
        }
        Ok(found)
    }

    async fn create_many(&self, keys: &[ArtifactKey]) -> Result<Vec<Artifact>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        for chunk in keys.chunks(BULK_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO artifact (namespace, type, name, created_at) ",
            );
            builder.push_values(chunk, |mut row, key| {
                row.push_bind(key.namespace.as_str())
                    .push_bind(key.artifact_type.as_str())
                    .push_bind(&key.name)
                    .push_bind(now);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.find_by_keys(keys).await
    }

    async fn list_in_scope(&self, scope: &ArtifactScope) -> Result<Vec<Artifact>> {
        let namespaces: Vec<&str> = scope.namespaces.iter().map(|n| n.as_str()).collect();
        let types: Vec<&str> = scope.types.iter().map(|t| t.as_str()).collect();

        let rows = sqlx::query_as::<_, ArtifactDbModel>(
            r#"
            SELECT * FROM artifact
            WHERE (json_array_length(?1) = 0 OR namespace IN (SELECT value FROM json_each(?1)))
              AND (json_array_length(?2) = 0 OR type IN (SELECT value FROM json_each(?2)))
            ORDER BY id
            "#,
        )
        .bind(serde_json::to_string(&namespaces)?)
        .bind(serde_json::to_string(&types)?)
        .fetch_all(&self.pool)
        .await?;
        into_artifacts(rows)
    }
}
