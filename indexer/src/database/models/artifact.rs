//! Artifact database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{Artifact, ArtifactNamespace, ArtifactType};
use crate::{Error, Result};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArtifactDbModel {
    pub id: i64,
    pub namespace: String,
    #[sqlx(rename = "type")]
    pub artifact_type: String,
    pub name: String,
    /// Unix epoch milliseconds
    pub created_at: i64,
}

impl TryFrom<ArtifactDbModel> for Artifact {
    type Error = Error;

    fn try_from(row: ArtifactDbModel) -> Result<Self> {
        let namespace: ArtifactNamespace = row.namespace.parse().map_err(|_| {
            Error::Database(format!(
                "artifact {} has unknown namespace {}",
                row.id, row.namespace
            ))
        })?;
        let artifact_type: ArtifactType = row.artifact_type.parse().map_err(|_| {
            Error::Database(format!(
                "artifact {} has unknown type {}",
                row.id, row.artifact_type
            ))
        })?;
        Ok(Artifact {
            id: row.id,
            namespace,
            artifact_type,
            name: row.name,
        })
    }
}
