//! Event pointer repository.

use async_trait::async_trait;
use date_range::{Range, RangeSet};
use std::collections::HashMap;

use crate::database::models::EventPointerDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{DbPool, begin_immediate};
use crate::Result;

#[async_trait]
pub trait EventPointerRepository: Send + Sync {
    /// Covered ranges for one (artifact, collector); `None` if no pointer exists yet.
    async fn get(&self, artifact_id: i64, collector: &str) -> Result<Option<RangeSet>>;
    /// Covered ranges for many artifacts of one collector. Artifacts without a
    /// pointer are absent from the map.
    async fn list_for_artifacts(
        &self,
        collector: &str,
        artifact_ids: &[i64],
    ) -> Result<HashMap<i64, RangeSet>>;
    /// Insert `range` into the pointer's set, creating the pointer if needed.
    /// Returns the coalesced set after the insert.
    async fn extend(&self, artifact_id: i64, collector: &str, range: Range) -> Result<RangeSet>;
}

pub struct SqlxEventPointerRepository {
    pool: DbPool,
}

impl SqlxEventPointerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn extend_once(
        &self,
        artifact_id: i64,
        collector: &str,
        range: Range,
    ) -> Result<RangeSet> {
        let mut tx = begin_immediate(&self.pool).await?;

        let existing = sqlx::query_as::<_, EventPointerDbModel>(
            "SELECT * FROM event_pointer WHERE artifact_id = ? AND collector = ?",
        )
        .bind(artifact_id)
        .bind(collector)
        .fetch_optional(&mut *tx)
        .await?;

        let mut ranges = match &existing {
            Some(row) => row.range_set()?,
            None => RangeSet::new(),
        };
        ranges.insert(range);
        let ranges_json = serde_json::to_string(&ranges)?;
        let now = now_ms();

        if existing.is_some() {
            sqlx::query(
                "UPDATE event_pointer SET ranges = ?, updated_at = ? WHERE artifact_id = ? AND collector = ?",
            )
            .bind(&ranges_json)
            .bind(now)
            .bind(artifact_id)
            .bind(collector)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO event_pointer (artifact_id, collector, ranges, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(artifact_id)
            .bind(collector)
            .bind(&ranges_json)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ranges)
    }
}

#[async_trait]
impl EventPointerRepository for SqlxEventPointerRepository {
    async fn get(&self, artifact_id: i64, collector: &str) -> Result<Option<RangeSet>> {
        sqlx::query_as::<_, EventPointerDbModel>(
            "SELECT * FROM event_pointer WHERE artifact_id = ? AND collector = ?",
        )
        .bind(artifact_id)
        .bind(collector)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.range_set())
        .transpose()
    }

    async fn list_for_artifacts(
        &self,
        collector: &str,
        artifact_ids: &[i64],
    ) -> Result<HashMap<i64, RangeSet>> {
        if artifact_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, EventPointerDbModel>(
            r#"
            SELECT * FROM event_pointer
            WHERE collector = ?
              AND artifact_id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(collector)
        .bind(serde_json::to_string(artifact_ids)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.artifact_id, row.range_set()?)))
            .collect()
    }

    async fn extend(&self, artifact_id: i64, collector: &str, range: Range) -> Result<RangeSet> {
        retry_on_sqlite_busy("extend_event_pointer", || {
            self.extend_once(artifact_id, collector, range)
        })
        .await
    }
}
