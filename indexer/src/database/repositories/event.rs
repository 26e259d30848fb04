//! Event repository.

use async_trait::async_trait;
use date_range::Range;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;

use crate::database::models::{EventDbModel, EventRow};
use crate::database::time::datetime_to_ms;
use crate::database::{BULK_CHUNK_SIZE, DbPool};
use crate::domain::Event;
use crate::Result;

/// Result of writing a single row of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenEvent {
    pub id: i64,
    /// `false` when a concurrent writer stored the same dedup key first.
    pub inserted: bool,
}

/// Selects stored events of one type, optionally pinned to a version and a
/// time window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub type_name: String,
    pub type_version: Option<u32>,
    pub range: Option<Range>,
}

impl EventFilter {
    pub fn for_type(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            type_version: None,
            range: None,
        }
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Map of `source_id -> event id` for the given type's existing rows.
    async fn find_existing(
        &self,
        type_name: &str,
        source_ids: &[String],
    ) -> Result<HashMap<String, i64>>;

    /// Insert `inserts` and overwrite `updates` (matched by id) in one transaction.
    ///
    /// Returns one entry per insert, in order.
    async fn write_batch(
        &self,
        inserts: &[EventRow],
        updates: &[EventRow],
    ) -> Result<Vec<WrittenEvent>>;

    /// Events matching `filter`, ordered by time then id.
    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    async fn list_by_type(&self, type_name: &str) -> Result<Vec<Event>> {
        self.list(&EventFilter::for_type(type_name)).await
    }
}

pub struct SqlxEventRepository {
    pool: DbPool,
}

impl SqlxEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for SqlxEventRepository {
    async fn find_existing(
        &self,
        type_name: &str,
        source_ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        let mut existing = HashMap::new();
        for chunk in source_ids.chunks(BULK_CHUNK_SIZE) {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                r#"
                SELECT id, source_id FROM event
                WHERE type_name = ?
                  AND source_id IN (SELECT value FROM json_each(?))
                "#,
            )
            .bind(type_name)
            .bind(serde_json::to_string(chunk)?)
            .fetch_all(&self.pool)
            .await?;
            existing.extend(rows.into_iter().map(|(id, source_id)| (source_id, id)));
        }
        Ok(existing)
    }

    async fn write_batch(
        &self,
        inserts: &[EventRow],
        updates: &[EventRow],
    ) -> Result<Vec<WrittenEvent>> {
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(inserts.len());

        for row in inserts {
            let id: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO event (type_name, type_version, source_id, time, to_id, from_id, amount, details, size)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (type_name, source_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&row.type_name)
            .bind(row.type_version)
            .bind(&row.source_id)
            .bind(row.time)
            .bind(row.to_id)
            .bind(row.from_id)
            .bind(row.amount)
            .bind(&row.details)
            .bind(row.size)
            .fetch_optional(&mut *tx)
            .await?;

            let entry = match id {
                Some(id) => WrittenEvent { id, inserted: true },
                None => {
                    let id: i64 = sqlx::query_scalar(
                        "SELECT id FROM event WHERE type_name = ? AND source_id = ?",
                    )
                    .bind(&row.type_name)
                    .bind(&row.source_id)
                    .fetch_one(&mut *tx)
                    .await?;
                    WrittenEvent {
                        id,
                        inserted: false,
                    }
                }
            };
            written.push(entry);
        }

        for row in updates {
            let Some(id) = row.id else {
                continue;
            };
            sqlx::query(
                r#"
                UPDATE event SET
                    type_version = ?,
                    time = ?,
                    to_id = ?,
                    from_id = ?,
                    amount = ?,
                    details = ?,
                    size = ?
                WHERE id = ?
                "#,
            )
            .bind(row.type_version)
            .bind(row.time)
            .bind(row.to_id)
            .bind(row.from_id)
            .bind(row.amount)
            .bind(&row.details)
            .bind(row.size)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM event WHERE type_name = ");
        query.push_bind(&filter.type_name);
        if let Some(version) = filter.type_version {
            query.push(" AND type_version = ").push_bind(i64::from(version));
        }
        if let Some(range) = &filter.range {
            query
                .push(" AND time >= ")
                .push_bind(datetime_to_ms(range.start()))
                .push(" AND time < ")
                .push_bind(datetime_to_ms(range.end()));
        }
        query.push(" ORDER BY time, id");

        let rows = query
            .build_query_as::<EventDbModel>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(EventDbModel::into_event).collect()
    }
}
