//! Event pointer database model.

use date_range::RangeSet;
use sqlx::FromRow;

use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct EventPointerDbModel {
    pub id: i64,
    pub artifact_id: i64,
    pub collector: String,
    /// JSON list of `{start, end}` ranges
    pub ranges: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EventPointerDbModel {
    pub fn range_set(&self) -> Result<RangeSet> {
        Ok(serde_json::from_str(&self.ranges)?)
    }
}
