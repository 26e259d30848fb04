//! Ingested-range bookkeeping per (artifact, collector).

use chrono::{DateTime, Utc};
use date_range::{Range, RangeSet};
use std::sync::Arc;
use tracing::debug;

use crate::collector::Schedule;
use crate::database::repositories::EventPointerRepository;
use crate::Result;

pub struct EventPointerManager {
    repo: Arc<dyn EventPointerRepository>,
    batch_size: usize,
}

impl EventPointerManager {
    pub fn new(repo: Arc<dyn EventPointerRepository>, batch_size: usize) -> Self {
        Self {
            repo,
            batch_size: batch_size.max(1),
        }
    }

    /// The window a scheduler pass through `through` is responsible for:
    /// the whole UTC days before `through`'s day, one for daily and seven for
    /// weekly collectors. Manual collectors have none.
    pub fn lookback_window(schedule: Schedule, through: DateTime<Utc>) -> Result<Option<Range>> {
        let Some(days) = schedule.lookback_days() else {
            return Ok(None);
        };
        Ok(Some(Range::days_ending(through, days)?))
    }

    /// Current covered set; empty when no pointer exists.
    pub async fn covered(&self, artifact_id: i64, collector: &str) -> Result<RangeSet> {
        Ok(self
            .repo
            .get(artifact_id, collector)
            .await?
            .unwrap_or_default())
    }

    /// The smallest range spanning every uncovered part of the lookback
    /// window, or `None` when the window is fully covered.
    pub async fn uncovered_range_for(
        &self,
        artifact_id: i64,
        collector: &str,
        schedule: Schedule,
        through: DateTime<Utc>,
    ) -> Result<Option<Range>> {
        let Some(window) = Self::lookback_window(schedule, through)? else {
            return Ok(None);
        };
        let covered = self.covered(artifact_id, collector).await?;
        Ok(covered.uncovered_span(&window))
    }

    /// [`Self::uncovered_range_for`] for many artifacts. Only artifacts with an
    /// uncovered range are returned, in input order.
    pub async fn uncovered_ranges_for(
        &self,
        artifact_ids: &[i64],
        collector: &str,
        schedule: Schedule,
        through: DateTime<Utc>,
    ) -> Result<Vec<(i64, Range)>> {
        let Some(window) = Self::lookback_window(schedule, through)? else {
            return Ok(Vec::new());
        };

        let mut uncovered = Vec::new();
        for chunk in artifact_ids.chunks(self.batch_size) {
            let pointers = self.repo.list_for_artifacts(collector, chunk).await?;
            for &artifact_id in chunk {
                let span = match pointers.get(&artifact_id) {
                    Some(covered) => covered.uncovered_span(&window),
                    None => Some(window),
                };
                if let Some(span) = span {
                    uncovered.push((artifact_id, span));
                }
            }
        }

        debug!(
            collector,
            artifacts = artifact_ids.len(),
            uncovered = uncovered.len(),
            %window,
            "Computed uncovered ranges"
        );
        Ok(uncovered)
    }

    /// Mark `range` as ingested. Only call once every flush of the run succeeded.
    pub async fn extend_range(
        &self,
        artifact_id: i64,
        collector: &str,
        range: Range,
    ) -> Result<RangeSet> {
        self.repo.extend(artifact_id, collector, range).await
    }
}
