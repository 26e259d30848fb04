//! Flush and close reports.

use serde::Serialize;

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FlushTrigger {
    Size,
    Interval,
    Explicit,
    Close,
}

/// Summary of one flush, published to subscribers and returned by `flush()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flush_id: u64,
    pub trigger: FlushTrigger,
    pub records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Set when the batch failed; every record of the batch failed with it.
    pub error: Option<String>,
}

impl FlushReport {
    pub(crate) fn empty(flush_id: u64, trigger: FlushTrigger) -> Self {
        Self {
            flush_id,
            trigger,
            records: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of every flush of a recorder session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    pub flushes: usize,
    pub records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl CloseReport {
    pub(crate) fn absorb(&mut self, report: &FlushReport) {
        if report.records == 0 && report.error.is_none() {
            return;
        }
        self.flushes += 1;
        self.records += report.records;
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.skipped += report.skipped;
        if let Some(error) = &report.error {
            self.errors.push(error.clone());
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}
