//! Per-record completion handles.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What a flush did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RecordOutcome {
    /// A new row was written.
    Inserted,
    /// An existing row with the same dedup key was overwritten.
    Updated,
    /// A row with the same dedup key already existed (or an earlier record of
    /// the same batch won); nothing was written for this record.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordResponse {
    /// Id of the row holding this record's dedup key.
    pub event_id: i64,
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("flush failed: {0}")]
    Flush(String),
    #[error("record was dropped before its batch was flushed")]
    Dropped,
    #[error("timed out waiting for the record to flush")]
    Timeout,
}

pub(crate) type Responder = oneshot::Sender<Result<RecordResponse, RecordError>>;

/// Returned by `record()`; resolves once the owning batch has been flushed.
#[derive(Debug)]
pub struct RecordHandle {
    id: u64,
    rx: oneshot::Receiver<Result<RecordResponse, RecordError>>,
}

impl RecordHandle {
    pub(crate) fn new(id: u64) -> (Self, Responder) {
        let (tx, rx) = oneshot::channel();
        (Self { id, rx }, tx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> Result<RecordResponse, RecordError> {
        self.rx.await.unwrap_or(Err(RecordError::Dropped))
    }
}

/// Outcome of [`wait`], keyed by handle id.
#[derive(Debug, Default)]
pub struct RecordResults {
    pub successes: BTreeMap<u64, RecordResponse>,
    pub failures: BTreeMap<u64, RecordError>,
}

impl RecordResults {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Wait for all `handles`. Individual failures are collected, never returned
/// as an error; handles still pending after `timeout` fail with
/// [`RecordError::Timeout`].
pub async fn wait(handles: Vec<RecordHandle>, timeout: Option<Duration>) -> RecordResults {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut results = RecordResults::default();

    for handle in handles {
        let id = handle.id();
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, handle.wait())
                .await
                .unwrap_or(Err(RecordError::Timeout)),
            None => handle.wait().await,
        };
        match result {
            Ok(response) => {
                results.successes.insert(id, response);
            }
            Err(err) => {
                results.failures.insert(id, err);
            }
        }
    }

    results
}
