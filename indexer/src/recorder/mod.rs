//! Batched, deduplicating event recorder.

pub mod batch;
pub mod directory;
pub mod handle;
pub mod report;
pub mod strategy;

pub use batch::{EventRecorder, RecorderOptions};
pub use directory::{ActorDirectory, Partitioned};
pub use handle::{RecordError, RecordHandle, RecordOutcome, RecordResponse, RecordResults, wait};
pub use report::{CloseReport, FlushReport, FlushTrigger};
pub use strategy::{EventTypeStrategy, GenericEventTypeStrategy};
