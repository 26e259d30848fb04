//! oso-indexer library crate.
//!
//! Scheduled, resumable ingestion of artifact events: collectors pull events
//! for a date range, the recorder batches and deduplicates them, and the
//! scheduler tracks which ranges are already ingested.

pub mod cache;
pub mod collector;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod recorder;
pub mod scheduler;
pub mod utils;

pub use error::{Error, Result};
