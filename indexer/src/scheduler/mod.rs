//! Scheduling: ingested-range tracking, the job queue and remote workers.

pub mod pointers;
pub mod service;
pub mod spawner;

pub use pointers::EventPointerManager;
pub use service::{DispatchFailure, JobFailure, QueueSummary, Scheduler, SchedulerRepositories};
pub use spawner::{GithubWorkerSpawner, WorkerSpawner};
