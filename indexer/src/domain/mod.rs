//! Core domain types shared by the recorder, collectors and scheduler.

pub mod artifact;
pub mod event;
pub mod job;

pub use artifact::{Artifact, ArtifactKey, ArtifactNamespace, ArtifactScope, ArtifactType};
pub use event::{Event, EventType, IncompleteEvent};
pub use job::{Job, JobExecution, JobStatus};
