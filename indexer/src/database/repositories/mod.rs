//! Repository layer for database access.
//!
//! Each repository is an async trait with a SQLx/SQLite implementation, so the
//! recorder and scheduler only depend on the contract.

pub mod artifact;
pub mod event;
pub mod job;
pub mod pointer;

pub use artifact::*;
pub use event::*;
pub use job::*;
pub use pointer::*;
