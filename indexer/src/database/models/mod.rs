//! Row models mapping database tables to Rust structs.

pub mod artifact;
pub mod event;
pub mod job;
pub mod pointer;

pub use artifact::*;
pub use event::*;
pub use job::*;
pub use pointer::*;
