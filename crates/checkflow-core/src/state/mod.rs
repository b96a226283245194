//! Workflow state persistence.
//!
//! - `repository` -- snapshot and template ports, in-memory implementations
//! - `store` -- `StateStore`, integrity checks and WAL recovery

pub mod repository;
pub mod store;

pub use repository::{MemoryStateRepository, MemoryTemplateSource, StateRepository, TemplateSource};
pub use store::{InitializedState, StateStore, check_integrity};
