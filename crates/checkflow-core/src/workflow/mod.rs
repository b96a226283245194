//! Workflow engine core: step navigation and transactional orchestration.
//!
//! - `navigator` -- step visibility and pure state-to-state moves
//! - `engine` -- `WorkflowEngine`, transactions, events and recovery

pub mod engine;
pub mod navigator;

pub use engine::{EngineOptions, WorkflowEngine};
pub use navigator::{NavigationOutcome, Navigator};
