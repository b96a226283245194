//! Shared domain types for Checkflow.
//!
//! This crate contains the core domain types used across the Checkflow
//! workspace: checklist templates, workflow state, the dynamic `Value`
//! union used for variables, engine events, WAL records, and the error
//! taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod template;
pub mod transaction;
pub mod value;
