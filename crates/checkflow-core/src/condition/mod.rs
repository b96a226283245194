//! Safe condition evaluation for step visibility.
//!
//! - `substitute` -- `${name}` placeholder substitution
//! - `evaluator` -- closed-grammar boolean evaluator

pub mod evaluator;
pub mod substitute;

pub use evaluator::ConditionEvaluator;
pub use substitute::{interpolate_text, substitute_variables};
