//! Checklist template types.
//!
//! A `ChecklistTemplate` is the immutable, user-authored definition of a
//! checklist: an ordered list of steps, each optionally guarded by a
//! visibility condition and a list of validations. Templates are loaded
//! from YAML or JSON (camelCase keys) and never mutated afterwards.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Variables;

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// The canonical checklist definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistTemplate {
    /// Template identifier, also used to key persisted state.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered steps; a step's index is its position in this list.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Default variables, overridden by the ones passed to `init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Variables>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl ChecklistTemplate {
    /// Position of the step with the given id.
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Validate structural constraints.
    ///
    /// Checks:
    /// - Template id is non-empty
    /// - Every step id is non-empty
    /// - All step ids are unique
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("template id must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(format!("step at index {index} has an empty id"));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(format!("duplicate step ID: '{}'", step.id));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single unit of work in a checklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within the template.
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form instruction shown to the operator (e.g. a command to run).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Visibility condition; the step is hidden when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Vec<StepValidation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl Step {
    /// Convenience constructor for a bare step.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            action: None,
            condition: None,
            validation: None,
            metadata: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_validation(mut self, validation: StepValidation) -> Self {
        self.validation.get_or_insert_with(Vec::new).push(validation);
        self
    }
}

/// A check that must pass before a step is considered done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepValidation {
    #[serde(rename = "type")]
    pub validation_type: ValidationType,
    /// Payload interpreted per type: a shell command, a path, or a
    /// condition expression.
    pub check: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepValidation {
    pub fn new(validation_type: ValidationType, check: impl Into<String>) -> Self {
        Self {
            validation_type,
            check: check.into(),
            error_message: None,
        }
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// The recognized validation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    Command,
    FileExists,
    Custom,
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationType::Command => write!(f, "command"),
            ValidationType::FileExists => write!(f, "file_exists"),
            ValidationType::Custom => write!(f, "custom"),
        }
    }
}
