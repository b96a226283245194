//! Step validation dispatch.
//!
//! The `StepValidator` port runs one `StepValidation`; `validate_step` runs a
//! step's list in order and stops at the first failure. Concrete validators
//! (shell commands, file checks, custom conditions) live in checkflow-infra.

use std::path::PathBuf;

use checkflow_types::state::ValidationResult;
use checkflow_types::template::{Step, StepValidation};
use checkflow_types::value::Variables;

/// Inputs available to a validator.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub step_id: String,
    pub variables: Variables,
    /// Directory commands run in and relative paths resolve against.
    pub working_dir: PathBuf,
}

/// Runs a single validation.
///
/// Implementations never fail past this boundary: internal errors,
/// timeouts and I/O problems become an invalid `ValidationResult`.
pub trait StepValidator: Send + Sync {
    fn run_validation(
        &self,
        validation: &StepValidation,
        context: &ValidationContext,
    ) -> impl std::future::Future<Output = ValidationResult> + Send;
}

/// Run `step`'s validations in order, short-circuiting on the first failure.
///
/// A step without validations is valid. The failing validation's
/// `errorMessage`, when set, replaces the validator's own error text.
pub async fn validate_step<V: StepValidator>(
    validator: &V,
    step: &Step,
    context: &ValidationContext,
) -> ValidationResult {
    let Some(validations) = step.validation.as_deref() else {
        return ValidationResult::valid();
    };

    for (index, validation) in validations.iter().enumerate() {
        let result = validator.run_validation(validation, context).await;
        if !result.valid {
            let error = validation
                .error_message
                .clone()
                .or(result.error)
                .unwrap_or_else(|| format!("{} check failed", validation.validation_type));
            tracing::debug!(
                step_id = %step.id,
                index,
                kind = %validation.validation_type,
                error = %error,
                "step validation failed"
            );
            return ValidationResult::invalid(error);
        }
    }
    ValidationResult::valid()
}
