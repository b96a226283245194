//! Step validators backed by the local machine.
//!
//! - `command`: `sh -c <check>` in the working directory; exit status 0 passes
//! - `file_exists`: `${name}` placeholders are filled in, then the path is
//!   checked relative to the working directory
//! - `custom`: the check is a condition expression over the workflow variables
//!
//! Workflow variables reach commands only as `CHECKFLOW_VAR_<NAME>`
//! environment variables. They are never spliced into the command text.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use checkflow_core::condition::{ConditionEvaluator, interpolate_text};
use checkflow_core::validation::{StepValidator, ValidationContext};
use checkflow_types::config::CheckflowConfig;
use checkflow_types::state::ValidationResult;
use checkflow_types::template::{StepValidation, ValidationType};
use checkflow_types::value::Variables;

const ENV_PREFIX: &str = "CHECKFLOW_VAR_";
/// Longest stderr excerpt carried into a failure message.
const STDERR_EXCERPT: usize = 500;

/// The default `StepValidator`.
#[derive(Debug, Clone)]
pub struct DefaultStepValidator {
    timeout: Duration,
    evaluator: ConditionEvaluator,
}

impl DefaultStepValidator {
    pub fn new(timeout: Duration, evaluator: ConditionEvaluator) -> Self {
        Self { timeout, evaluator }
    }

    pub fn from_config(config: &CheckflowConfig) -> Self {
        Self::new(
            Duration::from_secs(config.command_timeout_secs),
            ConditionEvaluator::new(config.max_condition_depth),
        )
    }

    async fn run_command(&self, command: &str, context: &ValidationContext) -> ValidationResult {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&context.working_dir)
            .envs(command_env(&context.variables))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return ValidationResult::invalid(format!("failed to run command: {e}")),
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ValidationResult::invalid(format!("failed to wait for command: {e}"));
            }
            Err(_) => {
                tracing::warn!(
                    step_id = %context.step_id,
                    timeout_secs = self.timeout.as_secs(),
                    "validation command timed out"
                );
                return ValidationResult::invalid(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        if output.status.success() {
            return ValidationResult::valid();
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
        let status = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "a signal".to_string(),
        };
        if stderr.is_empty() {
            ValidationResult::invalid(format!("command failed with {status}"))
        } else {
            ValidationResult::invalid(format!("command failed with {status}: {stderr}"))
        }
    }

    async fn check_file(&self, pattern: &str, context: &ValidationContext) -> ValidationResult {
        let relative = interpolate_text(pattern, &context.variables);
        let path = context.working_dir.join(Path::new(&relative));
        match tokio::fs::try_exists(&path).await {
            Ok(true) => ValidationResult::valid(),
            Ok(false) => ValidationResult::invalid(format!("file not found: {relative}")),
            Err(e) => ValidationResult::invalid(format!("cannot check {relative}: {e}")),
        }
    }

    fn check_condition(&self, expression: &str, context: &ValidationContext) -> ValidationResult {
        match self.evaluator.try_evaluate(expression, &context.variables) {
            Ok(true) => ValidationResult::valid(),
            Ok(false) => ValidationResult::invalid(format!("condition not met: {expression}")),
            Err(e) => ValidationResult::invalid(e.to_string()),
        }
    }
}

impl Default for DefaultStepValidator {
    fn default() -> Self {
        Self::from_config(&CheckflowConfig::default())
    }
}

impl StepValidator for DefaultStepValidator {
    async fn run_validation(
        &self,
        validation: &StepValidation,
        context: &ValidationContext,
    ) -> ValidationResult {
        tracing::debug!(
            step_id = %context.step_id,
            kind = %validation.validation_type,
            "running validation"
        );
        match validation.validation_type {
            ValidationType::Command => self.run_command(&validation.check, context).await,
            ValidationType::FileExists => self.check_file(&validation.check, context).await,
            ValidationType::Custom => self.check_condition(&validation.check, context),
        }
    }
}

/// `CHECKFLOW_VAR_<NAME>` pairs for the top-level workflow variables.
///
/// Names are upper-cased with every non-alphanumeric character mapped to
/// `_`. Strings are passed verbatim, other values in literal form.
pub fn command_env(variables: &Variables) -> Vec<(String, String)> {
    variables
        .iter()
        .map(|(name, value)| {
            let key: String = name
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            (format!("{ENV_PREFIX}{key}"), value.to_string())
        })
        .collect()
}
