//! CLI command definitions for the `ckf` binary.
//!
//! Uses clap derive macros for argument parsing. Every workflow command
//! names the template it operates on (e.g. `ckf next release`).

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use checkflow_types::value::Value;

/// Run checklists as durable, resumable workflows.
#[derive(Parser)]
#[command(name = "ckf", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data directory (defaults to ~/.checkflow).
    #[arg(long, global = true, env = "CHECKFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export trace spans through OpenTelemetry to stdout.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start (or resume) a checklist run.
    Start {
        /// Template id.
        template: String,

        /// Workflow variable, `key=value`. JSON values are parsed, anything
        /// else is a string. Ignored when a run already exists.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Show the run's status and steps.
    Status {
        /// Template id.
        template: String,
    },

    /// Complete the current step and move on.
    Next {
        /// Template id.
        template: String,

        /// Do not run the step's validations first.
        #[arg(long)]
        no_validate: bool,
    },

    /// Go back to the previous visible step.
    Back {
        /// Template id.
        template: String,
    },

    /// Skip the current step.
    Skip {
        /// Template id.
        template: String,

        /// Why the step is skipped.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Discard progress and start the run over.
    Reset {
        /// Template id.
        template: String,
    },

    /// Run a step's validations without advancing.
    Validate {
        /// Template id.
        template: String,

        /// Step to validate (defaults to the current step).
        #[arg(long)]
        step: Option<String>,
    },

    /// Pause an active run.
    Pause {
        /// Template id.
        template: String,
    },

    /// Resume a paused run.
    Resume {
        /// Template id.
        template: String,
    },

    /// Replay or discard interrupted transactions from the WAL.
    Recover,

    /// List available templates.
    #[command(alias = "ls")]
    List,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Output mode shared by every handler.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    /// Whether styled text should be printed.
    pub fn styled(&self) -> bool {
        !self.json && !self.quiet
    }
}

/// Parse `key=value` into a workflow variable.
pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing variable name in '{raw}'"));
    }
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(json) => Value::from(json),
        Err(_) => Value::from(value),
    };
    Ok((key.to_string(), value))
}
