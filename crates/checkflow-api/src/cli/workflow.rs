//! CLI checklist commands.
//!
//! Every command opens the named template through `WorkflowEngine::init`
//! (which also runs WAL recovery), performs one operation and renders the
//! resulting run either as styled text or as JSON.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use checkflow_core::condition::ConditionEvaluator;
use checkflow_core::event::{EventBus, SubscriptionId};
use checkflow_core::state::{StateRepository, TemplateSource};
use checkflow_core::transaction::WalLog;
use checkflow_core::workflow::Navigator;
use checkflow_types::event::WorkflowEvent;
use checkflow_types::state::{StepResult, WorkflowState, WorkflowStatus};
use checkflow_types::template::ChecklistTemplate;
use checkflow_types::value::{Value, Variables};

use super::{Commands, Output};
use crate::state::AppState;

/// Handle a parsed command.
pub async fn handle_command(cmd: Commands, state: &AppState, out: Output) -> Result<()> {
    let events = EventLog::attach(state.engine.events(), out);
    let result = dispatch(cmd, state, out, &events).await;
    events.detach(state.engine.events());
    result
}

async fn dispatch(cmd: Commands, state: &AppState, out: Output, events: &EventLog) -> Result<()> {
    let engine = &state.engine;
    match cmd {
        Commands::Start { template, vars } => handle_start(state, &template, vars, out, events).await,
        Commands::Status { template } => {
            open(state, &template).await?;
            render(state, out, events, None).await
        }
        Commands::Next {
            template,
            no_validate,
        } => handle_next(state, &template, no_validate, out, events).await,
        Commands::Back { template } => {
            open(state, &template).await?;
            let result = engine.go_back().await?;
            if !result.success && out.styled() {
                println!("  {} Already at the first step", style("-").dim());
            }
            render(state, out, events, Some(step_result_json(&result))).await
        }
        Commands::Skip { template, reason } => {
            open(state, &template).await?;
            let result = engine.skip(reason).await?;
            render(state, out, events, Some(step_result_json(&result))).await
        }
        Commands::Reset { template } => {
            open(state, &template).await?;
            engine.reset().await?;
            render(state, out, events, None).await
        }
        Commands::Validate { template, step } => {
            handle_validate(state, &template, step.as_deref(), out, events).await
        }
        Commands::Pause { template } => {
            open(state, &template).await?;
            engine.pause().await?;
            render(state, out, events, None).await
        }
        Commands::Resume { template } => {
            open(state, &template).await?;
            engine.resume().await?;
            render(state, out, events, None).await
        }
        Commands::Recover => handle_recover(state, out).await,
        Commands::List => handle_list(state, out).await,
        // Handled in main before any state is created.
        Commands::Completions { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Collects engine events for JSON output and prints the notable ones live.
struct EventLog {
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
    subscription: SubscriptionId,
}

impl EventLog {
    fn attach(bus: &EventBus, out: Output) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = bus.subscribe_all(move |event| {
            if out.styled() {
                print_event(event);
            }
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        });
        Self {
            events,
            subscription,
        }
    }

    fn detach(&self, bus: &EventBus) {
        bus.unsubscribe(self.subscription);
    }

    fn snapshot(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::StepCompleted { step, .. } => {
            println!("  {} Completed {}", style("✓").green(), style(&step.title).bold());
        }
        WorkflowEvent::StepSkipped { step, reason } => match reason {
            Some(reason) => println!(
                "  {} Skipped {} ({})",
                style("↷").yellow(),
                style(&step.title).bold(),
                style(reason).dim()
            ),
            None => println!("  {} Skipped {}", style("↷").yellow(), style(&step.title).bold()),
        },
        WorkflowEvent::WorkflowCompleted { summary } => {
            println!(
                "  {} Checklist complete: {} done, {} skipped",
                style("*").green().bold(),
                summary.completed_steps,
                summary.skipped_steps
            );
        }
        WorkflowEvent::WorkflowReset { .. } => {
            println!("  {} Run reset", style("*").cyan().bold());
        }
        WorkflowEvent::ValidationFailed { step_id, error } => {
            println!(
                "  {} Validation failed for '{}': {}",
                style("✗").red(),
                step_id,
                error
            );
        }
        WorkflowEvent::RecoveryCompleted { recovered } if *recovered > 0 => {
            println!(
                "  {} Recovered {} interrupted transaction(s)",
                style("!").yellow().bold(),
                recovered
            );
        }
        WorkflowEvent::Error { code, message, .. } => {
            eprintln!("  {} [{}] {}", style("!").red().bold(), code, message);
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn open(state: &AppState, template: &str) -> Result<WorkflowState> {
    state
        .engine
        .init(template, Variables::new())
        .await
        .with_context(|| format!("Failed to open checklist '{template}'"))
}

async fn handle_start(
    state: &AppState,
    template: &str,
    vars: Vec<(String, Value)>,
    out: Output,
    events: &EventLog,
) -> Result<()> {
    let supplied = !vars.is_empty();
    let variables: Variables = vars.into_iter().collect();
    let run = state
        .engine
        .init(template, variables)
        .await
        .with_context(|| format!("Failed to start checklist '{template}'"))?;

    let resumed = run.status != WorkflowStatus::Idle || !run.completed_steps.is_empty();
    if resumed && supplied && out.styled() {
        println!(
            "  {} Resuming the existing run; --var values were not applied (use `ckf reset` first)",
            style("!").yellow().bold()
        );
    }
    render(state, out, events, None).await
}

async fn handle_next(
    state: &AppState,
    template: &str,
    no_validate: bool,
    out: Output,
    events: &EventLog,
) -> Result<()> {
    open(state, template).await?;
    let engine = &state.engine;

    if !no_validate {
        if let Some(step) = engine.current_step().await? {
            let validation = engine.validate_step(None).await?;
            if !validation.valid {
                if out.json {
                    let body = serde_json::json!({
                        "result": { "success": false, "step": step, "validation": validation },
                        "events": events.snapshot(),
                    });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                validation.into_result(&step.id)?;
            }
        }
    }

    let result = engine.advance().await?;
    render(state, out, events, Some(step_result_json(&result))).await
}

async fn handle_validate(
    state: &AppState,
    template: &str,
    step: Option<&str>,
    out: Output,
    events: &EventLog,
) -> Result<()> {
    open(state, template).await?;
    let step_id = match step {
        Some(id) => id.to_string(),
        None => state
            .engine
            .current_step()
            .await?
            .map(|s| s.id)
            .unwrap_or_default(),
    };
    let result = state.engine.validate_step(step).await?;

    if out.json {
        let body = serde_json::json!({ "validation": result, "events": events.snapshot() });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else if out.styled() && result.valid {
        println!("  {} Validation passed", style("✓").green());
    }

    result.into_result(&step_id)?;
    Ok(())
}

async fn handle_recover(state: &AppState, out: Output) -> Result<()> {
    let store = state.engine.store();
    let pending = store.coordinator().wal().read_all().await?.len();
    let recovered = store
        .recover_from_incomplete_transactions()
        .await
        .context("WAL recovery failed")?;

    if out.json {
        let body = serde_json::json!({
            "wal": state.layout.wal_path(),
            "entries": pending,
            "recovered": recovered,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else if out.styled() {
        println!();
        if pending == 0 {
            println!("  {} WAL is clean", style("✓").green());
        } else {
            println!(
                "  {} Processed {} WAL entries, replayed {} transaction(s)",
                style("*").green().bold(),
                pending,
                recovered
            );
        }
        println!("  WAL: {}", state.layout.wal_path().display());
        println!();
    }
    Ok(())
}

async fn handle_list(state: &AppState, out: Output) -> Result<()> {
    let ids = state
        .templates
        .list_templates()
        .await
        .with_context(|| format!("Failed to read {}", state.templates.dir().display()))?;
    let repository = state.engine.store().repository();

    let mut rows = Vec::with_capacity(ids.len());
    for id in &ids {
        let template = state.templates.load_template(id).await;
        let run = repository.load(id).await.ok().flatten();
        rows.push((id, template, run));
    }

    if out.json {
        let items: Vec<_> = rows
            .iter()
            .map(|(id, template, run)| match template {
                Ok(t) => serde_json::json!({
                    "id": id,
                    "name": t.name,
                    "steps": t.steps.len(),
                    "status": run.as_ref().map(|r| r.status),
                }),
                Err(e) => serde_json::json!({ "id": id, "error": e.to_string() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    if rows.is_empty() {
        println!();
        println!(
            "  No templates found in {}",
            style(state.templates.dir().display()).cyan()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Template").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Steps"),
            Cell::new("Run"),
        ]);
    for (id, template, run) in &rows {
        let status = run
            .as_ref()
            .map(|r| format_status(r.status))
            .unwrap_or_else(|| Cell::new("-"));
        match template {
            Ok(t) => table.add_row(vec![
                Cell::new(id),
                Cell::new(&t.name),
                Cell::new(t.steps.len()),
                status,
            ]),
            Err(e) => table.add_row(vec![
                Cell::new(id),
                Cell::new(e.to_string()).fg(Color::Red),
                Cell::new("-"),
                status,
            ]),
        };
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn step_result_json(result: &StepResult) -> serde_json::Value {
    serde_json::to_value(result).unwrap_or(serde_json::Value::Null)
}

async fn render(
    state: &AppState,
    out: Output,
    events: &EventLog,
    result: Option<serde_json::Value>,
) -> Result<()> {
    let engine = &state.engine;
    let template = engine.template().await?;
    let run = engine.state().await?;
    let progress = engine.progress().await?;

    if out.json {
        let mut body = serde_json::json!({
            "template": template.id,
            "state": run,
            "progress": progress,
            "events": events.snapshot(),
        });
        if let Some(result) = result {
            body["result"] = result;
        }
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("*").cyan().bold(),
        style(&template.name).bold(),
        template.id
    );
    println!(
        "  Status: {}   Progress: {}/{} ({:.0}%)",
        format_status_text(run.status),
        progress.completed + progress.skipped,
        progress.total,
        progress.percent
    );
    if let Some(step) = template.steps.get(run.current_step_index) {
        if !run.status.is_finished() {
            println!("  Current: {}", style(&step.title).cyan().bold());
            if let Some(action) = &step.action {
                println!("  Action:  {action}");
            }
        }
    }
    println!();
    println!("{}", step_table(state, &template, &run));
    println!();
    Ok(())
}

fn step_table(state: &AppState, template: &ChecklistTemplate, run: &WorkflowState) -> Table {
    let navigator = Navigator::new(ConditionEvaluator::new(state.config.max_condition_depth));

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Status"),
            Cell::new("Note"),
        ]);

    for (index, step) in template.steps.iter().enumerate() {
        let completed = run.completed_steps.iter().find(|c| c.step.id == step.id);
        let skipped = run.skipped_steps.iter().find(|s| s.step.id == step.id);

        let (status, note) = if let Some(done) = completed {
            let note = done
                .duration_ms
                .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                .unwrap_or_default();
            (Cell::new("done").fg(Color::Green), note)
        } else if let Some(skip) = skipped {
            (
                Cell::new("skipped").fg(Color::Yellow),
                skip.reason.clone().unwrap_or_default(),
            )
        } else if index == run.current_step_index && !run.status.is_finished() {
            (Cell::new("current").fg(Color::Cyan), String::new())
        } else if !navigator.is_step_visible(template, run, index) {
            (Cell::new("hidden").fg(Color::DarkGrey), String::new())
        } else {
            (Cell::new("pending"), String::new())
        };

        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(&step.title),
            status,
            Cell::new(note),
        ]);
    }
    table
}

fn format_status(status: WorkflowStatus) -> Cell {
    let color = match status {
        WorkflowStatus::Idle => Color::White,
        WorkflowStatus::Active => Color::Cyan,
        WorkflowStatus::Paused => Color::Yellow,
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Failed => Color::Red,
    };
    Cell::new(status.to_string()).fg(color)
}

fn format_status_text(status: WorkflowStatus) -> String {
    let text = status.to_string();
    match status {
        WorkflowStatus::Idle => style(text).dim().to_string(),
        WorkflowStatus::Active => style(text).cyan().to_string(),
        WorkflowStatus::Paused => style(text).yellow().to_string(),
        WorkflowStatus::Completed => style(text).green().to_string(),
        WorkflowStatus::Failed => style(text).red().to_string(),
    }
}
