//! CLI workflow definition subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Subcommand, ValueEnum};
use comfy_table::Cell;
use console::style;

use cadence_core::epic::template::story_template;
use cadence_core::workflow::definition::{WorkflowError, load_workflow_file, serialize_workflow_yaml};
use cadence_core::workflow::graph::StepGraph;
use cadence_types::epic::Epic;
use cadence_types::workflow::WorkflowDefinition;

use super::styled_table;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Parse and validate a workflow definition (YAML or JSON).
    Validate {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// Print the JSON Schema of a definition document.
    Schema {
        /// Which document to describe.
        #[arg(value_enum, default_value = "workflow")]
        kind: SchemaKind,
    },

    /// Print the built-in story workflow used for epic items.
    Template,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SchemaKind {
    Workflow,
    Epic,
}

pub async fn handle_workflow_command(cmd: WorkflowCommand, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Validate { file } => handle_validate(&file, json),
        WorkflowCommand::Schema { kind } => handle_schema(kind),
        WorkflowCommand::Template => handle_template(json),
    }
}

/// Load, validate and graph a definition file.
fn load_graph(file: &Path) -> Result<StepGraph> {
    let def = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow!("failed to parse {}: {msg}", file.display()),
        WorkflowError::IoError(err) => anyhow!("failed to read {}: {err}", file.display()),
        other => anyhow!("{} is not a valid workflow: {other}", file.display()),
    })?;
    StepGraph::new(def).map_err(|e| anyhow!("{} is not a valid workflow: {e}", file.display()))
}

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let graph = load_graph(file)?;
    let unreachable = graph.unreachable_steps();
    for step in &unreachable {
        tracing::warn!(step_id = %step, "step is unreachable from the first step");
    }
    let def = graph.definition();

    if json {
        let out = serde_json::json!({
            "name": def.name,
            "version": def.version,
            "steps": def.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            "unreachable": unreachable,
            "valid": true,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid ({} steps)",
        style("*").green().bold(),
        style(&def.name).cyan(),
        def.steps.len()
    );
    println!();
    print_steps(def);
    if !unreachable.is_empty() {
        println!(
            "  {} unreachable: {}",
            style("!").yellow().bold(),
            unreachable.join(", ")
        );
        println!();
    }
    Ok(())
}

fn print_steps(def: &WorkflowDefinition) {
    let mut table = styled_table(&["#", "Step", "Agent", "Action", "Next", "Gate"]);
    for (i, step) in def.steps.iter().enumerate() {
        let gate = step
            .gate
            .as_ref()
            .map(|g| format!("{} ? {} : {}", g.condition, g.on_pass, g.on_fail))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&step.id),
            Cell::new(&step.agent_ref),
            Cell::new(&step.action),
            Cell::new(step.next.as_deref().unwrap_or("-")),
            Cell::new(gate),
        ]);
    }
    println!("{table}");
    println!();
}

fn handle_schema(kind: SchemaKind) -> Result<()> {
    let schema = match kind {
        SchemaKind::Workflow => schemars::schema_for!(WorkflowDefinition),
        SchemaKind::Epic => schemars::schema_for!(Epic),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn handle_template(json: bool) -> Result<()> {
    let def = story_template();
    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
    } else {
        print!("{}", serialize_workflow_yaml(&def)?);
    }
    Ok(())
}
