//! CLI epic subcommands: dependency order, progress report and memory log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;

use cadence_core::epic::definition::load_epic_file;
use cadence_core::epic::report::{build_report, render_handoff};
use cadence_core::epic::repository::EpicRepository;
use cadence_core::epic::resolver::{ResolveError, resolve};
use cadence_types::epic::{CompletionReport, Epic, EpicState, ItemStatus};

use super::styled_table;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum EpicCommand {
    /// Print the dependency-resolved execution order of an epic document.
    Order {
        /// Path to the epic file (YAML or JSON).
        file: PathBuf,
    },

    /// Summarize recorded progress for an epic document.
    Report {
        /// Path to the epic file (YAML or JSON).
        file: PathBuf,

        /// Print the full handoff document instead of the summary.
        #[arg(long)]
        handoff: bool,
    },

    /// Show the per-item memory log recorded across runs.
    History {
        /// Epic id.
        epic_id: String,
    },
}

pub async fn handle_epic_command(cmd: EpicCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        EpicCommand::Order { file } => handle_order(&file, json),
        EpicCommand::Report { file, handoff } => handle_report(&file, handoff, state, json).await,
        EpicCommand::History { epic_id } => handle_history(&epic_id, state, json).await,
    }
}

fn load_epic(file: &Path) -> Result<Epic> {
    load_epic_file(file).map_err(|e| anyhow!("failed to load epic {}: {e}", file.display()))
}

fn status_text(status: ItemStatus) -> String {
    let text = status.as_str();
    match status {
        ItemStatus::Done => style(text).green().to_string(),
        ItemStatus::Failed => style(text).red().to_string(),
        ItemStatus::Blocked => style(text).yellow().to_string(),
        ItemStatus::InProgress => style(text).cyan().to_string(),
        ItemStatus::NotStarted => style(text).dim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

fn handle_order(file: &Path, json: bool) -> Result<()> {
    let epic = load_epic(file)?;
    let order = match resolve(&epic.items) {
        Ok(order) => order,
        Err(ResolveError::Cycle { remaining }) => {
            if json {
                let out = serde_json::json!({ "epic_id": epic.id, "cycle": remaining });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            bail!("dependency cycle among items: {}", remaining.join(", "));
        }
        Err(other) => return Err(other.into()),
    };

    if json {
        let out = serde_json::json!({ "epic_id": epic.id, "order": order });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Epic {}: {}",
        style("*").green().bold(),
        style(&epic.id).cyan(),
        epic.title
    );
    println!();
    let mut table = styled_table(&["#", "Item", "Title", "Depends On", "Status"]);
    for (position, id) in order.iter().enumerate() {
        let Some(item) = epic.items.iter().find(|i| &i.id == id) else {
            continue;
        };
        let deps = if item.dependencies.is_empty() {
            "-".to_string()
        } else {
            item.dependencies.join(", ")
        };
        table.add_row(vec![
            Cell::new(position + 1),
            Cell::new(&item.id),
            Cell::new(&item.title),
            Cell::new(deps),
            Cell::new(status_text(item.status)),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Report over the recorded run, ordered as that run ordered it; without a
/// recorded run the order is resolved from the document.
fn report_for(epic: &Epic, recorded: Option<&EpicState>) -> CompletionReport {
    let order = match recorded {
        Some(state) if !state.execution_order.is_empty() => state.execution_order.clone(),
        _ => resolve(&epic.items).unwrap_or_else(|e| {
            tracing::warn!(epic_id = %epic.id, error = %e, "cannot order epic items");
            Vec::new()
        }),
    };
    build_report(epic, recorded, &order)
}

async fn handle_report(file: &Path, handoff: bool, state: &AppState, json: bool) -> Result<()> {
    let epic = load_epic(file)?;
    let recorded = state
        .epics
        .load_state(&epic.id)
        .await
        .with_context(|| format!("failed to load state for epic '{}'", epic.id))?;
    let report = report_for(&epic, recorded.as_ref());

    if handoff {
        let Some(recorded) = &recorded else {
            bail!("epic '{}' has no recorded run", epic.id);
        };
        print!("{}", render_handoff(&epic, recorded, &report));
        return Ok(());
    }

    if json {
        let out = serde_json::json!({ "report": report, "state": recorded });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Epic {}: {}",
        style("*").green().bold(),
        style(&epic.id).cyan(),
        epic.title
    );
    println!(
        "  {} of {} items done ({:.1}%)",
        report.count(ItemStatus::Done),
        report.total,
        report.completion_percentage
    );
    if recorded.is_none() {
        println!("  {}", style("No run recorded yet.").dim());
    }
    println!();

    let mut table = styled_table(&["#", "Item", "Status", "Iterations", "Error"]);
    for (position, id) in report.execution_order.iter().enumerate() {
        let declared = epic
            .items
            .iter()
            .find(|i| &i.id == id)
            .map_or(ItemStatus::NotStarted, |i| i.status);
        let progress = recorded.as_ref().and_then(|s| s.items.get(id));
        table.add_row(vec![
            Cell::new(position + 1),
            Cell::new(id),
            Cell::new(status_text(progress.map_or(declared, |p| p.status))),
            Cell::new(progress.map_or(0, |p| p.iterations)),
            Cell::new(progress.and_then(|p| p.error.as_deref()).unwrap_or("-")),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

async fn handle_history(epic_id: &str, state: &AppState, json: bool) -> Result<()> {
    let summaries = state
        .epics
        .read_summaries(epic_id)
        .await
        .with_context(|| format!("failed to read memory log for epic '{epic_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!();
        println!("  No items recorded for epic '{epic_id}'.");
        println!();
        return Ok(());
    }

    let mut table = styled_table(&["Recorded", "Item", "Status", "Iterations", "Scores"]);
    for summary in &summaries {
        let scores = summary
            .scores
            .iter()
            .map(|(name, score)| format!("{name} {score:.1}"))
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(summary.recorded_at.format("%Y-%m-%d %H:%M")),
            Cell::new(&summary.item_id),
            Cell::new(status_text(summary.status)),
            Cell::new(summary.iterations),
            Cell::new(if scores.is_empty() { "-".to_string() } else { scores }),
        ]);
    }
    println!("{table}");
    Ok(())
}
