//! CLI views over the workflow state store.

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use dialoguer::Confirm;

use cadence_core::state::StateStore;
use cadence_types::config::RetentionPolicy;
use cadence_types::state::StateFilter;
use cadence_types::workflow::{WorkflowState, WorkflowStatus};

use super::styled_table;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum StateCommand {
    /// List persisted workflow runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only records whose id starts with this prefix.
        #[arg(long)]
        prefix: Option<String>,

        /// Only records saved within the last N days.
        #[arg(long)]
        since_days: Option<u32>,

        /// Maximum number of records.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one workflow run (the most recently saved when omitted).
    Show {
        /// Record id.
        record_id: Option<String>,
    },

    /// Delete or archive old records. Flags override `[retention]` in config.
    Cleanup {
        /// Remove records last saved more than N days ago.
        #[arg(long)]
        max_age_days: Option<u32>,

        /// Keep only the N most recent records.
        #[arg(long)]
        keep_last: Option<usize>,

        /// Move removed records under `archive/` instead of deleting them.
        #[arg(long)]
        archive: bool,

        /// Report what would be removed without touching anything.
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

pub async fn handle_state_command(cmd: StateCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        StateCommand::List {
            prefix,
            since_days,
            limit,
        } => {
            let filter = StateFilter {
                record_prefix: prefix,
                saved_after: since_days.map(|d| Utc::now() - Duration::days(i64::from(d))),
                limit,
            };
            handle_list(&filter, state, json).await
        }
        StateCommand::Show { record_id } => handle_show(record_id.as_deref(), state, json).await,
        StateCommand::Cleanup {
            max_age_days,
            keep_last,
            archive,
            dry_run,
            yes,
        } => {
            let policy = merge_policy(&state.config.retention, max_age_days, keep_last, archive);
            handle_cleanup(&policy, dry_run, yes, state, json).await
        }
    }
}

/// Command-line retention flags layered over the configured policy.
fn merge_policy(
    configured: &RetentionPolicy,
    max_age_days: Option<u32>,
    keep_last: Option<usize>,
    archive: bool,
) -> RetentionPolicy {
    RetentionPolicy {
        max_age_days: max_age_days.or(configured.max_age_days),
        keep_last: keep_last.or(configured.keep_last),
        archive: archive || configured.archive,
    }
}

fn status_cell(status: WorkflowStatus) -> String {
    let text = status.as_str();
    match status {
        WorkflowStatus::Completed => style(text).green().to_string(),
        WorkflowStatus::Failed => style(text).red().to_string(),
        WorkflowStatus::Paused => style(text).yellow().to_string(),
        WorkflowStatus::Running => style(text).cyan().to_string(),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(filter: &StateFilter, state: &AppState, json: bool) -> Result<()> {
    let records = state
        .store
        .list(filter)
        .await
        .context("failed to list workflow state")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!();
        println!("  No workflow state in {}", style(state.store.dir().display()).dim());
        println!();
        return Ok(());
    }

    let mut table = styled_table(&["Record", "Saved", "Schema", "Gzip", "Checksum"]);
    for meta in &records {
        table.add_row(vec![
            Cell::new(&meta.record_id),
            Cell::new(meta.saved_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&meta.schema_version),
            Cell::new(if meta.compression { "yes" } else { "no" }),
            Cell::new(meta.checksum.get(..12).unwrap_or(&meta.checksum)),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(record_id: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let (run, meta) = state.store.load(record_id).await.with_context(|| match record_id {
        Some(id) => format!("failed to load workflow state '{id}'"),
        None => "failed to load the most recent workflow state".to_string(),
    })?;

    if json {
        let out = serde_json::json!({ "metadata": meta, "state": run });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Workflow run").bold(),
        style(&run.workflow_id).cyan()
    );
    println!("  Status:     {}", status_cell(run.status));
    println!(
        "  Current:    {}",
        run.current_step.as_deref().unwrap_or("-")
    );
    println!("  Started:    {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Saved:      {}", meta.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Location:   {}", meta.storage_key);
    if let Some(source) = &meta.source_definition_path {
        println!("  Definition: {source}");
    }
    if let Some(error) = &run.error {
        println!("  Error:      {}", style(error).red());
    }
    println!();
    print_progress(&run);
    Ok(())
}

fn print_progress(run: &WorkflowState) {
    if !run.completed_steps.is_empty() {
        println!("  Completed: {}", run.completed_steps.join(" -> "));
    }
    if !run.skipped_steps.is_empty() {
        let skipped: Vec<&str> = run.skipped_steps.iter().map(String::as_str).collect();
        println!("  Skipped:   {}", skipped.join(", "));
    }
    if !run.artifacts.is_empty() {
        let mut table = styled_table(&["Artifact", "Path", "Status", "Created By"]);
        for (name, artifact) in &run.artifacts {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(&artifact.path),
                Cell::new(format!("{:?}", artifact.status).to_lowercase()),
                Cell::new(&artifact.created_by),
            ]);
        }
        println!("{table}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

async fn handle_cleanup(
    policy: &RetentionPolicy,
    dry_run: bool,
    yes: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    if policy.is_noop() {
        bail!("no retention rule given; pass --max-age-days or --keep-last, or set [retention] in config.toml");
    }

    let preview = state
        .store
        .cleanup(policy, true)
        .await
        .context("failed to evaluate retention policy")?;

    let report = if dry_run || preview.removed.is_empty() {
        preview
    } else {
        if !yes && !json {
            let verb = if policy.archive { "Archive" } else { "Permanently delete" };
            let confirmed = Confirm::new()
                .with_prompt(format!(
                    "{verb} {} record(s) ({} files)?",
                    style(preview.removed.len()).red().bold(),
                    preview.files
                ))
                .default(false)
                .interact()?;
            if !confirmed {
                println!("  Cancelled.");
                return Ok(());
            }
        }
        state
            .store
            .cleanup(policy, false)
            .await
            .context("failed to apply retention policy")?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    let action = match (report.dry_run, report.archived) {
        (true, _) => "Would remove",
        (false, true) => "Archived",
        (false, false) => "Removed",
    };
    println!(
        "  {} {} {} record(s), {} files",
        style("*").green().bold(),
        action,
        report.removed.len(),
        report.files
    );
    for id in &report.removed {
        println!("    {}", style(id).dim());
    }
    println!();
    Ok(())
}
