//! Completion report and handoff document for an epic run.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use cadence_types::epic::{CompletionReport, Epic, EpicState, ItemProgress, ItemStatus};

/// Count item statuses over the epic. Items without progress in `state`
/// report the status their document declares.
pub fn build_report(epic: &Epic, state: Option<&EpicState>, execution_order: &[String]) -> CompletionReport {
    let mut counts = BTreeMap::new();
    for item in &epic.items {
        let status = state
            .and_then(|s| s.items.get(&item.id))
            .map_or(item.status, |p| p.status);
        *counts.entry(status).or_insert(0usize) += 1;
    }

    let total = epic.items.len();
    let done = counts.get(&ItemStatus::Done).copied().unwrap_or(0);
    let completion_percentage = if total == 0 {
        0.0
    } else {
        done as f64 / total as f64 * 100.0
    };

    CompletionReport {
        epic_id: epic.id.clone(),
        total,
        counts,
        completion_percentage,
        execution_order: execution_order.to_vec(),
    }
}

/// Render `HANDOFF.md`: overall progress, then one row per item in execution
/// order.
pub fn render_handoff(epic: &Epic, state: &EpicState, report: &CompletionReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Epic {}: {}", epic.id, epic.title);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Updated {}. {} of {} items done ({:.1}%).",
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.count(ItemStatus::Done),
        report.total,
        report.completion_percentage
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Status");
    let _ = writeln!(out);
    for (status, count) in &report.counts {
        let _ = writeln!(out, "- {status}: {count}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Items");
    let _ = writeln!(out);
    let _ = writeln!(out, "| # | Item | Title | Status | Iterations | Scores |");
    let _ = writeln!(out, "|---|------|-------|--------|------------|--------|");
    for (position, item_id) in report.execution_order.iter().enumerate() {
        let Some(item) = epic.items.iter().find(|i| &i.id == item_id) else {
            continue;
        };
        let progress = state.items.get(item_id).cloned().unwrap_or_else(|| ItemProgress {
            status: item.status,
            ..ItemProgress::default()
        });
        let scores = progress
            .last_scores
            .iter()
            .map(|(name, score)| format!("{name} {score:.1}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} |",
            position + 1,
            item.id,
            item.title.replace('|', "\\|"),
            progress.status,
            progress.iterations,
            if scores.is_empty() { "-" } else { scores.as_str() },
        );
    }

    let failures: Vec<_> = report
        .execution_order
        .iter()
        .filter_map(|id| Some((id, state.items.get(id)?.error.as_deref()?)))
        .collect();
    if !failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Problems");
        let _ = writeln!(out);
        for (id, error) in failures {
            let _ = writeln!(out, "- {id}: {error}");
        }
    }

    out
}
