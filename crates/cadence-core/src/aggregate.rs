//! Reconciliation of independently produced agent results.
//!
//! `ResultAggregator::aggregate` sorts its input by participant before doing
//! anything else, so the merged view and the conflict list are identical for
//! every permutation of the same results. Conflicts never abort aggregation;
//! callers inspect `has_conflicts()` / `has_critical_conflicts()`.

use std::collections::{BTreeMap, BTreeSet};

use cadence_types::aggregate::{
    AgentResult, AggregatedResult, Conflict, ConflictType, MergedEntry, ResultKind, Severity,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn aggregate(&self, results: &[AgentResult]) -> AggregatedResult {
        let mut sorted = results.to_vec();
        // Full-content tie-break keeps same-participant results stable too.
        sorted.sort_by_cached_key(|r| {
            (
                r.participant_id.clone(),
                r.kind.clone(),
                serde_json::to_string(r).unwrap_or_default(),
            )
        });

        let participants: Vec<String> = sorted
            .iter()
            .map(|r| r.participant_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut conflicts = file_conflicts(&sorted);
        conflicts.extend(overlap_conflicts(&sorted));

        let mut by_kind: BTreeMap<ResultKind, Vec<AgentResult>> = BTreeMap::new();
        for result in sorted {
            by_kind.entry(result.kind.clone()).or_default().push(result);
        }
        let merged = by_kind
            .into_iter()
            .map(|(kind, results)| {
                let entry = if kind.is_list_like() {
                    MergedEntry::Concatenated { results }
                } else {
                    best_of(results)
                };
                (kind, entry)
            })
            .collect();

        tracing::debug!(
            results = results.len(),
            participants = participants.len(),
            conflicts = conflicts.len(),
            "aggregated agent results"
        );
        AggregatedResult {
            merged,
            conflicts,
            participants,
        }
    }
}

/// One `file_modification` conflict per resource touched by more than one
/// participant.
fn file_conflicts(sorted: &[AgentResult]) -> Vec<Conflict> {
    let mut touched: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for result in sorted {
        for resource in &result.resources {
            touched
                .entry(resource.as_str())
                .or_default()
                .insert(result.participant_id.as_str());
        }
    }

    touched
        .into_iter()
        .filter(|(_, who)| who.len() > 1)
        .map(|(resource, who)| {
            let participant_ids: Vec<String> = who.into_iter().map(String::from).collect();
            Conflict {
                conflict_type: ConflictType::FileModification,
                description: format!(
                    "'{resource}' modified by {}",
                    participant_ids.join(", ")
                ),
                participant_ids,
                affected_resources: vec![resource.to_string()],
                severity: Severity::High,
            }
        })
        .collect()
}

/// One `overlapping_output` conflict per kind produced by more than one
/// participant.
fn overlap_conflicts(sorted: &[AgentResult]) -> Vec<Conflict> {
    let mut by_kind: BTreeMap<&ResultKind, (BTreeSet<&str>, BTreeSet<&str>)> = BTreeMap::new();
    for result in sorted {
        let (who, resources) = by_kind.entry(&result.kind).or_default();
        who.insert(result.participant_id.as_str());
        resources.extend(result.resources.iter().map(String::as_str));
    }

    by_kind
        .into_iter()
        .filter(|(_, (who, _))| who.len() > 1)
        .map(|(kind, (who, resources))| {
            let participant_ids: Vec<String> = who.into_iter().map(String::from).collect();
            Conflict {
                conflict_type: ConflictType::OverlappingOutput,
                description: format!(
                    "{} participants produced {kind}: {}",
                    participant_ids.len(),
                    participant_ids.join(", ")
                ),
                participant_ids,
                affected_resources: resources.into_iter().map(String::from).collect(),
                severity: Severity::Medium,
            }
        })
        .collect()
}

/// Keep the highest-scoring result; the earliest in sorted order wins ties
/// and unscored results rank last.
fn best_of(results: Vec<AgentResult>) -> MergedEntry {
    let mut best_index = 0;
    for (i, result) in results.iter().enumerate().skip(1) {
        let current = results[best_index].score.unwrap_or(f64::NEG_INFINITY);
        if result.score.unwrap_or(f64::NEG_INFINITY) > current {
            best_index = i;
        }
    }

    let mut discarded = Vec::with_capacity(results.len().saturating_sub(1));
    let mut best = None;
    for (i, result) in results.into_iter().enumerate() {
        if i == best_index {
            best = Some(result);
        } else {
            discarded.push(result.participant_id);
        }
    }

    match best {
        Some(result) => MergedEntry::Best { result, discarded },
        None => MergedEntry::Concatenated { results: Vec::new() },
    }
}
