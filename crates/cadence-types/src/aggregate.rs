//! Result aggregation types: independently produced agent results, the merged
//! view, and the conflicts detected between participants.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of output an agent produced. Determines the merge rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// List-like: concatenated across participants.
    CodeChanges,
    /// List-like: concatenated across participants.
    TestResults,
    /// List-like: concatenated across participants.
    Documentation,
    /// Singleton-scored: highest score wins.
    Review,
    /// Singleton-scored: highest score wins.
    Plan,
}

impl ResultKind {
    /// Whether results of this kind are concatenated rather than reduced.
    pub fn is_list_like(&self) -> bool {
        matches!(
            self,
            ResultKind::CodeChanges | ResultKind::TestResults | ResultKind::Documentation
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::CodeChanges => "code_changes",
            ResultKind::TestResults => "test_results",
            ResultKind::Documentation => "documentation",
            ResultKind::Review => "review",
            ResultKind::Plan => "plan",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant's result in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub participant_id: String,
    pub kind: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    /// Resources (e.g. file paths) this result modified.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Score for singleton-scored kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub payload: Value,
}

/// Merged output for one result kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "merge", rename_all = "snake_case")]
pub enum MergedEntry {
    Concatenated { results: Vec<AgentResult> },
    Best { result: AgentResult, discarded: Vec<String> },
}

/// Category of detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Several participants touched the same resource.
    FileModification,
    /// Several participants of the same kind ran in one batch.
    OverlappingOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected overlap between independently produced results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_type: ConflictType,
    pub participant_ids: Vec<String>,
    pub description: String,
    pub affected_resources: Vec<String>,
    pub severity: Severity,
}

/// Deterministic output of one aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub merged: BTreeMap<ResultKind, MergedEntry>,
    pub conflicts: Vec<Conflict>,
    /// Participants in processing order.
    pub participants: Vec<String>,
}

impl AggregatedResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Whether any conflict is severe enough to halt a pipeline (high or above).
    pub fn has_critical_conflicts(&self) -> bool {
        self.conflicts.iter().any(|c| c.severity >= Severity::High)
    }

    pub fn conflicts_of(&self, conflict_type: ConflictType) -> impl Iterator<Item = &Conflict> {
        self.conflicts
            .iter()
            .filter(move |c| c.conflict_type == conflict_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_merge_rules() {
        assert!(ResultKind::CodeChanges.is_list_like());
        assert!(ResultKind::TestResults.is_list_like());
        assert!(!ResultKind::Review.is_list_like());
        assert!(!ResultKind::Plan.is_list_like());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_critical_conflicts_threshold() {
        let conflict = |severity| Conflict {
            conflict_type: ConflictType::OverlappingOutput,
            participant_ids: vec!["a1".into(), "a2".into()],
            description: "dup".into(),
            affected_resources: vec![],
            severity,
        };
        let mut result = AggregatedResult {
            merged: BTreeMap::new(),
            conflicts: vec![conflict(Severity::Medium)],
            participants: vec![],
        };
        assert!(result.has_conflicts());
        assert!(!result.has_critical_conflicts());
        result.conflicts.push(conflict(Severity::High));
        assert!(result.has_critical_conflicts());
    }

    #[test]
    fn test_merged_map_key_serializes_as_string() {
        let mut merged = BTreeMap::new();
        merged.insert(
            ResultKind::Review,
            MergedEntry::Best {
                result: AgentResult {
                    participant_id: "r1".into(),
                    kind: ResultKind::Review,
                    artifact_ref: None,
                    resources: vec![],
                    score: Some(8.0),
                    payload: Value::Null,
                },
                discarded: vec![],
            },
        );
        let json = serde_json::to_value(&merged).unwrap();
        assert_eq!(json["review"]["merge"], "best");
    }
}
