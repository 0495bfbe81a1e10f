//! The fixed sub-workflow every epic item runs through.
//!
//! enhance -> plan -> implement -> review -> test -> complete
//!
//! `review` carries the quality gate. With the epic runner's
//! `QualityGateDecider` a failing review halts the sub-run; with the default
//! expression gate it loops back to `implement`.

use cadence_types::workflow::{Gate, ROUTE_NEXT, StepDefinition, WorkflowDefinition};

pub const STORY_WORKFLOW: &str = "story";
pub const STAGES: [&str; 6] = ["enhance", "plan", "implement", "review", "test", "complete"];

/// Step that carries the quality gate.
pub const REVIEW_STEP: &str = "review";
/// Artifact the review judges and the improver is scoped to.
pub const CODE_ARTIFACT: &str = "code";

/// Build the story template. Agent ids are the stage roles.
pub fn story_template() -> WorkflowDefinition {
    let steps = vec![
        stage("enhance", "story-enhancer", "enhance-story", &[], &["story"], "plan"),
        stage("plan", "planner", "plan-story", &["story"], &["plan"], "implement"),
        stage("implement", "developer", "implement-story", &["plan"], &[CODE_ARTIFACT], REVIEW_STEP),
        StepDefinition {
            gate: Some(Gate {
                condition: "outputs.approved == true".to_string(),
                on_pass: ROUTE_NEXT.to_string(),
                on_fail: "implement".to_string(),
            }),
            repeats: true,
            ..stage(REVIEW_STEP, "reviewer", "review-code", &[CODE_ARTIFACT], &["review"], "test")
        },
        stage("test", "tester", "run-tests", &[CODE_ARTIFACT], &["test-report"], "complete"),
        StepDefinition {
            next: None,
            ..stage("complete", "finisher", "complete-story", &["test-report"], &[], "")
        },
    ];

    WorkflowDefinition {
        name: STORY_WORKFLOW.to_string(),
        description: Some("Per-item story template used by epic runs".to_string()),
        version: Some("1.0.0".to_string()),
        steps,
    }
}

fn stage(
    id: &str,
    agent: &str,
    action: &str,
    requires: &[&str],
    creates: &[&str],
    next: &str,
) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        agent_ref: agent.to_string(),
        action: action.to_string(),
        requires: requires.iter().map(|s| s.to_string()).collect(),
        creates: creates.iter().map(|s| s.to_string()).collect(),
        next: Some(next.to_string()),
        gate: None,
        repeats: false,
        timeout_secs: None,
    }
}
