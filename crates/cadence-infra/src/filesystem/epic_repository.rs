//! File-backed `EpicRepository`.
//!
//! Each epic gets a directory `{root}/{epic_id}/` holding:
//! - `state.json`: the latest `EpicState`, replaced atomically
//! - `memory.jsonl`: one `ItemSummary` per line, append-only across runs
//! - `HANDOFF.md`: the human-readable progress document

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use cadence_core::epic::repository::EpicRepository;
use cadence_core::state::validate_record_id;
use cadence_types::epic::{EpicState, ItemSummary};
use cadence_types::error::RepositoryError;

use super::write_atomic;

const STATE_FILE: &str = "state.json";
const MEMORY_FILE: &str = "memory.jsonl";
const HANDOFF_FILE: &str = "HANDOFF.md";

pub struct FileEpicRepository {
    root: PathBuf,
}

impl FileEpicRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for `epic_id`. Rejects ids that are not safe path segments.
    pub fn epic_dir(&self, epic_id: &str) -> Result<PathBuf, RepositoryError> {
        validate_record_id(epic_id).map_err(|_| RepositoryError::InvalidId(epic_id.to_string()))?;
        Ok(self.root.join(epic_id))
    }

    pub fn handoff_path(&self, epic_id: &str) -> Result<PathBuf, RepositoryError> {
        Ok(self.epic_dir(epic_id)?.join(HANDOFF_FILE))
    }
}

/// Whether a non-empty file lacks a trailing newline.
async fn ends_mid_line(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

fn io_error(path: &Path, err: std::io::Error) -> RepositoryError {
    RepositoryError::Io(format!("{}: {err}", path.display()))
}

impl EpicRepository for FileEpicRepository {
    async fn load_state(&self, epic_id: &str) -> Result<Option<EpicState>, RepositoryError> {
        let path = self.epic_dir(epic_id)?.join(STATE_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        let state = serde_json::from_slice(&bytes)
            .map_err(|e| RepositoryError::Serialization(format!("{}: {e}", path.display())))?;
        Ok(Some(state))
    }

    async fn save_state(&self, state: &EpicState) -> Result<(), RepositoryError> {
        let path = self.epic_dir(&state.epic_id)?.join(STATE_FILE);
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| io_error(&path, e))?;
        tracing::debug!(epic_id = %state.epic_id, current_item = ?state.current_item, "saved epic state");
        Ok(())
    }

    async fn append_summary(&self, summary: &ItemSummary) -> Result<(), RepositoryError> {
        let dir = self.epic_dir(&summary.epic_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let mut line = serde_json::to_string(summary)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        line.push('\n');

        let path = dir.join(MEMORY_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        // A torn final line must not swallow the entry appended after it.
        if ends_mid_line(&mut file).await.map_err(|e| io_error(&path, e))? {
            tracing::warn!(epic_id = %summary.epic_id, "terminating torn memory entry before append");
            line.insert(0, '\n');
        }

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_error(&path, e))?;
        file.sync_all().await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    async fn read_summaries(&self, epic_id: &str) -> Result<Vec<ItemSummary>, RepositoryError> {
        let path = self.epic_dir(epic_id)?.join(MEMORY_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&path, err)),
        };

        let mut summaries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ItemSummary>(line) {
                Ok(summary) => summaries.push(summary),
                // A crash mid-append leaves a torn final line.
                Err(err) => {
                    tracing::warn!(epic_id = %epic_id, line = index + 1, error = %err, "skipping malformed memory entry");
                }
            }
        }
        Ok(summaries)
    }

    async fn write_handoff(&self, epic_id: &str, content: &str) -> Result<(), RepositoryError> {
        let path = self.handoff_path(epic_id)?;
        write_atomic(&path, content.as_bytes())
            .await
            .map_err(|e| io_error(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::epic::{ItemProgress, ItemStatus};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn summary(item_id: &str, status: ItemStatus) -> ItemSummary {
        ItemSummary {
            epic_id: "3".into(),
            item_id: item_id.into(),
            title: format!("Story {item_id}"),
            status,
            iterations: 2,
            scores: BTreeMap::from([("quality".to_string(), 7.5)]),
            workflow_ids: vec![format!("story-{item_id}-it1-0001")],
            error: None,
            recorded_at: Utc.with_ymd_and_hms(2026, 5, 3, 10, 0, 0).unwrap(),
        }
    }

    fn epic_state() -> EpicState {
        let at = Utc.with_ymd_and_hms(2026, 5, 3, 9, 0, 0).unwrap();
        EpicState {
            epic_id: "3".into(),
            title: "Accounts".into(),
            started_at: at,
            updated_at: at,
            execution_order: vec!["3.1".into(), "3.2".into()],
            current_item: Some("3.2".into()),
            items: BTreeMap::from([(
                "3.1".to_string(),
                ItemProgress {
                    status: ItemStatus::Done,
                    iterations: 1,
                    ..ItemProgress::default()
                },
            )]),
        }
    }

    #[tokio::test]
    async fn test_state_roundtrip_in_epic_directory() {
        let dir = tempdir().unwrap();
        let repo = FileEpicRepository::new(dir.path());
        assert!(repo.load_state("3").await.unwrap().is_none());

        let state = epic_state();
        repo.save_state(&state).await.unwrap();
        assert!(dir.path().join("3").join("state.json").exists());
        assert_eq!(repo.load_state("3").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_memory_log_appends_across_instances() {
        let dir = tempdir().unwrap();
        FileEpicRepository::new(dir.path())
            .append_summary(&summary("3.1", ItemStatus::Done))
            .await
            .unwrap();
        let repo = FileEpicRepository::new(dir.path());
        repo.append_summary(&summary("3.2", ItemStatus::Failed))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("3").join("memory.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);

        let summaries = repo.read_summaries("3").await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0], summary("3.1", ItemStatus::Done));
        assert_eq!(summaries[1].status, ItemStatus::Failed);
    }

    #[tokio::test]
    async fn test_torn_memory_line_is_skipped() {
        let dir = tempdir().unwrap();
        let repo = FileEpicRepository::new(dir.path());
        repo.append_summary(&summary("3.1", ItemStatus::Done))
            .await
            .unwrap();
        let path = dir.path().join("3").join("memory.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"epic_id\":\"3\",\"item_");
        std::fs::write(&path, raw).unwrap();

        let summaries = repo.read_summaries("3").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(repo.read_summaries("9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_after_torn_line_keeps_new_entry() {
        let dir = tempdir().unwrap();
        let repo = FileEpicRepository::new(dir.path());
        repo.append_summary(&summary("3.1", ItemStatus::Done))
            .await
            .unwrap();
        let path = dir.path().join("3").join("memory.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"epic_id\":\"3\",\"item_");
        std::fs::write(&path, raw).unwrap();

        repo.append_summary(&summary("3.2", ItemStatus::Failed))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
        assert_eq!(raw.lines().count(), 3);
        let summaries = repo.read_summaries("3").await.unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.item_id.as_str()).collect();
        assert_eq!(ids, vec!["3.1", "3.2"]);
    }

    #[tokio::test]
    async fn test_handoff_written_and_replaced() {
        let dir = tempdir().unwrap();
        let repo = FileEpicRepository::new(dir.path());
        repo.write_handoff("3", "# Epic 3\n").await.unwrap();
        repo.write_handoff("3", "# Epic 3: Accounts\n").await.unwrap();
        let path = repo.handoff_path("3").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# Epic 3: Accounts\n");
    }

    #[tokio::test]
    async fn test_unsafe_epic_id_rejected() {
        let dir = tempdir().unwrap();
        let repo = FileEpicRepository::new(dir.path());
        assert!(matches!(
            repo.load_state("../other").await.unwrap_err(),
            RepositoryError::InvalidId(_)
        ));
        assert!(matches!(
            repo.write_handoff("", "x").await.unwrap_err(),
            RepositoryError::InvalidId(_)
        ));
    }

    #[tokio::test]
    async fn test_malformed_state_is_a_serialization_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("3")).unwrap();
        std::fs::write(dir.path().join("3").join("state.json"), "{").unwrap();
        let repo = FileEpicRepository::new(dir.path());
        assert!(matches!(
            repo.load_state("3").await.unwrap_err(),
            RepositoryError::Serialization(_)
        ));
    }

    // -- full run over files ------------------------------------------------

    use crate::crypto::hash::Sha256ContentHasher;
    use crate::filesystem::state_store::FileStateStore;
    use cadence_core::epic::quality::ReviewOutputEvaluator;
    use cadence_core::epic::runner::EpicRunner;
    use cadence_core::epic::template::{CODE_ARTIFACT, REVIEW_STEP};
    use cadence_core::state::StateStore;
    use cadence_core::workflow::agent::{
        AgentError, AgentExecutor, AgentRegistry, AgentRequest, ProducedArtifact, StepOutcome,
    };
    use cadence_types::epic::{Epic, Item};
    use cadence_types::state::StateFilter;
    use cadence_types::workflow::WorkflowStatus;
    use serde_json::json;
    use std::sync::Arc;

    struct Stub {
        id: &'static str,
        outcome: StepOutcome,
    }

    impl AgentExecutor for Stub {
        fn id(&self) -> &str {
            self.id
        }

        async fn execute(&self, _request: &AgentRequest) -> Result<StepOutcome, AgentError> {
            Ok(self.outcome.clone())
        }
    }

    fn crew() -> AgentRegistry {
        let reviewer = StepOutcome::default()
            .with_output("approved", json!(true))
            .with_output("scores", json!({ "quality": 8.5 }));
        let producing = |id: &'static str, artifact: &str, path: &str| Stub {
            id,
            outcome: StepOutcome::default().with_artifact(artifact, ProducedArtifact::ready(path)),
        };
        AgentRegistry::new()
            .with(producing("story-enhancer", "story", "docs/story.md"))
            .with(producing("planner", "plan", "docs/plan.md"))
            .with(producing("tester", "test-report", "target/report.xml"))
            .with(Stub {
                id: "finisher",
                outcome: StepOutcome::default(),
            })
            .with(Stub {
                id: "developer",
                outcome: StepOutcome::default()
                    .with_artifact(CODE_ARTIFACT, ProducedArtifact::ready("src/export.rs")),
            })
            .with(Stub {
                id: "reviewer",
                outcome: reviewer,
            })
    }

    fn billing_epic() -> Epic {
        let item = |id: &str, title: &str, deps: &[&str]| Item {
            id: id.into(),
            title: title.into(),
            description: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            status: ItemStatus::NotStarted,
        };
        Epic {
            id: "3".into(),
            title: "Billing".into(),
            items: vec![
                item("3.2", "Payment retries", &["3.1"]),
                item("3.1", "Invoice export", &[]),
            ],
        }
    }

    #[tokio::test]
    async fn test_epic_run_persists_through_files() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(
            dir.path().join("state"),
            Arc::new(Sha256ContentHasher::new()),
        ));
        let repo = Arc::new(FileEpicRepository::new(dir.path().join("epics")));
        let runner = EpicRunner::new(
            store.clone(),
            repo.clone(),
            crew(),
            ReviewOutputEvaluator::new(REVIEW_STEP),
        );

        let report = runner.run(&billing_epic()).await.unwrap();
        assert_eq!(report.execution_order, vec!["3.1", "3.2"]);
        assert_eq!(report.count(ItemStatus::Done), 1);
        // "payment" marks 3.2 critical, and 8.5 is below the critical bar
        assert_eq!(report.count(ItemStatus::Failed), 1);

        let state = repo.load_state("3").await.unwrap().unwrap();
        assert_eq!(state.status_of("3.1"), ItemStatus::Done);
        assert_eq!(state.items["3.2"].iterations, 3);
        assert!(state.items["3.2"].error.is_some());

        let summaries = repo.read_summaries("3").await.unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.item_id.as_str()).collect();
        assert_eq!(ids, vec!["3.1", "3.2"]);

        let handoff = std::fs::read_to_string(repo.handoff_path("3").unwrap()).unwrap();
        assert!(handoff.starts_with("# Epic 3: Billing"));
        assert!(handoff.contains("## Problems"));

        // one workflow record per iteration, each loadable from disk
        let records = store.list(&StateFilter::default()).await.unwrap();
        assert_eq!(records.len(), 4);
        let first = store
            .list(&StateFilter {
                record_prefix: Some("story-3.1-".into()),
                ..StateFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        let (run, _) = store.load(Some(&first[0].record_id)).await.unwrap();
        assert_eq!(run.status, WorkflowStatus::Completed);
    }
}
