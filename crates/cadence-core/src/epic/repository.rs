//! Epic persistence port and its in-memory adapter.
//!
//! An epic run keeps three things per epic id: the `EpicState` snapshot, an
//! append-only log of `ItemSummary` records shared across runs, and a
//! human-readable handoff document rewritten at the end of every run.

use std::future::Future;

use cadence_types::epic::{EpicState, ItemSummary};
use cadence_types::error::RepositoryError;
use dashmap::DashMap;

pub trait EpicRepository: Send + Sync {
    fn load_state(
        &self,
        epic_id: &str,
    ) -> impl Future<Output = Result<Option<EpicState>, RepositoryError>> + Send;

    fn save_state(
        &self,
        state: &EpicState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn append_summary(
        &self,
        summary: &ItemSummary,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Every summary recorded for `epic_id`, oldest first.
    fn read_summaries(
        &self,
        epic_id: &str,
    ) -> impl Future<Output = Result<Vec<ItemSummary>, RepositoryError>> + Send;

    fn write_handoff(
        &self,
        epic_id: &str,
        content: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

/// In-process repository for tests and embedders.
#[derive(Default)]
pub struct MemoryEpicRepository {
    states: DashMap<String, EpicState>,
    summaries: DashMap<String, Vec<ItemSummary>>,
    handoffs: DashMap<String, String>,
    saves: DashMap<String, usize>,
}

impl MemoryEpicRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handoff(&self, epic_id: &str) -> Option<String> {
        self.handoffs.get(epic_id).map(|h| h.clone())
    }

    pub fn save_count(&self, epic_id: &str) -> usize {
        self.saves.get(epic_id).map_or(0, |n| *n)
    }
}

impl EpicRepository for MemoryEpicRepository {
    async fn load_state(&self, epic_id: &str) -> Result<Option<EpicState>, RepositoryError> {
        Ok(self.states.get(epic_id).map(|s| s.clone()))
    }

    async fn save_state(&self, state: &EpicState) -> Result<(), RepositoryError> {
        self.states.insert(state.epic_id.clone(), state.clone());
        *self.saves.entry(state.epic_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn append_summary(&self, summary: &ItemSummary) -> Result<(), RepositoryError> {
        self.summaries
            .entry(summary.epic_id.clone())
            .or_default()
            .push(summary.clone());
        Ok(())
    }

    async fn read_summaries(&self, epic_id: &str) -> Result<Vec<ItemSummary>, RepositoryError> {
        Ok(self
            .summaries
            .get(epic_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn write_handoff(&self, epic_id: &str, content: &str) -> Result<(), RepositoryError> {
        self.handoffs.insert(epic_id.to_string(), content.to_string());
        Ok(())
    }
}
