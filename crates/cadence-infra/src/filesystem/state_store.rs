//! File-backed `StateStore`.
//!
//! Layout under the store directory:
//!
//! ```text
//! {id}.json | {id}.json.gz            current document
//! {id}.meta                           metadata sidecar (JSON `StateMetadata`)
//! last                                id of the most recently saved record
//! history/{id}@{micros}.json[.gz]     immutable copy of every save
//! archive/                            records moved out by retention
//! ```
//!
//! Every file is replaced through [`write_atomic`]. Loads go through the
//! shared integrity path in `cadence-core`; a primary copy that fails
//! verification is replaced, for that load, by the newest history snapshot
//! that passes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use cadence_core::service::clock::{Clock, SystemClock};
use cadence_core::service::hash::ContentHasher;
use cadence_core::state::integrity::{self, SealedDocument};
use cadence_core::state::migration::Migrator;
use cadence_core::state::{StateStore, validate_record_id};
use cadence_types::config::RetentionPolicy;
use cadence_types::error::StateError;
use cadence_types::state::{CleanupReport, SCHEMA_VERSION, StateFilter, StateMetadata};
use cadence_types::workflow::WorkflowState;

use super::{gzip, is_gzip, maybe_gunzip, remove_if_exists, write_atomic};

const LAST_POINTER: &str = "last";
const HISTORY_DIR: &str = "history";
const ARCHIVE_DIR: &str = "archive";
const SIDECAR_SUFFIX: &str = ".meta";
// Not a legal record id character, so splitting on it is unambiguous.
const SNAPSHOT_SEPARATOR: char = '@';

/// Durable `StateStore` over a single directory.
pub struct FileStateStore {
    dir: PathBuf,
    compress: bool,
    hasher: Arc<dyn ContentHasher>,
    clock: Arc<dyn Clock>,
    migrator: Migrator,
    last_snapshot_micros: Mutex<i64>,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>, hasher: Arc<dyn ContentHasher>) -> Self {
        Self {
            dir: dir.into(),
            compress: false,
            hasher,
            clock: Arc::new(SystemClock),
            migrator: Migrator::standard(),
            last_snapshot_micros: Mutex::new(0),
        }
    }

    /// Gzip documents written by this store. Loads detect the format per file
    /// regardless of this setting.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = migrator;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    fn primary_name(record_id: &str, compressed: bool) -> String {
        if compressed {
            format!("{record_id}.json.gz")
        } else {
            format!("{record_id}.json")
        }
    }

    fn sidecar_name(record_id: &str) -> String {
        format!("{record_id}{SIDECAR_SUFFIX}")
    }

    fn snapshot_name(record_id: &str, micros: i64, compressed: bool) -> String {
        let ext = if compressed { "json.gz" } else { "json" };
        format!("{record_id}{SNAPSHOT_SEPARATOR}{micros:020}.{ext}")
    }

    /// Split a history file name into record id and timestamp.
    fn parse_snapshot_name(name: &str) -> Option<(&str, i64)> {
        let (record_id, rest) = name.rsplit_once(SNAPSHOT_SEPARATOR)?;
        let digits = rest
            .strip_suffix(".json.gz")
            .or_else(|| rest.strip_suffix(".json"))?;
        Some((record_id, digits.parse().ok()?))
    }

    fn history_dir(&self) -> PathBuf {
        self.dir.join(HISTORY_DIR)
    }

    /// Strictly increasing history timestamp, even when the clock stalls or
    /// steps backwards.
    async fn next_snapshot_path(&self, record_id: &str, saved_at: DateTime<Utc>) -> PathBuf {
        let mut micros = {
            let mut last = self
                .last_snapshot_micros
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let next = saved_at.timestamp_micros().max(*last + 1);
            *last = next;
            next
        };
        loop {
            let path = self
                .history_dir()
                .join(Self::snapshot_name(record_id, micros, self.compress));
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                let mut last = self
                    .last_snapshot_micros
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                *last = (*last).max(micros);
                return path;
            }
            micros += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    async fn read_last_pointer(&self) -> Result<String, StateError> {
        let path = self.dir.join(LAST_POINTER);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => Ok(content.trim().to_string()),
            Ok(_) => Err(StateError::NotFound("no state has been saved".to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StateError::NotFound("no state has been saved".to_string()))
            }
            Err(err) => Err(io_error(&path, err)),
        }
    }

    /// Storage key of the current document for `record_id`: the sidecar's
    /// pointer when it is usable, otherwise whichever primary file exists.
    async fn locate(&self, record_id: &str) -> Result<String, StateError> {
        let sidecar = self.dir.join(Self::sidecar_name(record_id));
        match tokio::fs::read(&sidecar).await {
            Ok(bytes) => match serde_json::from_slice::<StateMetadata>(&bytes) {
                Ok(meta)
                    if meta.record_id == record_id
                        && (meta.storage_key == Self::primary_name(record_id, true)
                            || meta.storage_key == Self::primary_name(record_id, false)) =>
                {
                    return Ok(meta.storage_key);
                }
                _ => {
                    tracing::warn!(record_id = %record_id, "unusable metadata sidecar, probing for state file");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&sidecar, err)),
        }

        for compressed in [self.compress, !self.compress] {
            let name = Self::primary_name(record_id, compressed);
            if tokio::fs::try_exists(self.dir.join(&name))
                .await
                .unwrap_or(false)
            {
                return Ok(name);
            }
        }
        Err(StateError::NotFound(record_id.to_string()))
    }

    /// Read, decompress, verify, migrate and validate one file.
    async fn open_file(
        &self,
        record_id: &str,
        storage_key: String,
    ) -> Result<(WorkflowState, StateMetadata), StateError> {
        let path = self.dir.join(&storage_key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(storage_key));
            }
            Err(err) => return Err(io_error(&path, err)),
        };
        let compression = is_gzip(&bytes);
        let raw = maybe_gunzip(bytes)
            .map_err(|e| StateError::Corrupt(format!("{storage_key}: {e}")))?;

        let doc = integrity::parse_document(&raw)?;
        let opened = integrity::open_document(self.hasher.as_ref(), &self.migrator, doc)?;
        if opened.state.workflow_id != record_id {
            return Err(StateError::Validation(format!(
                "{storage_key} holds record '{}'",
                opened.state.workflow_id
            )));
        }

        let meta = StateMetadata {
            schema_version: self.migrator.target().to_string(),
            saved_at: opened.saved_at.unwrap_or(opened.state.started_at),
            checksum: opened.checksum,
            record_id: record_id.to_string(),
            storage_key,
            source_definition_path: opened.state.definition_source().map(String::from),
            compression,
        };
        Ok((opened.state, meta))
    }

    /// History snapshot names for `record_id`, newest first.
    async fn snapshots_of(&self, record_id: &str) -> Result<Vec<String>, StateError> {
        let dir = self.history_dir();
        let mut found: Vec<(i64, String)> = read_file_names(&dir)
            .await?
            .into_iter()
            .filter_map(|name| {
                let (id, micros) = Self::parse_snapshot_name(&name)?;
                (id == record_id).then_some((micros, name.clone()))
            })
            .collect();
        found.sort_by(|a, b| b.cmp(a));
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    async fn recover(
        &self,
        record_id: &str,
        primary_error: StateError,
    ) -> Result<(WorkflowState, StateMetadata), StateError> {
        let snapshots = self.snapshots_of(record_id).await?;
        if snapshots.is_empty() && matches!(primary_error, StateError::NotFound(_)) {
            return Err(StateError::NotFound(record_id.to_string()));
        }

        let mut attempts = 0;
        for name in snapshots {
            attempts += 1;
            match self.open_file(record_id, format!("{HISTORY_DIR}/{name}")).await {
                Ok((state, meta)) => {
                    tracing::warn!(
                        record_id = %record_id,
                        snapshot = %meta.storage_key,
                        attempts,
                        "recovered state from history"
                    );
                    return Ok((state, meta));
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(record_id = %record_id, snapshot = %name, error = %e, "skipping invalid snapshot");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StateError::NoRecoverableState {
            record_id: record_id.to_string(),
            attempts,
        })
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Store-relative paths of every file belonging to `record_id`.
    async fn files_of(&self, record_id: &str) -> Result<Vec<String>, StateError> {
        let mut files = Vec::new();
        for name in [
            Self::primary_name(record_id, false),
            Self::primary_name(record_id, true),
            Self::sidecar_name(record_id),
        ] {
            if tokio::fs::try_exists(self.dir.join(&name))
                .await
                .unwrap_or(false)
            {
                files.push(name);
            }
        }
        let mut snapshots = self.snapshots_of(record_id).await?;
        snapshots.reverse();
        files.extend(snapshots.into_iter().map(|n| format!("{HISTORY_DIR}/{n}")));
        Ok(files)
    }

    /// Apply age- and count-based retention. Records are ranked newest first;
    /// a record is removed when it falls beyond `keep_last` or was last saved
    /// more than `max_age_days` ago. Removed records are deleted, or moved
    /// under `archive/` when the policy says so. A dry run only reports.
    pub async fn cleanup(
        &self,
        policy: &RetentionPolicy,
        dry_run: bool,
    ) -> Result<CleanupReport, StateError> {
        let mut report = CleanupReport {
            archived: policy.archive,
            dry_run,
            ..CleanupReport::default()
        };
        if policy.is_noop() {
            return Ok(report);
        }

        let records = self.list(&StateFilter::default()).await?;
        let cutoff = policy
            .max_age_days
            .map(|days| self.clock.now() - Duration::days(i64::from(days)));

        for (rank, meta) in records.iter().enumerate() {
            let over_count = policy.keep_last.is_some_and(|keep| rank >= keep);
            let expired = cutoff.is_some_and(|cutoff| meta.saved_at < cutoff);
            if !over_count && !expired {
                continue;
            }

            let files = self.files_of(&meta.record_id).await?;
            report.files += files.len();
            report.removed.push(meta.record_id.clone());
            if dry_run {
                continue;
            }

            for relative in &files {
                let from = self.dir.join(relative);
                if policy.archive {
                    let to = self.dir.join(ARCHIVE_DIR).join(relative);
                    if let Some(parent) = to.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| io_error(parent, e))?;
                    }
                    tokio::fs::rename(&from, &to)
                        .await
                        .map_err(|e| io_error(&from, e))?;
                } else {
                    remove_if_exists(&from)
                        .await
                        .map_err(|e| io_error(&from, e))?;
                }
            }
            tracing::warn!(
                record_id = %meta.record_id,
                files = files.len(),
                archived = policy.archive,
                "removed state record by retention policy"
            );
        }

        if !dry_run {
            if let Ok(last) = self.read_last_pointer().await {
                if report.removed.contains(&last) {
                    let pointer = self.dir.join(LAST_POINTER);
                    remove_if_exists(&pointer)
                        .await
                        .map_err(|e| io_error(&pointer, e))?;
                }
            }
        }
        Ok(report)
    }
}

impl StateStore for FileStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<StateMetadata, StateError> {
        let record_id = state.workflow_id.as_str();
        validate_record_id(record_id)?;
        let SealedDocument {
            doc,
            checksum,
            saved_at,
        } = integrity::seal(self.hasher.as_ref(), state, self.clock.now())?;

        let mut bytes =
            serde_json::to_vec_pretty(&doc).map_err(|e| StateError::Serialization(e.to_string()))?;
        if self.compress {
            bytes = gzip(&bytes).map_err(|e| StateError::Io(e.to_string()))?;
        }

        let primary_name = Self::primary_name(record_id, self.compress);
        let primary = self.dir.join(&primary_name);
        write_atomic(&primary, &bytes)
            .await
            .map_err(|e| io_error(&primary, e))?;
        // A copy left by a store with the other compression setting is stale.
        let stale = self.dir.join(Self::primary_name(record_id, !self.compress));
        remove_if_exists(&stale)
            .await
            .map_err(|e| io_error(&stale, e))?;

        let snapshot = self.next_snapshot_path(record_id, saved_at).await;
        write_atomic(&snapshot, &bytes)
            .await
            .map_err(|e| io_error(&snapshot, e))?;

        let meta = StateMetadata {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at,
            checksum,
            record_id: record_id.to_string(),
            storage_key: primary_name,
            source_definition_path: state.definition_source().map(String::from),
            compression: self.compress,
        };
        let sidecar = self.dir.join(Self::sidecar_name(record_id));
        let sidecar_bytes =
            serde_json::to_vec_pretty(&meta).map_err(|e| StateError::Serialization(e.to_string()))?;
        write_atomic(&sidecar, &sidecar_bytes)
            .await
            .map_err(|e| io_error(&sidecar, e))?;

        let pointer = self.dir.join(LAST_POINTER);
        write_atomic(&pointer, record_id.as_bytes())
            .await
            .map_err(|e| io_error(&pointer, e))?;

        tracing::debug!(
            record_id = %record_id,
            checksum = %meta.checksum,
            compressed = self.compress,
            "saved workflow state"
        );
        Ok(meta)
    }

    async fn load(
        &self,
        record_id: Option<&str>,
    ) -> Result<(WorkflowState, StateMetadata), StateError> {
        let record_id = match record_id {
            Some(id) => id.to_string(),
            None => self.read_last_pointer().await?,
        };
        validate_record_id(&record_id)?;

        let primary_error = match self.locate(&record_id).await {
            Ok(key) => match self.open_file(&record_id, key).await {
                Ok(loaded) => return Ok(loaded),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(record_id = %record_id, error = %e, "current state invalid, recovering from history");
                    e
                }
                Err(e) => return Err(e),
            },
            Err(e @ StateError::NotFound(_)) => e,
            Err(e) => return Err(e),
        };
        self.recover(&record_id, primary_error).await
    }

    async fn list(&self, filter: &StateFilter) -> Result<Vec<StateMetadata>, StateError> {
        let mut metas = Vec::new();
        for name in read_file_names(&self.dir).await? {
            if !name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            let path = self.dir.join(&name);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable sidecar");
                    continue;
                }
            };
            match serde_json::from_slice::<StateMetadata>(&bytes) {
                Ok(meta) if filter.matches(&meta) => metas.push(meta),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping malformed sidecar");
                }
            }
        }

        metas.sort_by(|a, b| {
            b.saved_at
                .cmp(&a.saved_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        if let Some(limit) = filter.limit {
            metas.truncate(limit);
        }
        Ok(metas)
    }
}

/// Names of the regular files directly inside `dir`; empty when `dir` does
/// not exist.
async fn read_file_names(dir: &Path) -> Result<Vec<String>, StateError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir, err)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn io_error(path: &Path, err: std::io::Error) -> StateError {
    StateError::Io(format!("{}: {err}", path.display()))
}
