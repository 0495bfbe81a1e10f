//! Persistence envelope types for the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every persisted state document.
pub const SCHEMA_VERSION: &str = "2.0";

/// Envelope field carrying the schema version.
pub const FIELD_SCHEMA_VERSION: &str = "schema_version";

/// Envelope field carrying the content checksum.
pub const FIELD_CHECKSUM: &str = "checksum";

/// Envelope field carrying the save timestamp.
pub const FIELD_SAVED_AT: &str = "saved_at";

/// Metadata describing one persisted save. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub schema_version: String,
    pub saved_at: DateTime<Utc>,
    /// Hex-encoded SHA-256 over the stable projection of the record.
    pub checksum: String,
    pub record_id: String,
    /// Store-relative location of the file this metadata describes.
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_definition_path: Option<String>,
    #[serde(default)]
    pub compression: bool,
}

/// Filter for listing persisted records.
#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    /// Only records whose id starts with this prefix.
    pub record_prefix: Option<String>,
    /// Only records saved at or after this instant.
    pub saved_after: Option<DateTime<Utc>>,
    /// Maximum number of entries (newest first).
    pub limit: Option<usize>,
}

impl StateFilter {
    pub fn matches(&self, meta: &StateMetadata) -> bool {
        if let Some(prefix) = &self.record_prefix {
            if !meta.record_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.saved_after {
            if meta.saved_at < after {
                return false;
            }
        }
        true
    }
}

/// Outcome of applying a retention policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Record ids that were (or, in a dry run, would be) removed.
    pub removed: Vec<String>,
    /// Whether removed records were moved to the archive instead of deleted.
    pub archived: bool,
    /// Number of files touched, including history snapshots.
    pub files: usize,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(id: &str, day: u32) -> StateMetadata {
        StateMetadata {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at: Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
            checksum: "00".repeat(32),
            record_id: id.to_string(),
            storage_key: format!("{id}.json"),
            source_definition_path: None,
            compression: false,
        }
    }

    #[test]
    fn test_filter_by_prefix_and_date() {
        let filter = StateFilter {
            record_prefix: Some("story-".into()),
            saved_after: Some(Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap()),
            limit: None,
        };
        assert!(filter.matches(&meta("story-1", 12)));
        assert!(!filter.matches(&meta("story-1", 2)));
        assert!(!filter.matches(&meta("epic-1", 12)));
        assert!(StateFilter::default().matches(&meta("anything", 1)));
    }

    #[test]
    fn test_metadata_omits_missing_source() {
        let json = serde_json::to_value(meta("wf", 1)).unwrap();
        assert!(json.get("source_definition_path").is_none());
        assert_eq!(json["compression"], false);
    }
}
