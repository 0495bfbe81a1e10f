//! Filesystem adapters for Cadence.
//!
//! - `state_store`: `FileStateStore`, the durable `StateStore`
//! - `epic_repository`: `FileEpicRepository`, per-epic state, memory log and
//!   handoff document
//!
//! Shared here: data directory resolution, crash-safe file replacement and
//! gzip framing.

pub mod epic_repository;
pub mod state_store;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::io::AsyncWriteExt;

/// Leading bytes of every gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `CADENCE_DATA_DIR` environment variable
/// 2. `~/.cadence`
/// 3. `./.cadence`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CADENCE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".cadence");
    }

    PathBuf::from(".cadence")
}

/// Replace `path` with `bytes` so that readers see either the old or the new
/// content, never a partial write.
///
/// The content goes to a hidden sibling temp file, is synced, then renamed
/// over the target. If the rename fails the target is deleted and the rename
/// retried; between those two calls the target does not exist.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::now_v7().simple()));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        tracing::warn!(
            path = %path.display(),
            error = %err,
            "atomic rename failed, falling back to delete-then-rename"
        );
        if let Err(remove_err) = remove_if_exists(path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(remove_err);
        }
        if let Err(retry_err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(retry_err);
        }
    }
    Ok(())
}

/// Delete `path`, treating a missing file as success. Returns whether a file
/// was removed.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Decompress `bytes` if they carry the gzip magic, otherwise return them
/// unchanged.
pub fn maybe_gunzip(bytes: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if !is_gzip(&bytes) {
        return Ok(bytes);
    }
    let mut out = Vec::new();
    GzDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_atomic_creates_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");

        write_atomic(&path, b"first").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");

        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");

        // no temp files left behind
        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["record.json"]);
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.json");
        assert!(!remove_if_exists(&path).await.unwrap());
        tokio::fs::write(&path, "x").await.unwrap();
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_gzip_detection() {
        let packed = gzip(br#"{"workflow_id":"wf"}"#).unwrap();
        assert!(is_gzip(&packed));
        assert!(!is_gzip(b"{}"));
        assert_eq!(maybe_gunzip(packed).unwrap(), br#"{"workflow_id":"wf"}"#);
        assert_eq!(maybe_gunzip(b"plain".to_vec()).unwrap(), b"plain");
    }

    #[test]
    fn test_truncated_gzip_is_an_error() {
        let mut packed = gzip(b"some state document").unwrap();
        packed.truncate(6);
        assert!(maybe_gunzip(packed).is_err());
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("CADENCE_DATA_DIR", "/tmp/test-cadence");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-cadence"));
        unsafe {
            std::env::remove_var("CADENCE_DATA_DIR");
        }
    }
}
