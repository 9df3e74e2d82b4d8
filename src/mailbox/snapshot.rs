//! Atomic JSON snapshot persistence, following
//! `tasks/queue_serializer.rs::flush_queue`'s temp-file-then-rename pattern.
//!
//! Used for every JSON-backed store the daemon keeps: the mailbox itself,
//! webhook subscribers, the conversation session registry, and the file
//! blob index.

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Write `value` to `path` atomically: serialize to a `.tmp` sibling,
/// then rename over the real path so a crash mid-write never leaves a
/// truncated file behind.
pub async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Load a snapshot, returning `default` if the file does not yet exist.
pub async fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn roundtrip_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let mut data = BTreeMap::new();
        data.insert("claude/web".to_string(), vec!["a".to_string(), "b".to_string()]);

        write_atomic(&path, &data).await.unwrap();
        let loaded: BTreeMap<String, Vec<String>> = read_or_default(&path).await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let loaded: BTreeMap<String, Vec<String>> = read_or_default(&path).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn no_tmp_file_survives_a_successful_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        write_atomic(&path, &42i32).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }
}
