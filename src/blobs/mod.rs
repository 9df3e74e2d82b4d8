//! File blob store (§4.C): content-addressed attachments with an
//! independent 24h TTL, persisted as a JSON index plus separate payload
//! files so payload retrieval never has to deserialize the whole index.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::mailbox::snapshot;

const BLOB_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Code,
    Doc,
    Image,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl BlobMeta {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

pub struct Blob {
    pub meta: BlobMeta,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    blobs: Vec<BlobMeta>,
}

pub struct BlobStore {
    index_path: PathBuf,
    payload_dir: PathBuf,
    state: Mutex<HashMap<String, BlobMeta>>,
}

impl BlobStore {
    pub async fn new(data_dir: &std::path::Path) -> Result<Self> {
        let index_path = data_dir.join("blobs.json");
        let payload_dir = data_dir.join("blob_payloads");
        tokio::fs::create_dir_all(&payload_dir).await?;

        let index: Index = snapshot::read_or_default(&index_path).await?;
        let state = index.blobs.into_iter().map(|m| (m.id.clone(), m)).collect();

        Ok(Self {
            index_path,
            payload_dir,
            state: Mutex::new(state),
        })
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.payload_dir.join(id)
    }

    async fn persist(&self, state: &HashMap<String, BlobMeta>) -> Result<()> {
        let index = Index {
            blobs: state.values().cloned().collect(),
        };
        snapshot::write_atomic(&self.index_path, &index).await
    }

    pub async fn upload(
        &self,
        name: String,
        payload: Vec<u8>,
        blob_type: BlobType,
        mime: Option<String>,
    ) -> Result<BlobMeta> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let meta = BlobMeta {
            id: id.clone(),
            name,
            blob_type,
            size: payload.len(),
            created_at,
            expires_at: created_at + Duration::hours(BLOB_TTL_HOURS),
            mime,
        };

        tokio::fs::write(self.payload_path(&id), &payload).await?;

        let mut state = self.state.lock().await;
        state.insert(id, meta.clone());
        self.persist(&state).await?;
        Ok(meta)
    }

    pub async fn get(&self, id: &str) -> Result<Blob> {
        let meta = self.get_meta(id).await?;
        let payload = tokio::fs::read(self.payload_path(id)).await?;
        Ok(Blob { meta, payload })
    }

    pub async fn get_meta(&self, id: &str) -> Result<BlobMeta> {
        let state = self.state.lock().await;
        let meta = state.get(id).ok_or_else(|| anyhow!("blob '{id}' not found"))?;
        if meta.is_expired() {
            return Err(anyhow!("blob '{id}' has expired"));
        }
        Ok(meta.clone())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.remove(id).ok_or_else(|| anyhow!("blob '{id}' not found"))?;
        self.persist(&state).await?;
        drop(state);

        let _ = tokio::fs::remove_file(self.payload_path(id)).await;
        Ok(())
    }

    /// Hourly sweep per §4.C.
    pub async fn sweep(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .values()
            .filter(|m| m.is_expired())
            .map(|m| m.id.clone())
            .collect();

        for id in &expired {
            state.remove(id);
            let _ = tokio::fs::remove_file(self.payload_path(id)).await;
        }

        if !expired.is_empty() {
            self.persist(&state).await?;
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_get_roundtrips_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();
        let meta = store
            .upload("notes.txt".to_string(), b"hello".to_vec(), BlobType::Doc, None)
            .await
            .unwrap();

        let blob = store.get(&meta.id).await.unwrap();
        assert_eq!(blob.payload, b"hello");
        assert_eq!(blob.meta.size, 5);
    }

    #[tokio::test]
    async fn delete_removes_payload_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();
        let meta = store
            .upload("a.bin".to_string(), vec![1, 2, 3], BlobType::Data, None)
            .await
            .unwrap();

        store.delete(&meta.id).await.unwrap();
        assert!(store.get(&meta.id).await.is_err());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();
        let meta = store
            .upload("a.bin".to_string(), vec![1], BlobType::Data, None)
            .await
            .unwrap();

        // Not expired yet — sweep is a no-op.
        let removed = store.sweep().await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.get_meta(&meta.id).await.is_ok());
    }
}
