//! API key management (§6 "Auth").
//!
//! Keys look like `quack_<24 base64url chars>`. Only the SHA-256 hash is
//! ever persisted; the plaintext key is returned once, at creation time,
//! the same way `ipc/auth.rs`'s token is generated once and never
//! re-read in plaintext.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::storage::with_timeout;

const KEY_PREFIX: &str = "quack_";
const KEY_RANDOM_BYTES: usize = 18;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub owner: String,
    pub permissions: Vec<String>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: String,
    key_hash: String,
    owner: String,
    permissions: String,
    revoked: i64,
    created_at: String,
    last_used_at: Option<String>,
}

impl TryFrom<ApiKeyRow> for ApiKey {
    type Error = anyhow::Error;

    fn try_from(r: ApiKeyRow) -> Result<Self> {
        Ok(ApiKey {
            id: r.id,
            owner: r.owner,
            permissions: serde_json::from_str(&r.permissions)?,
            revoked: r.revoked != 0,
            created_at: DateTime::parse_from_rfc3339(&r.created_at)?.with_timezone(&Utc),
            last_used_at: r
                .last_used_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()?,
        })
    }
}

pub struct CreatedKey {
    pub key: ApiKey,
    /// Plaintext key, only ever returned here.
    pub plaintext: String,
}

fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_plaintext() -> String {
    let mut bytes = [0u8; KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// API key store, SQLite-backed (§6 persisted layout).
#[derive(Clone)]
pub struct KeyStore {
    pool: SqlitePool,
}

impl KeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, owner: &str, permissions: Vec<String>) -> Result<CreatedKey> {
        with_timeout(async {
            let id = Uuid::new_v4().to_string();
            let plaintext = generate_plaintext();
            let key_hash = hash_key(&plaintext);
            let created_at = Utc::now();
            let permissions_json = serde_json::to_string(&permissions)?;

            sqlx::query(
                "INSERT INTO api_keys (id, key_hash, owner, permissions, revoked, created_at, last_used_at)
                 VALUES (?, ?, ?, ?, 0, ?, NULL)",
            )
            .bind(&id)
            .bind(&key_hash)
            .bind(owner)
            .bind(&permissions_json)
            .bind(created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

            Ok(CreatedKey {
                key: ApiKey {
                    id,
                    owner: owner.to_string(),
                    permissions,
                    revoked: false,
                    created_at,
                    last_used_at: None,
                },
                plaintext,
            })
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<ApiKey>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(TryFrom::try_from).collect()
        })
        .await
    }

    pub async fn revoke(&self, id: &str) -> Result<bool> {
        with_timeout(async {
            let result = sqlx::query("UPDATE api_keys SET revoked = 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Validate a presented plaintext key, bumping `last_used_at` on
    /// success. Returns `Err` for unknown or revoked keys.
    pub async fn authenticate(&self, plaintext: &str) -> Result<ApiKey> {
        with_timeout(async {
            let key_hash = hash_key(plaintext);
            let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE key_hash = ?")
                .bind(&key_hash)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| anyhow!("invalid API key"))?;

            if row.revoked != 0 {
                return Err(anyhow!("API key has been revoked"));
            }

            sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(&row.id)
                .execute(&self.pool)
                .await?;

            row.try_into()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> KeyStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        for stmt in include_str!("../storage/migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&pool).await.unwrap();
            }
        }
        KeyStore::new(pool)
    }

    #[tokio::test]
    async fn create_key_has_expected_prefix() {
        let store = store().await;
        let created = store.create("ops", vec!["admin".to_string()]).await.unwrap();
        assert!(created.plaintext.starts_with("quack_"));
    }

    #[tokio::test]
    async fn authenticate_accepts_valid_key() {
        let store = store().await;
        let created = store.create("ops", vec![]).await.unwrap();
        let key = store.authenticate(&created.plaintext).await.unwrap();
        assert_eq!(key.id, created.key.id);
        assert!(key.last_used_at.is_some());
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_key() {
        let store = store().await;
        assert!(store.authenticate("quack_nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn revoked_key_fails_authentication() {
        let store = store().await;
        let created = store.create("ops", vec![]).await.unwrap();
        store.revoke(&created.key.id).await.unwrap();
        assert!(store.authenticate(&created.plaintext).await.is_err());
    }
}
