//! `whatsapp_sessions` row CRUD — the Session State Store's durable backing.
//!
//! One row per `instance_name`, holding the `creds` and `keys` JSON documents
//! (spec.md §6). Mirrors the shape of
//! `TaceoLabs-oprf-service`'s `PostgresSecretManager`: a thin struct wrapping
//! a `PgPool`, `sqlx::query_as` with bound parameters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::error::{Result, StoreError};

/// A loaded session row: the raw (still buffer-tagged) `creds` and `keys` documents.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub creds: Value,
    pub keys: Value,
}

/// Summary of a session row for `/auth/sessions` (spec.md §6): identity and
/// timestamps only, never the credential/key payload.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub instance_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable CRUD for session rows, independent of the debounce/codec logic
/// layered on top by [`super::session::SessionHandle`].
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Load the row for `instance_name`, if any.
    async fn load(&self, instance_name: &str) -> Result<Option<SessionRow>>;

    /// Upsert both `creds` and `keys` atomically (`save_creds`).
    async fn upsert(&self, instance_name: &str, creds: Value, keys: Value) -> Result<()>;

    /// Upsert only `keys`, leaving `creds` untouched if the row already
    /// exists (the debounced write path).
    async fn upsert_keys(&self, instance_name: &str, keys: Value) -> Result<()>;

    /// Delete the row. Must be a no-op (not an error) if it doesn't exist.
    async fn delete(&self, instance_name: &str) -> Result<()>;

    /// Whether a row exists for `instance_name` (`GET /auth/sessions/:name`).
    async fn exists(&self, instance_name: &str) -> Result<bool>;

    /// Every row's identity and timestamps, newest first (`GET /auth/sessions`).
    async fn list(&self) -> Result<Vec<SessionSummary>>;
}

/// Postgres-backed implementation of [`SessionRepository`].
pub struct PostgresSessionRepository {
    pool: PgPool,
}

impl PostgresSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn load(&self, instance_name: &str) -> Result<Option<SessionRow>> {
        let row: Option<(Value, Value)> = sqlx::query_as(
            r#"SELECT creds, keys FROM whatsapp_sessions WHERE id = $1"#,
        )
        .bind(instance_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(row.map(|(creds, keys)| SessionRow { creds, keys }))
    }

    async fn upsert(&self, instance_name: &str, creds: Value, keys: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO whatsapp_sessions (id, creds, keys, created_at, updated_at)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (id) DO UPDATE
                SET creds = EXCLUDED.creds,
                    keys = EXCLUDED.keys,
                    updated_at = now()
            "#,
        )
        .bind(instance_name)
        .bind(creds)
        .bind(keys)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn upsert_keys(&self, instance_name: &str, keys: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO whatsapp_sessions (id, creds, keys, created_at, updated_at)
            VALUES ($1, NULL, $2, now(), now())
            ON CONFLICT (id) DO UPDATE
                SET keys = EXCLUDED.keys,
                    updated_at = now()
            "#,
        )
        .bind(instance_name)
        .bind(keys)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM whatsapp_sessions WHERE id = $1"#)
            .bind(instance_name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(())
    }

    async fn exists(&self, instance_name: &str) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as(r#"SELECT 1 FROM whatsapp_sessions WHERE id = $1"#)
                .bind(instance_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Sqlx)?;
        Ok(row.is_some())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let rows: Vec<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"SELECT id, created_at, updated_at FROM whatsapp_sessions ORDER BY created_at DESC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;
        Ok(rows
            .into_iter()
            .map(|(instance_name, created_at, updated_at)| SessionSummary {
                instance_name,
                created_at,
                updated_at,
            })
            .collect())
    }
}

struct MemoryRow {
    data: SessionRow,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// In-memory implementation used by tests (mirrors the teacher's `MemoryStore`).
#[derive(Default)]
pub struct MemorySessionRepository {
    rows: std::sync::RwLock<std::collections::HashMap<String, MemoryRow>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn load(&self, instance_name: &str) -> Result<Option<SessionRow>> {
        Ok(self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .get(instance_name)
            .map(|row| row.data.clone()))
    }

    async fn upsert(&self, instance_name: &str, creds: Value, keys: Value) -> Result<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        let now = Utc::now();
        let created_at = rows
            .get(instance_name)
            .map(|row| row.created_at)
            .unwrap_or(now);
        rows.insert(
            instance_name.to_string(),
            MemoryRow {
                data: SessionRow { creds, keys },
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn upsert_keys(&self, instance_name: &str, keys: Value) -> Result<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        let now = Utc::now();
        if let Some(row) = rows.get_mut(instance_name) {
            row.data.keys = keys;
            row.updated_at = now;
        } else {
            rows.insert(
                instance_name.to_string(),
                MemoryRow {
                    data: SessionRow {
                        creds: Value::Null,
                        keys,
                    },
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        self.rows
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .remove(instance_name);
        Ok(())
    }

    async fn exists(&self, instance_name: &str) -> Result<bool> {
        Ok(self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .contains_key(instance_name))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = self
            .rows
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .iter()
            .map(|(instance_name, row)| SessionSummary {
                instance_name: instance_name.clone(),
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_repo_upsert_keys_preserves_creds() {
        let repo = MemorySessionRepository::new();
        repo.upsert("alice", serde_json::json!({"a": 1}), serde_json::json!({}))
            .await
            .unwrap();
        repo.upsert_keys("alice", serde_json::json!({"k": "v"}))
            .await
            .unwrap();
        let row = repo.load("alice").await.unwrap().unwrap();
        assert_eq!(row.creds, serde_json::json!({"a": 1}));
        assert_eq!(row.keys, serde_json::json!({"k": "v"}));
    }

    #[tokio::test]
    async fn memory_repo_delete_missing_is_ok() {
        let repo = MemorySessionRepository::new();
        assert!(repo.delete("nope").await.is_ok());
    }

    #[tokio::test]
    async fn exists_reflects_upsert_and_delete() {
        let repo = MemorySessionRepository::new();
        assert!(!repo.exists("alice").await.unwrap());
        repo.upsert("alice", serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();
        assert!(repo.exists("alice").await.unwrap());
        repo.delete("alice").await.unwrap();
        assert!(!repo.exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn list_returns_every_row_newest_first() {
        let repo = MemorySessionRepository::new();
        repo.upsert("alice", serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();
        repo.upsert("bob", serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();
        let listed = repo.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|s| s.instance_name == "alice"));
        assert!(listed.iter().any(|s| s.instance_name == "bob"));
    }
}
