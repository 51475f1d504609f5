// PanelSync - Offline Chapter Reader for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Durable key-value store
//!
//! Every piece of durable state lives under its own deterministic key (see
//! [`keys`]); values are JSON documents. Writes are not transactional across
//! keys.

use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;

/// Deterministic storage keys
pub mod keys {
    /// Persisted queue snapshot
    pub const QUEUE_STATE: &str = "queue:state";

    /// Prefix shared by all image cache entries
    pub const CACHE_PREFIX: &str = "cache:";

    /// Image cache entry in a domain
    pub fn cache_entry(domain: &str, entry_key: &str) -> String {
        format!("{}{}:{}", CACHE_PREFIX, domain, entry_key)
    }

    /// Persisted chapter record (page list with statuses)
    pub fn chapter_record(content_id: &str, chapter_id: &str) -> String {
        format!("chapter:{}:{}", content_id, chapter_id)
    }

    /// Append-only list of downloaded chapters for one content item
    pub fn content_downloads(content_id: &str) -> String {
        format!("downloads:{}", content_id)
    }
}

/// Async key-value storage boundary
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value (deleting a missing key is not an error)
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// Read and deserialize a JSON value
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_string(value)?;
    store.put(key, &json).await
}

/// SQLite-backed key-value store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM KeyValueEntries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO KeyValueEntries (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM KeyValueEntries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value FROM KeyValueEntries WHERE substr(key, 1, ?) = ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
