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


//! SQLite connection pool
//!
//! Everything the download subsystem persists lives in one SQLite file next to
//! the page cache. The host passes its sandbox directory; desktop builds fall
//! back to `CoreConfig::default_data_dir`.
//!
//! # Pragmas
//! - WAL journal, `synchronous = NORMAL`
//! - incremental auto-vacuum, so evicted chapter records give space back

use crate::error::{PanelSyncError, Result};
use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
    ConnectOptions,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Connections for a file database (queue, cache and validator write concurrently)
const FILE_POOL_SIZE: u32 = 5;

/// How long a writer waits on a locked database before failing
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled SQLite handle
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    /// `None` when in memory
    path: Option<PathBuf>,
}

impl Database {
    /// Open (creating if needed) the database at `database_path` and migrate it
    ///
    /// # Errors
    /// Fails with a storage error when the parent directory cannot be created,
    /// the file cannot be opened or a migration fails.
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path = database_path.as_ref();
        ensure_parent_dir(path).await?;

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .busy_timeout(LOCK_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .acquire_timeout(LOCK_TIMEOUT)
            .connect_with(tune(options))
            .await?;

        Self::ready(pool, Some(path.to_path_buf())).await
    }

    /// In-memory database for tests and throwaway sessions
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // A single connection that never idles out, otherwise the data goes with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(tune(options))
            .await?;

        Self::ready(pool, None).await
    }

    async fn ready(pool: SqlitePool, path: Option<PathBuf>) -> Result<Self> {
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
            .execute(&pool)
            .await?;

        let db = Self { pool, path };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        crate::storage::migrations::run_migrations(&self.pool)
            .await
            .map_err(|e| PanelSyncError::storage(format!("Migration failed: {}", e)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fold the WAL back into the main file
    ///
    /// Called before the host process is suspended so a kill does not lose the
    /// queue snapshot sitting in the WAL.
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn quick_check(&self) -> Result<bool> {
        let verdict: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        Ok(verdict == "ok")
    }

    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn tune(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .disable_statement_logging()
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PanelSyncError::storage(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })
        }
        _ => Ok(()),
    }
}
