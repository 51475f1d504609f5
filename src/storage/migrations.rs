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


//! Database migrations
//!
//! Migrations run as runtime SQL so the library works on mobile without a
//! build-time database connection. Applied migrations are tracked in `_migrations`.
//!
//! # Schema
//! The download subsystem only needs a durable key-value table: every queue
//! snapshot, cache entry, chapter record and membership list is stored as a JSON
//! document under its own deterministic key. A crash between two related writes
//! leaves each key independently valid.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};
use tracing::info;

/// Migration id, name and SQL, applied in order
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "key_value_entries",
    r#"
-- One JSON document per logical record
CREATE TABLE IF NOT EXISTS KeyValueEntries (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
)];

/// Apply every migration not yet recorded in `_migrations`
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT id FROM _migrations")
        .fetch_all(pool)
        .await?;

    for (id, name, sql) in MIGRATIONS {
        if applied.contains(id) {
            continue;
        }

        let mut tx = pool.begin().await?;
        (&mut *tx).execute(*sql).await?;
        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(*id)
            .bind(*name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(id, name, "Applied migration");
    }

    Ok(())
}
