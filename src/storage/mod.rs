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


//! Durable storage
//!
//! SQLite (through sqlx) backs a single key-value table. Queue snapshots, image
//! cache metadata, chapter records and per-content membership lists are JSON
//! documents stored under deterministic keys.
//!
//! # Usage Example
//! ```no_run
//! use panelsync_core::storage::{Database, SqliteStore, ContentDownloads};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./panelsync.db").await?;
//! let store = SqliteStore::new(db.pool().clone());
//!
//! let downloads = ContentDownloads::load(&store, "manga-42").await?;
//! println!("{} chapters offline", downloads.chapter_ids.len());
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod kv;
pub mod migrations;
pub mod models;

// Re-export commonly used types
pub use database::Database;
pub use kv::{keys, load_json, save_json, KeyValueStore, SqliteStore};
pub use models::{ChapterImage, ChapterRecord, ContentDownloads, ImageStatus};
