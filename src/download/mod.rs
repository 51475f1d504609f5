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


//! Chapter download orchestration
//!
//! This module turns "download this chapter" requests into cached page files.
//!
//! # Modules
//! - `job`: chapter identity
//! - `extractor`: page-list resolution boundary
//! - `progress`: progress snapshots and speed tracking
//! - `events`: progress listener registry
//! - `manager`: single-chapter lifecycle (pause, resume, cancel)
//! - `queue`: persistent priority queue with a concurrency cap
//! - `background`: background wake adapter

pub mod background;
pub mod events;
pub mod extractor;
pub mod job;
pub mod manager;
pub mod progress;
pub mod queue;

// Re-export commonly used types
pub use background::{run_periodic, BackgroundSync, WakeHandler, WorkResult};
pub use events::{ListenerScope, ProgressCallback, ProgressEvent, ProgressHub, Subscription};
pub use extractor::{ContentExtractor, ManifestExtractor, PageRef};
pub use job::{ChapterKey, ChapterRef};
pub use manager::{DownloadManager, DownloadOutcome};
pub use progress::{DownloadProgress, DownloadStatus, ProgressTracker, SpeedTracker};
pub use queue::{AppState, DownloadQueue, FailedJob, QueueItem, QueueSnapshot};
