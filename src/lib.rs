//! PanelSync core
//!
//! Offline chapter downloads for a mobile reader: a persistent download
//! queue with a concurrency cap, a per-chapter download manager, a disk-backed
//! image cache, an integrity validator and an offline reader that blends
//! cached pages with live ones.
//!
//! # Modules
//! - `error`: error taxonomy and retry classification
//! - `config`: settings, cache policy and core configuration
//! - `logging`: `tracing` subscriber setup
//! - `storage`: SQLite-backed key-value store and persisted models
//! - `cache`: image cache
//! - `download`: queue, manager, progress events and background adapter
//! - `validation`: chapter integrity checks
//! - `reader`: offline reading and blending
//! - `services`: wiring of all of the above

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod reader;
pub mod services;
pub mod storage;
pub mod validation;

pub use cache::{CacheDomain, ImageCache};
pub use config::{CoreConfig, DownloadSettings, SettingsProvider, SharedSettings};
pub use download::{
    AppState, ChapterKey, ChapterRef, DownloadManager, DownloadProgress, DownloadQueue,
    DownloadStatus,
};
pub use error::{PanelSyncError, Result};
pub use reader::{ChapterContent, OfflineReader};
pub use services::PanelSync;
pub use validation::{DownloadValidator, RecommendedAction};
