//! Persisted download models
//!
//! # Storage Layout
//! - `chapter:{content}:{chapter}` → [`ChapterRecord`] (pages with per-page status)
//! - `downloads:{content}` → [`ContentDownloads`] (append-only membership list)
//!
//! Fields added after the first release carry `#[serde(default)]` so older
//! records still load.

use crate::error::Result;
use crate::storage::kv::{keys, load_json, save_json, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Download status of a single page image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// One page image of a chapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterImage {
    /// 1-based page number, unique within a chapter
    pub page_number: u32,

    /// Remote URL the page was resolved to
    pub original_url: String,

    /// Local cached file, once downloaded
    #[serde(default)]
    pub local_path: Option<String>,

    /// Size of the local file in bytes
    #[serde(default)]
    pub file_size: Option<u64>,

    #[serde(default)]
    pub download_status: ImageStatus,
}

impl ChapterImage {
    pub fn pending(page_number: u32, original_url: String) -> Self {
        Self {
            page_number,
            original_url,
            local_path: None,
            file_size: None,
            download_status: ImageStatus::Pending,
        }
    }

    /// Completed with a local path recorded (the file itself is not checked)
    pub fn has_local_copy(&self) -> bool {
        self.download_status == ImageStatus::Completed && self.local_path.is_some()
    }

    /// Completed and the local file exists with non-zero size
    pub async fn local_file_ok(&self) -> bool {
        if !self.has_local_copy() {
            return false;
        }
        match self.local_path.as_deref() {
            Some(path) => match tokio::fs::metadata(Path::new(path)).await {
                Ok(meta) => meta.is_file() && meta.len() > 0,
                Err(_) => false,
            },
            None => false,
        }
    }
}

/// Persisted state of a chapter download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub content_id: String,
    pub chapter_id: String,

    /// Pages sorted by page number
    #[serde(default)]
    pub images: Vec<ChapterImage>,

    /// Page count reported by the content extractor
    #[serde(default)]
    pub total_pages: usize,

    /// Every page completed
    #[serde(default)]
    pub completed: bool,

    pub updated_at: DateTime<Utc>,
}

impl ChapterRecord {
    pub fn completed_pages(&self) -> usize {
        self.images
            .iter()
            .filter(|i| i.download_status == ImageStatus::Completed)
            .count()
    }

    /// Page numbers that failed
    pub fn failed_pages(&self) -> Vec<u32> {
        self.images
            .iter()
            .filter(|i| i.download_status == ImageStatus::Failed)
            .map(|i| i.page_number)
            .collect()
    }

    /// Sum of local file sizes
    pub fn total_bytes(&self) -> u64 {
        self.images.iter().filter_map(|i| i.file_size).sum()
    }

    /// Put the selected pages back to pending and mark the chapter incomplete
    ///
    /// Returns the reset page numbers.
    pub fn reset_pages<F: Fn(&ChapterImage) -> bool>(&mut self, selected: F) -> Vec<u32> {
        let mut reset = Vec::new();
        for image in self.images.iter_mut().filter(|i| selected(i)) {
            image.local_path = None;
            image.file_size = None;
            image.download_status = ImageStatus::Pending;
            reset.push(image.page_number);
        }
        self.completed = false;
        self.updated_at = Utc::now();
        reset
    }

    pub async fn load(
        store: &dyn KeyValueStore,
        content_id: &str,
        chapter_id: &str,
    ) -> Result<Option<Self>> {
        load_json(store, &keys::chapter_record(content_id, chapter_id)).await
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(
            store,
            &keys::chapter_record(&self.content_id, &self.chapter_id),
            self,
        )
        .await
    }

    pub async fn delete(
        store: &dyn KeyValueStore,
        content_id: &str,
        chapter_id: &str,
    ) -> Result<()> {
        store
            .delete(&keys::chapter_record(content_id, chapter_id))
            .await
    }
}

/// Chapters of one content item that finished downloading
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentDownloads {
    pub content_id: String,

    /// In completion order
    #[serde(default)]
    pub chapter_ids: Vec<String>,
}

impl ContentDownloads {
    pub fn contains(&self, chapter_id: &str) -> bool {
        self.chapter_ids.iter().any(|c| c == chapter_id)
    }

    pub async fn load(store: &dyn KeyValueStore, content_id: &str) -> Result<Self> {
        let existing: Option<Self> =
            load_json(store, &keys::content_downloads(content_id)).await?;
        Ok(existing.unwrap_or_else(|| Self {
            content_id: content_id.to_string(),
            chapter_ids: Vec::new(),
        }))
    }

    /// Append a chapter; no write happens when it is already a member
    ///
    /// Returns `true` when the list changed.
    pub async fn append(
        store: &dyn KeyValueStore,
        content_id: &str,
        chapter_id: &str,
    ) -> Result<bool> {
        let mut list = Self::load(store, content_id).await?;
        if list.contains(chapter_id) {
            return Ok(false);
        }

        list.chapter_ids.push(chapter_id.to_string());
        save_json(store, &keys::content_downloads(content_id), &list).await?;
        Ok(true)
    }

    /// Remove a chapter; returns `true` when the list changed
    pub async fn remove(
        store: &dyn KeyValueStore,
        content_id: &str,
        chapter_id: &str,
    ) -> Result<bool> {
        let mut list = Self::load(store, content_id).await?;
        let before = list.chapter_ids.len();
        list.chapter_ids.retain(|c| c != chapter_id);
        if list.chapter_ids.len() == before {
            return Ok(false);
        }

        save_json(store, &keys::content_downloads(content_id), &list).await?;
        Ok(true)
    }
}
