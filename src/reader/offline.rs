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


//! Offline chapter reader
//!
//! Serves downloaded chapters from the cache and merges partially cached
//! chapters with a live page list ("blending"). Nothing cached is a normal
//! result ([`ChapterContent::NotOffline`]), never an error; only malformed ids fail.

use crate::download::extractor::PageRef;
use crate::download::job::ChapterKey;
use crate::error::Result;
use crate::storage::{ChapterImage, ChapterRecord, ContentDownloads, ImageStatus, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a page will be displayed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageSource {
    Local,
    Remote,
}

/// One page ready for presentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderPage {
    pub page_number: u32,

    /// Remote URL, also the fallback for a broken local file
    pub url: String,

    pub local_path: Option<String>,
    pub status: ImageStatus,
    pub source: PageSource,
}

impl ReaderPage {
    fn local(image: &ChapterImage, url: &str) -> Self {
        Self {
            page_number: image.page_number,
            url: url.to_string(),
            local_path: image.local_path.clone(),
            status: ImageStatus::Completed,
            source: PageSource::Local,
        }
    }

    fn remote(page: &PageRef) -> Self {
        Self {
            page_number: page.page_number,
            url: page.url.clone(),
            local_path: None,
            status: ImageStatus::Pending,
            source: PageSource::Remote,
        }
    }

    pub fn is_local(&self) -> bool {
        self.source == PageSource::Local
    }
}

/// Why a chapter cannot be read offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum NotOfflineReason {
    /// Never finished downloading
    NotDownloaded,
    /// Downloaded, but some page files are gone
    FilesMissing { missing_pages: Vec<u32> },
    /// Download records could not be read
    Unreadable,
}

/// Fully cached chapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineChapter {
    pub content_id: String,
    pub chapter_id: String,
    pub pages: Vec<ReaderPage>,
}

/// Result of an offline read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "data")]
pub enum ChapterContent {
    Offline(OfflineChapter),
    NotOffline(NotOfflineReason),
}

impl ChapterContent {
    pub fn is_offline(&self) -> bool {
        matches!(self, ChapterContent::Offline(_))
    }
}

/// Cached pages merged with a live page list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlendedChapter {
    /// Sorted by page number
    pub pages: Vec<ReaderPage>,

    /// Network pages without a cached copy
    pub missing_pages: Vec<u32>,
}

impl BlendedChapter {
    pub fn local_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_local()).count()
    }
}

/// Merge cached pages with a network page list, preferring local copies
///
/// `cached` should only hold pages whose files were checked; entries without
/// a local copy are ignored. Cached pages missing from `network` are kept.
pub fn blend_pages(cached: &[ChapterImage], network: &[PageRef]) -> BlendedChapter {
    let local: BTreeMap<u32, &ChapterImage> = cached
        .iter()
        .filter(|image| image.has_local_copy())
        .map(|image| (image.page_number, image))
        .collect();

    let mut pages: BTreeMap<u32, ReaderPage> = BTreeMap::new();
    let mut missing_pages = Vec::new();

    for page in network {
        if pages.contains_key(&page.page_number) {
            continue;
        }
        let blended = match local.get(&page.page_number) {
            Some(image) => ReaderPage::local(image, &page.url),
            None => {
                missing_pages.push(page.page_number);
                ReaderPage::remote(page)
            }
        };
        pages.insert(page.page_number, blended);
    }

    for (number, image) in &local {
        pages
            .entry(*number)
            .or_insert_with(|| ReaderPage::local(image, &image.original_url));
    }

    missing_pages.sort_unstable();
    BlendedChapter {
        pages: pages.into_values().collect(),
        missing_pages,
    }
}

/// Offline reader over the download records
#[derive(Clone)]
pub struct OfflineReader {
    store: Arc<dyn KeyValueStore>,
}

impl OfflineReader {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Cached-only content of a downloaded chapter
    pub async fn get_chapter_content(
        &self,
        content_id: &str,
        chapter_id: &str,
    ) -> Result<ChapterContent> {
        let key = ChapterKey::new(content_id, chapter_id)?;

        let downloads = match ContentDownloads::load(self.store.as_ref(), content_id).await {
            Ok(downloads) => downloads,
            Err(e) => {
                warn!(chapter = %key, error = %e, "Download list unreadable");
                return Ok(ChapterContent::NotOffline(NotOfflineReason::Unreadable));
            }
        };
        if !downloads.contains(chapter_id) {
            return Ok(ChapterContent::NotOffline(NotOfflineReason::NotDownloaded));
        }

        let record = match self.load_record(&key).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(ChapterContent::NotOffline(NotOfflineReason::NotDownloaded)),
            Err(e) => {
                warn!(chapter = %key, error = %e, "Chapter record unreadable");
                return Ok(ChapterContent::NotOffline(NotOfflineReason::Unreadable));
            }
        };

        let mut images = record.images;
        images.sort_by_key(|image| image.page_number);

        let mut pages = Vec::with_capacity(images.len());
        let mut missing_pages = Vec::new();
        for image in &images {
            if image.local_file_ok().await {
                pages.push(ReaderPage::local(image, &image.original_url));
            } else {
                missing_pages.push(image.page_number);
            }
        }

        if !missing_pages.is_empty() || pages.is_empty() {
            debug!(chapter = %key, ?missing_pages, "Downloaded chapter has missing files");
            return Ok(ChapterContent::NotOffline(NotOfflineReason::FilesMissing {
                missing_pages,
            }));
        }

        Ok(ChapterContent::Offline(OfflineChapter {
            content_id: key.content_id,
            chapter_id: key.chapter_id,
            pages,
        }))
    }

    /// Merge whatever is cached (complete or partial) with `network_pages`
    pub async fn get_blended_chapter_content(
        &self,
        content_id: &str,
        chapter_id: &str,
        network_pages: &[PageRef],
    ) -> Result<BlendedChapter> {
        let key = ChapterKey::new(content_id, chapter_id)?;

        let record = match self.load_record(&key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(chapter = %key, error = %e, "Chapter record unreadable, blending network pages only");
                None
            }
        };

        let mut usable = Vec::new();
        for image in record.map(|r| r.images).unwrap_or_default() {
            if image.local_file_ok().await {
                usable.push(image);
            }
        }

        let blended = blend_pages(&usable, network_pages);
        debug!(
            chapter = %key,
            local = blended.local_count(),
            missing = blended.missing_pages.len(),
            "Blended chapter"
        );
        Ok(blended)
    }

    pub async fn is_available_offline(&self, content_id: &str, chapter_id: &str) -> Result<bool> {
        Ok(self
            .get_chapter_content(content_id, chapter_id)
            .await?
            .is_offline())
    }

    async fn load_record(&self, key: &ChapterKey) -> Result<Option<ChapterRecord>> {
        ChapterRecord::load(self.store.as_ref(), &key.content_id, &key.chapter_id).await
    }
}
