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


//! Chapter integrity validation
//!
//! # Checks (per cached page)
//! - File exists
//! - Size within [`MIN_IMAGE_SIZE`, `MAX_IMAGE_SIZE`]
//! - Header magic bytes name a supported format
//! - Optional deep scan of a few fixed windows for zero-filled or uniform regions
//!
//! # Recommendation
//! | integrity score | action |
//! |---|---|
//! | ≥ 95 | `none` |
//! | ≥ 80 and fewer than [`TARGETED_REPAIR_LIMIT`] bad pages | `redownload_corrupted` |
//! | ≥ 50 | `redownload_all` |
//! | otherwise | `manual_check` |
//!
//! Results are cached for [`RESULT_TTL`] and tied to the chapter record they
//! were computed from: once the record is rewritten (download, repair, removal,
//! eviction) the cached result is dropped. Concurrent runs for the same chapter
//! share one spawned scan.

use crate::cache::ImageCache;
use crate::download::job::ChapterKey;
use crate::error::Result;
use crate::storage::{ChapterImage, ChapterRecord, ContentDownloads, KeyValueStore};
use crate::validation::sniff::{self, CorruptionPattern, ImageFormat, HEADER_LEN, SAMPLE_WINDOW};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Smallest plausible page image
pub const MIN_IMAGE_SIZE: u64 = 512;

/// Largest accepted page image
pub const MAX_IMAGE_SIZE: u64 = 50 * 1024 * 1024;

/// How long a validation result is reused
pub const RESULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Bad pages above which a targeted repair is not worth it
pub const TARGETED_REPAIR_LIMIT: usize = 5;

/// Sample windows read per page in a deep scan
const DEEP_SCAN_SAMPLES: usize = 4;

/// Recommended follow-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    None,
    RedownloadCorrupted,
    RedownloadAll,
    ManualCheck,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::None => "none",
            RecommendedAction::RedownloadCorrupted => "redownload_corrupted",
            RecommendedAction::RedownloadAll => "redownload_all",
            RecommendedAction::ManualCheck => "manual_check",
        }
    }

    /// Pick an action from the score and the number of bad pages
    pub fn from_score(integrity_score: f64, bad_pages: usize) -> Self {
        if integrity_score >= 95.0 {
            RecommendedAction::None
        } else if integrity_score >= 80.0 && bad_pages < TARGETED_REPAIR_LIMIT {
            RecommendedAction::RedownloadCorrupted
        } else if integrity_score >= 50.0 {
            RecommendedAction::RedownloadAll
        } else {
            RecommendedAction::ManualCheck
        }
    }
}

/// Why a page failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PageIssue {
    /// No local file recorded, or the file is gone
    Missing,
    TooSmall { size: u64 },
    TooLarge { size: u64 },
    UnknownFormat,
    Corrupted { offset: u64, pattern: CorruptionPattern },
    Unreadable { message: String },
}

impl PageIssue {
    pub fn is_missing(&self) -> bool {
        matches!(self, PageIssue::Missing)
    }
}

/// A page that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageReport {
    pub page_number: u32,
    pub url: String,
    pub local_path: Option<String>,
    pub issue: PageIssue,
}

/// Integrity of one chapter's cached pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterValidationResult {
    pub content_id: String,
    pub chapter_id: String,
    pub total_images: usize,
    pub valid_images: usize,
    pub corrupted_images: usize,
    pub missing_images: usize,

    /// `valid_images / total_images * 100`
    pub integrity_score: f64,
    pub recommended_action: RecommendedAction,

    /// Failed pages in page order
    pub issues: Vec<PageReport>,

    /// Formats seen among valid pages
    pub formats: Vec<ImageFormat>,
    pub validated_at: DateTime<Utc>,
}

impl ChapterValidationResult {
    fn unreadable(key: &ChapterKey, total_images: usize) -> Self {
        Self {
            content_id: key.content_id.clone(),
            chapter_id: key.chapter_id.clone(),
            total_images,
            valid_images: 0,
            corrupted_images: 0,
            missing_images: total_images,
            integrity_score: 0.0,
            recommended_action: RecommendedAction::RedownloadAll,
            issues: Vec::new(),
            formats: Vec::new(),
            validated_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.recommended_action == RecommendedAction::None
    }
}

/// Validation options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Sample file contents for corruption patterns
    pub deep_scan: bool,

    /// Ignore a cached result
    pub force_refresh: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            deep_scan: true,
            force_refresh: false,
        }
    }
}

/// What a repair changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub action: RecommendedAction,

    /// Pages reset to pending; the chapter needs downloading again when non-empty
    pub pages_reset: Vec<u32>,
}

impl RepairReport {
    pub fn requires_download(&self) -> bool {
        !self.pages_reset.is_empty()
    }
}

type ResultKey = (ChapterKey, bool);
type SharedValidation = Shared<BoxFuture<'static, ChapterValidationResult>>;

struct CachedValidation {
    at: Instant,
    /// `updated_at` of the record the result was computed from
    record_stamp: Option<DateTime<Utc>>,
    result: ChapterValidationResult,
}

struct RunningValidation {
    id: u64,
    future: SharedValidation,
}

struct ValidatorInner {
    store: Arc<dyn KeyValueStore>,
    cache: ImageCache,
    results: Mutex<HashMap<ResultKey, CachedValidation>>,
    in_flight: Mutex<HashMap<ResultKey, RunningValidation>>,
    next_run: AtomicU64,
}

/// Download validator
///
/// Cheap to clone; clones share cached results.
#[derive(Clone)]
pub struct DownloadValidator {
    inner: Arc<ValidatorInner>,
}

impl DownloadValidator {
    pub fn new(store: Arc<dyn KeyValueStore>, cache: ImageCache) -> Self {
        Self {
            inner: Arc::new(ValidatorInner {
                store,
                cache,
                results: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_run: AtomicU64::new(0),
            }),
        }
    }

    /// Validate a chapter's cached pages
    ///
    /// Only malformed ids are errors; problems with the pages are reported in the result.
    pub async fn validate_chapter_integrity(
        &self,
        content_id: &str,
        chapter_id: &str,
        options: ValidationOptions,
    ) -> Result<ChapterValidationResult> {
        let key = ChapterKey::new(content_id, chapter_id)?;
        let result_key = (key.clone(), options.deep_scan);

        if !options.force_refresh {
            if let Some(result) = self.cached_result(&result_key).await {
                debug!(chapter = %key, "Using cached validation result");
                return Ok(result);
            }
        }

        let shared = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&result_key) {
                Some(running) => running.future.clone(),
                None => {
                    let id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
                    let future = self.spawn_run(result_key.clone(), id);
                    in_flight.insert(
                        result_key,
                        RunningValidation {
                            id,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        Ok(shared.await)
    }

    /// Run the scan on its own task so abandoned callers never strand the in-flight entry
    ///
    /// Called with the in-flight lock held; the task takes the same lock before
    /// removing its entry, so it cannot finish ahead of the insert.
    fn spawn_run(&self, result_key: ResultKey, id: u64) -> SharedValidation {
        let inner = self.inner.clone();
        let task_key = result_key.clone();

        let handle = tokio::spawn(async move {
            let (key, deep_scan) = &task_key;
            let record_stamp = record_stamp(inner.store.as_ref(), key).await;
            let result = run_validation(inner.store.as_ref(), key, *deep_scan).await;

            {
                let mut in_flight = inner.in_flight.lock();
                if in_flight.get(&task_key).map(|r| r.id == id).unwrap_or(false) {
                    in_flight.remove(&task_key);
                    inner.results.lock().insert(
                        task_key.clone(),
                        CachedValidation {
                            at: Instant::now(),
                            record_stamp,
                            result: result.clone(),
                        },
                    );
                }
            }
            result
        });

        let (key, _) = result_key;
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(chapter = %key, error = %e, "Validation task failed");
                    ChapterValidationResult::unreadable(&key, 0)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop cached results for a chapter
    pub fn invalidate(&self, key: &ChapterKey) {
        self.inner.results.lock().retain(|(cached, _), _| cached != key);
    }

    /// Act on the recommendation for a chapter
    ///
    /// Bad pages (or every page for `redownload_all`) are removed from the cache
    /// and reset to pending in the chapter record; the chapter leaves the
    /// downloaded list until it is downloaded again. `none` and `manual_check`
    /// change nothing.
    pub async fn repair_chapter(&self, content_id: &str, chapter_id: &str) -> Result<RepairReport> {
        let key = ChapterKey::new(content_id, chapter_id)?;
        let result = self
            .validate_chapter_integrity(
                content_id,
                chapter_id,
                ValidationOptions {
                    deep_scan: true,
                    force_refresh: true,
                },
            )
            .await?;

        let action = result.recommended_action;
        let pages_reset = match action {
            RecommendedAction::None | RecommendedAction::ManualCheck => Vec::new(),
            RecommendedAction::RedownloadCorrupted => {
                let pages: Vec<u32> = result.issues.iter().map(|i| i.page_number).collect();
                self.reset_pages(&key, Some(&pages)).await?
            }
            RecommendedAction::RedownloadAll => self.reset_pages(&key, None).await?,
        };

        self.invalidate(&key);
        info!(chapter = %key, action = action.as_str(), reset = pages_reset.len(), "Chapter repaired");
        Ok(RepairReport {
            action,
            pages_reset,
        })
    }

    /// A cached result that is still fresh and computed from the current record
    async fn cached_result(&self, result_key: &ResultKey) -> Option<ChapterValidationResult> {
        let (record_stamp, result) = {
            let mut results = self.inner.results.lock();
            match results.get(result_key) {
                Some(cached) if cached.at.elapsed() < RESULT_TTL => {
                    (cached.record_stamp, cached.result.clone())
                }
                Some(_) => {
                    results.remove(result_key);
                    return None;
                }
                None => return None,
            }
        };

        if self::record_stamp(self.inner.store.as_ref(), &result_key.0).await == record_stamp {
            return Some(result);
        }

        debug!(chapter = %result_key.0, "Chapter record changed, dropping validation result");
        let mut results = self.inner.results.lock();
        if results
            .get(result_key)
            .map(|cached| cached.record_stamp == record_stamp)
            .unwrap_or(false)
        {
            results.remove(result_key);
        }
        None
    }

    /// Reset `pages` (every page when `None`) and drop their cached files
    async fn reset_pages(&self, key: &ChapterKey, pages: Option<&[u32]>) -> Result<Vec<u32>> {
        let store = self.inner.store.as_ref();
        let owner_key = key.owner_key();

        match pages {
            Some(pages) => {
                let record = ChapterRecord::load(store, &key.content_id, &key.chapter_id).await?;
                let Some(mut record) = record else {
                    return Ok(Vec::new());
                };

                let urls: Vec<String> = record
                    .images
                    .iter()
                    .filter(|i| pages.contains(&i.page_number))
                    .map(|i| i.original_url.clone())
                    .collect();
                self.inner.cache.remove_files(&owner_key, &urls).await;

                let reset = record.reset_pages(|image| pages.contains(&image.page_number));
                record.save(store).await?;
                ContentDownloads::remove(store, &key.content_id, &key.chapter_id).await?;
                Ok(reset)
            }
            None => {
                self.inner.cache.remove_owner(&owner_key).await;
                let record = ChapterRecord::load(store, &key.content_id, &key.chapter_id).await?;
                let reset = match record {
                    Some(mut record) => {
                        let reset = record.reset_pages(|_| true);
                        record.save(store).await?;
                        reset
                    }
                    None => Vec::new(),
                };
                ContentDownloads::remove(store, &key.content_id, &key.chapter_id).await?;
                Ok(reset)
            }
        }
    }
}

/// `updated_at` of the chapter record, `None` when absent or unreadable
async fn record_stamp(store: &dyn KeyValueStore, key: &ChapterKey) -> Option<DateTime<Utc>> {
    match ChapterRecord::load(store, &key.content_id, &key.chapter_id).await {
        Ok(record) => record.map(|r| r.updated_at),
        Err(e) => {
            debug!(chapter = %key, error = %e, "Chapter record unreadable");
            None
        }
    }
}

async fn run_validation(
    store: &dyn KeyValueStore,
    key: &ChapterKey,
    deep_scan: bool,
) -> ChapterValidationResult {
    let record = match ChapterRecord::load(store, &key.content_id, &key.chapter_id).await {
        Ok(record) => record,
        Err(e) => {
            warn!(chapter = %key, error = %e, "Chapter record unreadable");
            None
        }
    };

    let Some(mut record) = record else {
        return ChapterValidationResult::unreadable(key, 0);
    };
    if !record.images.iter().any(|i| i.local_path.is_some()) {
        let total = record.images.len().max(record.total_pages);
        debug!(chapter = %key, total, "No cached pages");
        return ChapterValidationResult::unreadable(key, total);
    }

    record.images.sort_by_key(|i| i.page_number);

    let mut valid = 0;
    let mut missing = 0;
    let mut corrupted = 0;
    let mut issues = Vec::new();
    let mut formats = Vec::new();

    for image in &record.images {
        match check_page(image, deep_scan).await {
            Ok(format) => {
                valid += 1;
                if !formats.contains(&format) {
                    formats.push(format);
                }
            }
            Err(issue) => {
                if issue.is_missing() {
                    missing += 1;
                } else {
                    corrupted += 1;
                }
                issues.push(PageReport {
                    page_number: image.page_number,
                    url: image.original_url.clone(),
                    local_path: image.local_path.clone(),
                    issue,
                });
            }
        }
    }

    let total = record.images.len();
    let integrity_score = valid as f64 / total as f64 * 100.0;
    let recommended_action = RecommendedAction::from_score(integrity_score, missing + corrupted);

    info!(
        chapter = %key,
        total,
        valid,
        corrupted,
        missing,
        score = integrity_score,
        action = recommended_action.as_str(),
        "Chapter validated"
    );

    ChapterValidationResult {
        content_id: key.content_id.clone(),
        chapter_id: key.chapter_id.clone(),
        total_images: total,
        valid_images: valid,
        corrupted_images: corrupted,
        missing_images: missing,
        integrity_score,
        recommended_action,
        issues,
        formats,
        validated_at: Utc::now(),
    }
}

/// Validate one page file
pub async fn check_page(
    image: &ChapterImage,
    deep_scan: bool,
) -> std::result::Result<ImageFormat, PageIssue> {
    let Some(path) = image.local_path.as_deref() else {
        return Err(PageIssue::Missing);
    };
    check_file(Path::new(path), deep_scan).await
}

/// Validate an image file on disk
pub async fn check_file(path: &Path, deep_scan: bool) -> std::result::Result<ImageFormat, PageIssue> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(PageIssue::Missing),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(PageIssue::Missing),
        Err(e) => {
            return Err(PageIssue::Unreadable {
                message: e.to_string(),
            })
        }
    };

    let size = metadata.len();
    if size < MIN_IMAGE_SIZE {
        return Err(PageIssue::TooSmall { size });
    }
    if size > MAX_IMAGE_SIZE {
        return Err(PageIssue::TooLarge { size });
    }

    let unreadable = |e: std::io::Error| PageIssue::Unreadable {
        message: e.to_string(),
    };
    let mut file = File::open(path).await.map_err(unreadable)?;

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).await.map_err(unreadable)?;
    let format = sniff::sniff_format(&header).ok_or(PageIssue::UnknownFormat)?;

    if deep_scan && format.is_compressed() {
        let mut window = vec![0u8; SAMPLE_WINDOW];
        for offset in sniff::sample_offsets(size, DEEP_SCAN_SAMPLES) {
            file.seek(SeekFrom::Start(offset)).await.map_err(unreadable)?;
            file.read_exact(&mut window).await.map_err(unreadable)?;
            if let Some(pattern) = sniff::scan_window(&window) {
                return Err(PageIssue::Corrupted { offset, pattern });
            }
        }
    }

    Ok(format)
}
