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


//! Chapter download manager
//!
//! Owns the lifecycle of a single chapter download:
//! - Resolves the page list through the [`ContentExtractor`]
//! - Fetches pages in page order through the [`ImageCache`] download domain
//! - Updates [`DownloadProgress`] after every page and fans it out through the [`ProgressHub`]
//! - Persists the chapter record (including partial progress) and, on full
//!   completion, appends the chapter to the per-content membership list
//!
//! # State Machine
//! `Queued → Downloading → {Completed | Paused → Downloading | Failed | Cancelled}`
//!
//! A page failure never aborts its siblings. The chapter then ends `Failed`,
//! retryable when any failed page was retryable.
//!
//! A running chapter pins its cache owner. When capacity eviction later drops a
//! chapter's pages, its record is reset and it leaves the downloaded list.

use crate::cache::{CacheDomain, EvictionListener, ImageCache};
use crate::download::events::ProgressHub;
use crate::download::extractor::{ContentExtractor, PageRef};
use crate::download::job::{ChapterKey, ChapterRef};
use crate::download::progress::{DownloadProgress, DownloadStatus, ProgressTracker};
use crate::error::{PanelSyncError, Result};
use crate::storage::{ChapterImage, ChapterRecord, ContentDownloads, ImageStatus, KeyValueStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal result of one download run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every page cached and the chapter recorded as downloaded
    Completed { pages: usize, bytes: u64 },

    /// Page list unavailable or at least one page failed
    Failed {
        error: String,
        retryable: bool,
        /// Page numbers that failed (empty when the page list itself failed)
        failed_pages: Vec<u32>,
    },

    /// Stopped by cancellation; cached pages are kept
    Cancelled,
}

impl DownloadOutcome {
    pub fn status(&self) -> DownloadStatus {
        match self {
            DownloadOutcome::Completed { .. } => DownloadStatus::Completed,
            DownloadOutcome::Failed { .. } => DownloadStatus::Failed,
            DownloadOutcome::Cancelled => DownloadStatus::Cancelled,
        }
    }
}

/// Controls of a running download
struct JobControl {
    tracker: Arc<Mutex<ProgressTracker>>,
    pause_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

struct ManagerInner {
    cache: ImageCache,
    extractor: Arc<dyn ContentExtractor>,
    store: Arc<dyn KeyValueStore>,
    events: ProgressHub,

    /// Last known progress per chapter
    progress: RwLock<HashMap<ChapterKey, DownloadProgress>>,

    /// Running downloads
    active: Mutex<HashMap<ChapterKey, JobControl>>,

    /// Pages that failed in the last run of each chapter
    failed_pages: Mutex<HashMap<ChapterKey, Vec<u32>>>,
}

/// Removes the active entry however the run ends (including task abort)
struct ActiveGuard<'a> {
    inner: &'a ManagerInner,
    key: ChapterKey,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.key);
    }
}

/// Brings chapter records in line with capacity eviction
struct EvictedChapters {
    store: Arc<dyn KeyValueStore>,
}

#[async_trait]
impl EvictionListener for EvictedChapters {
    async fn on_evicted(&self, owner_key: &str) {
        let Some(key) = ChapterKey::from_owner_key(owner_key) else {
            debug!(owner_key, "Evicted owner is not a chapter");
            return;
        };
        let store = self.store.as_ref();

        if let Err(e) = ContentDownloads::remove(store, &key.content_id, &key.chapter_id).await {
            warn!(chapter = %key, error = %e, "Failed to drop evicted chapter from downloads");
        }

        let mut record = match ChapterRecord::load(store, &key.content_id, &key.chapter_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(chapter = %key, error = %e, "Evicted chapter record unreadable");
                return;
            }
        };
        let reset = record.reset_pages(|i| i.download_status == ImageStatus::Completed);
        match record.save(store).await {
            Ok(()) => info!(chapter = %key, pages = reset.len(), "Evicted chapter marked not downloaded"),
            Err(e) => warn!(chapter = %key, error = %e, "Failed to reset evicted chapter"),
        }
    }
}

/// Download manager
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    pub fn new(
        cache: ImageCache,
        extractor: Arc<dyn ContentExtractor>,
        store: Arc<dyn KeyValueStore>,
        events: ProgressHub,
    ) -> Self {
        cache.set_eviction_listener(Arc::new(EvictedChapters {
            store: store.clone(),
        }));
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                extractor,
                store,
                events,
                progress: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                failed_pages: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn events(&self) -> &ProgressHub {
        &self.inner.events
    }

    pub fn cache(&self) -> &ImageCache {
        &self.inner.cache
    }

    /// Download a chapter to completion, failure or cancellation
    pub async fn start_download(&self, chapter: &ChapterRef) -> Result<DownloadOutcome> {
        self.start_download_with_cancel(chapter, CancellationToken::new())
            .await
    }

    /// Like [`start_download`](Self::start_download) with a caller-owned cancellation token
    pub async fn start_download_with_cancel(
        &self,
        chapter: &ChapterRef,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome> {
        chapter.key.validate()?;
        let key = chapter.key.clone();

        let (tracker, pause_rx) = {
            let mut active = self.inner.active.lock();
            if active.contains_key(&key) {
                return Err(PanelSyncError::InvalidState(format!(
                    "Chapter {} is already downloading",
                    key
                )));
            }

            let tracker = Arc::new(Mutex::new(ProgressTracker::new(&key)));
            let (pause_tx, pause_rx) = watch::channel(false);
            active.insert(
                key.clone(),
                JobControl {
                    tracker: tracker.clone(),
                    pause_tx,
                    cancel: cancel.clone(),
                },
            );
            (tracker, pause_rx)
        };
        let _guard = ActiveGuard {
            inner: &self.inner,
            key: key.clone(),
        };

        self.inner.failed_pages.lock().remove(&key);
        let outcome = {
            let _pin = self.inner.cache.pin_owner(&key.owner_key());
            self.run(chapter, &tracker, &cancel, pause_rx).await
        };
        self.inner.cache.enforce_capacity().await;
        Ok(outcome)
    }

    /// Suspend after the page in progress; cached pages are kept
    pub fn pause_download(&self, key: &ChapterKey) -> Result<()> {
        let tracker = {
            let active = self.inner.active.lock();
            let control = active
                .get(key)
                .ok_or_else(|| PanelSyncError::not_found(format!("Active download {}", key)))?;

            if control.tracker.lock().get_progress().status != DownloadStatus::Downloading {
                return Err(PanelSyncError::InvalidState(format!(
                    "Chapter {} is not downloading",
                    key
                )));
            }
            control.pause_tx.send_replace(true);
            control.tracker.clone()
        };

        info!(chapter = %key, "Download paused");
        self.update_progress(key, &tracker, |t| t.set_status(DownloadStatus::Paused));
        Ok(())
    }

    /// Continue a paused download
    pub fn resume_download(&self, key: &ChapterKey) -> Result<()> {
        let tracker = {
            let active = self.inner.active.lock();
            let control = active
                .get(key)
                .ok_or_else(|| PanelSyncError::not_found(format!("Active download {}", key)))?;

            if control.tracker.lock().get_progress().status != DownloadStatus::Paused {
                return Err(PanelSyncError::InvalidState(format!(
                    "Chapter {} is not paused",
                    key
                )));
            }
            control.tracker.clone()
        };

        // Status first so the worker never publishes Paused after resuming
        self.update_progress(key, &tracker, |t| t.set_status(DownloadStatus::Downloading));
        if let Some(control) = self.inner.active.lock().get(key) {
            control.pause_tx.send_replace(false);
        }
        info!(chapter = %key, "Download resumed");
        Ok(())
    }

    /// Stop issuing page fetches for a running download
    ///
    /// Returns `false` when the chapter is not downloading.
    pub fn cancel_download(&self, key: &ChapterKey) -> bool {
        match self.inner.active.lock().get(key) {
            Some(control) => {
                control.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Last known progress snapshot (no I/O)
    pub fn get_download_progress(&self, key: &ChapterKey) -> Option<DownloadProgress> {
        self.inner.progress.read().get(key).cloned()
    }

    pub fn is_active(&self, key: &ChapterKey) -> bool {
        self.inner.active.lock().contains_key(key)
    }

    pub fn active_downloads(&self) -> Vec<ChapterKey> {
        let mut keys: Vec<ChapterKey> = self.inner.active.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Pages that failed in the chapter's last run
    pub fn failed_pages(&self, key: &ChapterKey) -> Vec<u32> {
        self.inner
            .failed_pages
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Publish a `Queued` snapshot for a job waiting in the queue
    pub fn mark_queued(&self, key: &ChapterKey) {
        self.publish(key, DownloadProgress::new(key));
    }

    /// Publish a `Cancelled` snapshot for a job removed before it started
    pub fn mark_cancelled(&self, key: &ChapterKey) {
        let mut progress = self
            .get_download_progress(key)
            .unwrap_or_else(|| DownloadProgress::new(key));
        progress.status = DownloadStatus::Cancelled;
        progress.download_speed = 0.0;
        progress.estimated_time_remaining = None;
        self.publish(key, progress);
    }

    /// Whether the chapter finished downloading
    pub async fn is_chapter_downloaded(&self, key: &ChapterKey) -> Result<bool> {
        key.validate()?;
        let list = ContentDownloads::load(self.inner.store.as_ref(), &key.content_id).await?;
        Ok(list.contains(&key.chapter_id))
    }

    /// Chapters of a content item that finished downloading, in completion order
    pub async fn downloaded_chapters(&self, content_id: &str) -> Result<Vec<String>> {
        let list = ContentDownloads::load(self.inner.store.as_ref(), content_id).await?;
        Ok(list.chapter_ids)
    }

    /// Persisted record of a chapter (complete or partial)
    pub async fn chapter_record(&self, key: &ChapterKey) -> Result<Option<ChapterRecord>> {
        key.validate()?;
        ChapterRecord::load(self.inner.store.as_ref(), &key.content_id, &key.chapter_id).await
    }

    /// Delete a chapter's record, membership and cached pages
    ///
    /// A running download is cancelled first. Returns `true` when anything was removed.
    pub async fn remove_chapter(&self, key: &ChapterKey) -> Result<bool> {
        key.validate()?;
        self.cancel_download(key);

        let store = self.inner.store.as_ref();
        let had_record = ChapterRecord::load(store, &key.content_id, &key.chapter_id)
            .await?
            .is_some();
        ChapterRecord::delete(store, &key.content_id, &key.chapter_id).await?;
        let was_member = ContentDownloads::remove(store, &key.content_id, &key.chapter_id).await?;
        let had_files = self.inner.cache.remove_owner(&key.owner_key()).await;

        self.inner.progress.write().remove(key);
        self.inner.failed_pages.lock().remove(key);

        info!(chapter = %key, had_record, was_member, had_files, "Chapter removed");
        Ok(had_record || was_member || had_files)
    }

    async fn run(
        &self,
        chapter: &ChapterRef,
        tracker: &Mutex<ProgressTracker>,
        cancel: &CancellationToken,
        mut pause_rx: watch::Receiver<bool>,
    ) -> DownloadOutcome {
        let key = &chapter.key;
        let owner_key = key.owner_key();
        info!(content_id = %key.content_id, chapter_id = %key.chapter_id, "Starting chapter download");
        self.update_progress(key, tracker, |t| t.set_status(DownloadStatus::Downloading));

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            pages = self.inner.extractor.resolve_pages(chapter) => Some(pages),
        };
        let pages = match resolved {
            None => return self.finish_cancelled(key, tracker, None).await,
            Some(Ok(pages)) => dedup_pages(pages),
            Some(Err(e)) => return self.finish_unresolved(key, tracker, e),
        };
        if pages.is_empty() {
            return self.finish_unresolved(
                key,
                tracker,
                PanelSyncError::extraction("Chapter has no pages", true),
            );
        }

        let mut record = self.prepare_record(key, &pages).await;
        let (done, bytes) = (record.completed_pages(), record.total_bytes());
        if done > 0 {
            debug!(chapter = %key, done, "Reusing pages from an earlier run");
        }
        self.update_progress(key, tracker, |t| t.start(pages.len(), done, bytes));
        self.save_record_best_effort(&record).await;

        let mut page_failures: Vec<(u32, bool)> = Vec::new();
        for index in 0..record.images.len() {
            if record.images[index].download_status == ImageStatus::Completed {
                continue;
            }
            if !wait_while_paused(&mut pause_rx, cancel).await {
                return self.finish_cancelled(key, tracker, Some(&mut record)).await;
            }

            let url = record.images[index].original_url.clone();
            record.images[index].download_status = ImageStatus::Downloading;

            let resolved = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                image = self.inner.cache.resolve_image(&url, CacheDomain::Download, &owner_key) => Some(image),
            };
            let Some(resolved) = resolved else {
                return self.finish_cancelled(key, tracker, Some(&mut record)).await;
            };

            let image = &mut record.images[index];
            if resolved.is_local() {
                let size = resolved.size_bytes.unwrap_or(0);
                image.local_path = Some(resolved.location);
                image.file_size = Some(size);
                image.download_status = ImageStatus::Completed;
                self.update_progress(key, tracker, |t| t.page_completed(size));
            } else {
                let retryable = resolved.is_retryable();
                warn!(
                    chapter = %key,
                    page = image.page_number,
                    url = %url,
                    retryable,
                    error = resolved.failure.as_ref().map(|f| f.message.as_str()).unwrap_or(""),
                    "Page download failed"
                );
                image.local_path = None;
                image.file_size = None;
                image.download_status = ImageStatus::Failed;
                page_failures.push((image.page_number, retryable));
                self.update_progress(key, tracker, |_| {});
            }
        }

        // A paused job is only finalized once resumed
        if !wait_while_paused(&mut pause_rx, cancel).await {
            return self.finish_cancelled(key, tracker, Some(&mut record)).await;
        }

        if page_failures.is_empty() {
            self.finish_completed(key, tracker, record).await
        } else {
            self.finish_failed_pages(key, tracker, record, page_failures).await
        }
    }

    /// Build the page list, keeping completed pages still cached on disk
    async fn prepare_record(&self, key: &ChapterKey, pages: &[PageRef]) -> ChapterRecord {
        let owner_key = key.owner_key();
        let previous =
            match ChapterRecord::load(self.inner.store.as_ref(), &key.content_id, &key.chapter_id)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    warn!(chapter = %key, error = %e, "Ignoring unreadable chapter record");
                    None
                }
            };

        let mut images = Vec::with_capacity(pages.len());
        for page in pages {
            let existing = previous.as_ref().and_then(|record| {
                record
                    .images
                    .iter()
                    .find(|i| i.page_number == page.page_number && i.original_url == page.url)
            });
            let reusable = match existing {
                Some(image)
                    if self.inner.cache.contains(&page.url, CacheDomain::Download, &owner_key)
                        && image.local_file_ok().await =>
                {
                    Some(image.clone())
                }
                _ => None,
            };
            images.push(
                reusable.unwrap_or_else(|| ChapterImage::pending(page.page_number, page.url.clone())),
            );
        }

        ChapterRecord {
            content_id: key.content_id.clone(),
            chapter_id: key.chapter_id.clone(),
            images,
            total_pages: pages.len(),
            completed: false,
            updated_at: Utc::now(),
        }
    }

    async fn finish_completed(
        &self,
        key: &ChapterKey,
        tracker: &Mutex<ProgressTracker>,
        mut record: ChapterRecord,
    ) -> DownloadOutcome {
        record.completed = true;
        record.updated_at = Utc::now();

        let store = self.inner.store.as_ref();
        let persisted = match record.save(store).await {
            Ok(()) => ContentDownloads::append(store, &key.content_id, &key.chapter_id).await,
            Err(e) => Err(e),
        };

        match persisted {
            Ok(appended) => {
                let (pages, bytes) = (record.images.len(), record.total_bytes());
                self.inner.failed_pages.lock().remove(key);
                self.update_progress(key, tracker, |t| t.set_status(DownloadStatus::Completed));
                let elapsed = tracker.lock().elapsed();
                info!(
                    chapter = %key,
                    pages,
                    bytes,
                    appended,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Chapter downloaded"
                );
                DownloadOutcome::Completed { pages, bytes }
            }
            Err(e) => {
                error!(chapter = %key, error = %e, "Failed to record completed chapter");
                let message = format!("Could not record chapter: {}", e);
                self.update_progress(key, tracker, |t| t.set_error(message.clone()));
                DownloadOutcome::Failed {
                    error: message,
                    retryable: false,
                    failed_pages: Vec::new(),
                }
            }
        }
    }

    async fn finish_failed_pages(
        &self,
        key: &ChapterKey,
        tracker: &Mutex<ProgressTracker>,
        mut record: ChapterRecord,
        failures: Vec<(u32, bool)>,
    ) -> DownloadOutcome {
        record.completed = false;
        record.updated_at = Utc::now();
        self.save_record_best_effort(&record).await;

        let failed_pages: Vec<u32> = failures.iter().map(|(page, _)| *page).collect();
        let retryable = failures.iter().any(|(_, retryable)| *retryable);
        let message = format!(
            "{} of {} pages failed",
            failed_pages.len(),
            record.images.len()
        );

        self.inner
            .failed_pages
            .lock()
            .insert(key.clone(), failed_pages.clone());
        self.update_progress(key, tracker, |t| t.set_error(message.clone()));
        warn!(chapter = %key, ?failed_pages, retryable, "Chapter incomplete");

        DownloadOutcome::Failed {
            error: message,
            retryable,
            failed_pages,
        }
    }

    fn finish_unresolved(
        &self,
        key: &ChapterKey,
        tracker: &Mutex<ProgressTracker>,
        err: PanelSyncError,
    ) -> DownloadOutcome {
        let retryable = err.is_retryable();
        warn!(chapter = %key, error = %err, retryable, "Could not resolve page list");
        let message = err.to_string();
        self.update_progress(key, tracker, |t| t.set_error(message.clone()));
        DownloadOutcome::Failed {
            error: message,
            retryable,
            failed_pages: Vec::new(),
        }
    }

    async fn finish_cancelled(
        &self,
        key: &ChapterKey,
        tracker: &Mutex<ProgressTracker>,
        record: Option<&mut ChapterRecord>,
    ) -> DownloadOutcome {
        if let Some(record) = record {
            for image in &mut record.images {
                if image.download_status == ImageStatus::Downloading {
                    image.download_status = ImageStatus::Pending;
                }
            }
            record.updated_at = Utc::now();
            self.save_record_best_effort(record).await;
        }

        info!(chapter = %key, "Download cancelled");
        self.update_progress(key, tracker, |t| t.set_status(DownloadStatus::Cancelled));
        DownloadOutcome::Cancelled
    }

    async fn save_record_best_effort(&self, record: &ChapterRecord) {
        if let Err(e) = record.save(self.inner.store.as_ref()).await {
            warn!(
                content_id = %record.content_id,
                chapter_id = %record.chapter_id,
                error = %e,
                "Failed to persist chapter record"
            );
        }
    }

    /// Apply a change to the tracker, store the snapshot, then notify listeners
    fn update_progress<F: FnOnce(&mut ProgressTracker)>(
        &self,
        key: &ChapterKey,
        tracker: &Mutex<ProgressTracker>,
        update: F,
    ) {
        let snapshot = {
            let mut tracker = tracker.lock();
            update(&mut tracker);
            let snapshot = tracker.clone_progress();
            self.inner
                .progress
                .write()
                .insert(key.clone(), snapshot.clone());
            snapshot
        };
        self.inner.events.emit(key, &snapshot);
    }

    fn publish(&self, key: &ChapterKey, progress: DownloadProgress) {
        self.inner
            .progress
            .write()
            .insert(key.clone(), progress.clone());
        self.inner.events.emit(key, &progress);
    }
}

/// Sort by page number and keep the first entry of each number
fn dedup_pages(mut pages: Vec<PageRef>) -> Vec<PageRef> {
    pages.sort_by_key(|p| p.page_number);
    pages.dedup_by_key(|p| p.page_number);
    pages
}

/// Block while paused; `false` once cancelled
async fn wait_while_paused(
    pause_rx: &mut watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        if !*pause_rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = pause_rx.changed() => {
                if changed.is_err() {
                    return !cancel.is_cancelled();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageFetcher;
    use crate::config::CachePolicy;
    use crate::download::events::ListenerScope;
    use crate::storage::{Database, SqliteStore};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Serves every URL except those in `failing`; optionally gated per fetch
    struct FakeFetcher {
        failing: HashSet<String>,
        permanent: bool,
        gate: Option<Arc<Semaphore>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.map_err(|_| PanelSyncError::Cancelled)?.forget();
            }
            if self.failing.contains(url) {
                let status = if self.permanent { 404 } else { 503 };
                return Err(PanelSyncError::from_status(status, url));
            }
            Ok(vec![0xFF; 2048])
        }
    }

    struct FakeExtractor {
        pages: Vec<PageRef>,
    }

    #[async_trait]
    impl ContentExtractor for FakeExtractor {
        async fn resolve_pages(&self, _chapter: &ChapterRef) -> Result<Vec<PageRef>> {
            if self.pages.is_empty() {
                return Err(PanelSyncError::extraction("source offline", false));
            }
            Ok(self.pages.clone())
        }
    }

    fn pages(count: u32) -> Vec<PageRef> {
        (1..=count)
            .map(|n| PageRef::new(n, format!("https://cdn.example/m1/c1/{}.jpg", n)))
            .collect()
    }

    struct Harness {
        manager: DownloadManager,
        fetcher: Arc<FakeFetcher>,
        _dir: tempfile::TempDir,
    }

    async fn harness(pages: Vec<PageRef>, fetcher: FakeFetcher) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new_in_memory().await.unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(db.pool().clone()));
        let fetcher = Arc::new(fetcher);
        let policy = CachePolicy {
            base_delay_ms: 1,
            ..Default::default()
        };
        let cache = ImageCache::open(dir.path(), policy, store.clone(), fetcher.clone())
            .await
            .unwrap();
        let manager = DownloadManager::new(
            cache,
            Arc::new(FakeExtractor { pages }),
            store,
            ProgressHub::new(),
        );
        Harness {
            manager,
            fetcher,
            _dir: dir,
        }
    }

    fn fetcher(failing: &[&str], permanent: bool) -> FakeFetcher {
        FakeFetcher {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            permanent,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn chapter() -> ChapterRef {
        ChapterRef::new(ChapterKey::new("m1", "c1").unwrap(), "manifest")
    }

    #[tokio::test]
    async fn test_successful_download_records_membership() {
        let h = harness(pages(3), fetcher(&[], false)).await;
        let (subscription, mut rx) = h
            .manager
            .events()
            .subscribe_channel(ListenerScope::Chapter(chapter().key));

        let outcome = h.manager.start_download(&chapter()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Completed { pages: 3, bytes: 3 * 2048 });

        let key = chapter().key;
        assert!(h.manager.is_chapter_downloaded(&key).await.unwrap());
        let record = h.manager.chapter_record(&key).await.unwrap().unwrap();
        let numbers: Vec<u32> = record.images.iter().map(|i| i.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(record.completed);

        let progress = h.manager.get_download_progress(&key).unwrap();
        assert_eq!(progress.status, DownloadStatus::Completed);
        assert_eq!(progress.percent, 100.0);

        // Downloading, start, 3 pages, completed
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            statuses.push(event.progress.status);
        }
        assert_eq!(statuses.len(), 6);
        assert_eq!(statuses.last(), Some(&DownloadStatus::Completed));
        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn test_page_failure_keeps_siblings() {
        let h = harness(
            pages(3),
            fetcher(&["https://cdn.example/m1/c1/2.jpg"], false),
        )
        .await;

        let outcome = h.manager.start_download(&chapter()).await.unwrap();
        match outcome {
            DownloadOutcome::Failed {
                retryable,
                failed_pages,
                ..
            } => {
                assert!(retryable);
                assert_eq!(failed_pages, vec![2]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let key = chapter().key;
        let record = h.manager.chapter_record(&key).await.unwrap().unwrap();
        let statuses: Vec<ImageStatus> = record.images.iter().map(|i| i.download_status).collect();
        assert_eq!(
            statuses,
            vec![ImageStatus::Completed, ImageStatus::Failed, ImageStatus::Completed]
        );
        assert_eq!(h.manager.failed_pages(&key), vec![2]);
        assert!(!h.manager.is_chapter_downloaded(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_permanent_page_failure_not_retryable() {
        let h = harness(pages(2), fetcher(&["https://cdn.example/m1/c1/1.jpg"], true)).await;

        match h.manager.start_download(&chapter()).await.unwrap() {
            DownloadOutcome::Failed { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extraction_failure_is_retryable() {
        let h = harness(Vec::new(), fetcher(&[], false)).await;

        match h.manager.start_download(&chapter()).await.unwrap() {
            DownloadOutcome::Failed {
                retryable,
                failed_pages,
                ..
            } => {
                assert!(retryable);
                assert!(failed_pages.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rerun_reuses_completed_pages() {
        let h = harness(
            pages(3),
            fetcher(&["https://cdn.example/m1/c1/3.jpg"], true),
        )
        .await;
        h.manager.start_download(&chapter()).await.unwrap();
        let calls_after_first = h.fetcher.calls.load(Ordering::SeqCst);

        h.manager.start_download(&chapter()).await.unwrap();
        // Only the failed page is requested again
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), calls_after_first + 1);
    }

    #[tokio::test]
    async fn test_pause_resume_and_cancel() {
        let gate = Arc::new(Semaphore::new(0));
        let mut fake = fetcher(&[], false);
        fake.gate = Some(gate.clone());
        let h = harness(pages(3), fake).await;
        let key = chapter().key;

        let manager = h.manager.clone();
        let job = tokio::spawn(async move { manager.start_download(&chapter()).await });

        while !h.manager.is_active(&key)
            || h.manager.get_download_progress(&key).map(|p| p.total_pages) != Some(3)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(h.manager.resume_download(&key).is_err());
        h.manager.pause_download(&key).unwrap();
        assert_eq!(
            h.manager.get_download_progress(&key).unwrap().status,
            DownloadStatus::Paused
        );

        // The in-flight page still completes while paused
        gate.add_permits(1);
        while h.manager.get_download_progress(&key).unwrap().completed_pages < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            h.manager.get_download_progress(&key).unwrap().status,
            DownloadStatus::Paused
        );

        h.manager.resume_download(&key).unwrap();
        assert!(h.manager.cancel_download(&key));

        let outcome = job.await.unwrap().unwrap();
        assert_eq!(outcome, DownloadOutcome::Cancelled);
        assert!(!h.manager.is_active(&key));

        let record = h.manager.chapter_record(&key).await.unwrap().unwrap();
        assert_eq!(record.completed_pages(), 1);
        assert!(!h.manager.is_chapter_downloaded(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_chapter_clears_everything() {
        let h = harness(pages(2), fetcher(&[], false)).await;
        let key = chapter().key;
        h.manager.start_download(&chapter()).await.unwrap();

        assert!(h.manager.remove_chapter(&key).await.unwrap());
        assert!(!h.manager.is_chapter_downloaded(&key).await.unwrap());
        assert!(h.manager.chapter_record(&key).await.unwrap().is_none());
        assert_eq!(h.manager.cache().get_cache_stats().file_count, 0);
        assert!(!h.manager.remove_chapter(&key).await.unwrap());
    }

    #[test]
    fn test_dedup_pages_sorted() {
        let pages = dedup_pages(vec![
            PageRef::new(2, "b"),
            PageRef::new(1, "a"),
            PageRef::new(2, "b2"),
        ]);
        let numbers: Vec<u32> = pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }
}
