//! Persistent chapter download queue
//!
//! This module implements the scheduler in front of the [`DownloadManager`]:
//! - Orders waiting chapters by priority, then by enqueue order
//! - Caps concurrent downloads at the current `max_concurrent_downloads`
//!   (settings are re-read before every scheduling pass)
//! - Requeues chapters that failed with a retryable error, up to `max_retries`
//! - Persists its state so a restart or suspension loses nothing
//! - Recovers from app restarts (in-flight chapters go back to waiting)
//!
//! # App State
//! In the foreground a finished download immediately starts the next one.
//! In the background nothing starts on its own; each wake runs one
//! scheduling pass through [`DownloadQueue::process_queue_in_background`].

use crate::config::SettingsProvider;
use crate::download::job::{ChapterKey, ChapterRef};
use crate::download::manager::{DownloadManager, DownloadOutcome};
use crate::error::{PanelSyncError, Result};
use crate::storage::{keys, load_json, save_json, KeyValueStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshots older than this are discarded on restore
const STALE_SNAPSHOT_AGE_SECS: i64 = 60 * 60;

/// Version written into persisted snapshots
const SNAPSHOT_VERSION: u32 = 1;

/// Host application lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Foreground,
    Background,
}

/// A chapter waiting for or holding a download slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,

    #[serde(flatten)]
    pub chapter: ChapterRef,

    /// Higher runs first
    #[serde(default)]
    pub priority: i32,

    pub enqueued_at: DateTime<Utc>,

    /// Requeues after retryable failures
    #[serde(default)]
    pub retry_count: u32,

    /// Enqueue order within a priority
    #[serde(default)]
    pub sequence: u64,
}

impl QueueItem {
    pub fn key(&self) -> &ChapterKey {
        &self.chapter.key
    }
}

/// A chapter that failed for good
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub item: QueueItem,
    pub error: String,
    pub retryable: bool,
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub paused: bool,
    pub app_state: AppState,

    /// Waiting items in dispatch order
    pub queued: Vec<QueueItem>,

    /// Items holding a download slot
    pub active: Vec<QueueItem>,

    pub failed: Vec<FailedJob>,
}

/// Durable form of the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedQueue {
    version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    items: Vec<QueueItem>,

    /// In-flight when saved; restored as waiting
    #[serde(default)]
    active: Vec<QueueItem>,
}

/// Active download slot
struct ActiveJob {
    item: QueueItem,
    cancel: CancellationToken,
}

struct QueueState {
    queued: Vec<QueueItem>,
    active: HashMap<ChapterKey, ActiveJob>,
    failed: HashMap<ChapterKey, FailedJob>,
    paused: bool,
    app_state: AppState,
    next_sequence: u64,

    /// Finished jobs since the last background pass
    finished_since_pass: usize,
}

impl QueueState {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Index of the next item to dispatch
    fn next_index(&self) -> Option<usize> {
        self.queued
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|(index, _)| index)
    }

    fn dispatch_order(&self) -> Vec<QueueItem> {
        let mut items = self.queued.clone();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
        items
    }

    fn find(&self, key: &ChapterKey) -> Option<QueueItem> {
        if let Some(job) = self.active.get(key) {
            return Some(job.item.clone());
        }
        self.queued.iter().find(|item| item.key() == key).cloned()
    }

    fn to_persisted(&self) -> PersistedQueue {
        let mut active: Vec<QueueItem> = self.active.values().map(|job| job.item.clone()).collect();
        active.sort_by_key(|item| item.sequence);
        PersistedQueue {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            paused: self.paused,
            items: self.dispatch_order(),
            active,
        }
    }
}

struct QueueInner {
    manager: DownloadManager,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<QueueState>,

    /// Serializes snapshot writes so the newest state lands last
    persist_lock: tokio::sync::Mutex<()>,

    /// Bumped on every change that may end a wait
    changed: watch::Sender<u64>,
}

/// Chapter download queue
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

impl DownloadQueue {
    /// Create an empty queue in the foreground
    pub fn new(
        manager: DownloadManager,
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                manager,
                settings,
                store,
                state: Mutex::new(QueueState {
                    queued: Vec::new(),
                    active: HashMap::new(),
                    failed: HashMap::new(),
                    paused: false,
                    app_state: AppState::Foreground,
                    next_sequence: 0,
                    finished_since_pass: 0,
                }),
                persist_lock: tokio::sync::Mutex::new(()),
                changed,
            }),
        }
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.inner.manager
    }

    /// Add a chapter
    ///
    /// Enqueueing a chapter that is already waiting or downloading returns the
    /// existing item. In the foreground a scheduling pass runs right away.
    pub async fn enqueue(&self, chapter: ChapterRef, priority: i32) -> Result<QueueItem> {
        chapter.key.validate()?;

        let (item, schedule) = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.find(&chapter.key) {
                debug!(chapter = %chapter.key, "Chapter already queued");
                return Ok(existing);
            }

            state.failed.remove(&chapter.key);
            let item = QueueItem {
                id: Uuid::new_v4().to_string(),
                chapter,
                priority,
                enqueued_at: Utc::now(),
                retry_count: 0,
                sequence: state.next_sequence(),
            };
            state.queued.push(item.clone());
            (item, state.app_state == AppState::Foreground)
        };

        info!(chapter = %item.key(), priority, id = %item.id, "Chapter queued");
        self.inner.manager.mark_queued(item.key());
        self.notify_changed();
        self.persist().await;

        if schedule {
            self.process_queue().await;
        }
        Ok(item)
    }

    /// Start waiting chapters until the concurrency cap is reached
    ///
    /// Returns how many downloads were started.
    pub async fn process_queue(&self) -> usize {
        let settings = self.inner.settings.download_settings();

        let started = {
            let mut state = self.inner.state.lock();
            if state.paused {
                return 0;
            }

            let mut started = 0;
            while state.active.len() < settings.max_concurrent_downloads {
                let Some(index) = state.next_index() else {
                    break;
                };
                let item = state.queued.remove(index);
                let cancel = CancellationToken::new();

                // Spawned under the lock so cancel() always finds the token
                self.spawn_job(item.clone(), cancel.clone());
                state
                    .active
                    .insert(item.key().clone(), ActiveJob { item, cancel });
                started += 1;
            }
            started
        };

        if started > 0 {
            debug!(started, cap = settings.max_concurrent_downloads, "Scheduling pass");
            self.notify_changed();
            self.persist().await;
        }
        started
    }

    /// One bounded scheduling pass for a background wake
    ///
    /// Returns `true` when downloads were started or finished since the last
    /// pass, `false` when there was nothing to do or background downloads are
    /// disabled.
    pub async fn process_queue_in_background(&self) -> bool {
        if !self.inner.settings.download_settings().enable_background_downloads {
            debug!("Background downloads disabled");
            return false;
        }

        let finished = std::mem::take(&mut self.inner.state.lock().finished_since_pass);
        let started = self.process_queue().await;
        debug!(started, finished, "Background pass");
        started > 0 || finished > 0
    }

    /// Stop starting new downloads; running ones continue
    pub async fn pause_queue(&self) {
        self.inner.state.lock().paused = true;
        info!("Queue paused");
        self.notify_changed();
        self.persist().await;
    }

    pub async fn resume_queue(&self) {
        let foreground = {
            let mut state = self.inner.state.lock();
            state.paused = false;
            state.app_state == AppState::Foreground
        };
        info!("Queue resumed");
        self.notify_changed();
        self.persist().await;

        if foreground {
            self.process_queue().await;
        }
    }

    /// Drop every waiting chapter and cancel running downloads
    pub async fn clear_queue(&self) -> usize {
        let (removed, cancelled) = {
            let mut state = self.inner.state.lock();
            let removed: Vec<QueueItem> = state.queued.drain(..).collect();
            for job in state.active.values() {
                job.cancel.cancel();
            }
            (removed, state.active.len())
        };

        for item in &removed {
            self.inner.manager.mark_cancelled(item.key());
        }
        info!(removed = removed.len(), cancelled, "Queue cleared");
        self.notify_changed();
        self.persist().await;
        removed.len() + cancelled
    }

    /// Remove a chapter from the queue, cancelling it if running
    ///
    /// Returns `false` when the chapter is unknown to the queue.
    pub async fn cancel(&self, key: &ChapterKey) -> bool {
        enum Found {
            Queued,
            Active,
            Failed,
        }

        let found = {
            let mut state = self.inner.state.lock();
            if let Some(index) = state.queued.iter().position(|item| item.key() == key) {
                state.queued.remove(index);
                Some(Found::Queued)
            } else if let Some(job) = state.active.get(key) {
                job.cancel.cancel();
                Some(Found::Active)
            } else if state.failed.remove(key).is_some() {
                Some(Found::Failed)
            } else {
                None
            }
        };

        match found {
            Some(Found::Queued) => {
                info!(chapter = %key, "Queued chapter cancelled");
                self.inner.manager.mark_cancelled(key);
            }
            Some(Found::Active) => info!(chapter = %key, "Cancelling running chapter"),
            Some(Found::Failed) => debug!(chapter = %key, "Failed chapter dismissed"),
            None => return false,
        }

        self.notify_changed();
        self.persist().await;
        true
    }

    /// Put a failed chapter back in the queue with a fresh retry budget
    pub async fn retry_failed(&self, key: &ChapterKey) -> Result<QueueItem> {
        let (item, schedule) = {
            let mut state = self.inner.state.lock();
            let failed = state
                .failed
                .remove(key)
                .ok_or_else(|| PanelSyncError::not_found(format!("Failed chapter {}", key)))?;

            let mut item = failed.item;
            item.retry_count = 0;
            item.sequence = state.next_sequence();
            state.queued.push(item.clone());
            (item, state.app_state == AppState::Foreground)
        };

        info!(chapter = %key, "Retrying failed chapter");
        self.inner.manager.mark_queued(key);
        self.notify_changed();
        self.persist().await;

        if schedule {
            self.process_queue().await;
        }
        Ok(item)
    }

    /// Switch between foreground and background operation
    pub async fn set_app_state(&self, app_state: AppState) {
        let previous = std::mem::replace(&mut self.inner.state.lock().app_state, app_state);
        if previous == app_state {
            return;
        }

        info!(?app_state, "App state changed");
        match app_state {
            AppState::Background => self.prepare_for_suspension().await,
            AppState::Foreground => {
                self.process_queue().await;
            }
        }
    }

    /// Persist state before the host suspends the process
    pub async fn prepare_for_suspension(&self) {
        self.persist().await;
    }

    /// Reload the persisted queue after a cold start
    ///
    /// In-flight chapters come back as waiting ones. A snapshot older than an
    /// hour is discarded. The snapshot is consumed either way. Returns the
    /// number of restored items; call [`process_queue`](Self::process_queue)
    /// to start them.
    pub async fn restore(&self) -> usize {
        let store = self.inner.store.as_ref();
        let persisted = match load_json::<PersistedQueue>(store, keys::QUEUE_STATE).await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable queue snapshot");
                self.delete_snapshot().await;
                return 0;
            }
        };

        let age = Utc::now() - persisted.saved_at;
        if age > ChronoDuration::seconds(STALE_SNAPSHOT_AGE_SECS) {
            info!(age_secs = age.num_seconds(), "Discarding stale queue snapshot");
            self.delete_snapshot().await;
            return 0;
        }

        let mut items: Vec<QueueItem> = persisted
            .items
            .into_iter()
            .chain(persisted.active)
            .collect();
        items.sort_by_key(|item| item.sequence);

        let restored: Vec<ChapterKey> = {
            let mut state = self.inner.state.lock();
            state.paused = persisted.paused;

            let mut restored = Vec::new();
            for mut item in items {
                if item.key().validate().is_err() || state.find(item.key()).is_some() {
                    continue;
                }
                item.sequence = state.next_sequence();
                restored.push(item.key().clone());
                state.queued.push(item);
            }
            restored
        };

        self.delete_snapshot().await;
        for key in &restored {
            self.inner.manager.mark_queued(key);
        }
        info!(restored = restored.len(), paused = persisted.paused, "Queue restored");
        self.notify_changed();
        restored.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        let mut active: Vec<QueueItem> = state.active.values().map(|job| job.item.clone()).collect();
        active.sort_by_key(|item| item.sequence);
        let mut failed: Vec<FailedJob> = state.failed.values().cloned().collect();
        failed.sort_by_key(|job| job.item.sequence);

        QueueSnapshot {
            paused: state.paused,
            app_state: state.app_state,
            queued: state.dispatch_order(),
            active,
            failed,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queued.len()
    }

    /// Wait until no download is running and nothing can start
    ///
    /// Waiting items count as idle while the queue is paused or in the background.
    pub async fn wait_until_idle(&self) {
        let mut changed = self.inner.changed.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                let blocked = state.paused || state.app_state == AppState::Background;
                if state.active.is_empty() && (state.queued.is_empty() || blocked) {
                    return;
                }
            }
            if changed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Write the queue snapshot (best-effort)
    pub async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let snapshot = self.inner.state.lock().to_persisted();
        if let Err(e) = save_json(self.inner.store.as_ref(), keys::QUEUE_STATE, &snapshot).await {
            warn!(error = %e, "Failed to persist queue state");
        }
    }

    async fn delete_snapshot(&self) {
        if let Err(e) = self.inner.store.delete(keys::QUEUE_STATE).await {
            warn!(error = %e, "Failed to delete queue snapshot");
        }
    }

    fn notify_changed(&self) {
        self.inner.changed.send_modify(|version| *version += 1);
    }

    fn spawn_job(&self, item: QueueItem, cancel: CancellationToken) {
        let queue = self.clone();
        tokio::spawn(async move {
            let outcome = match queue
                .inner
                .manager
                .start_download_with_cancel(&item.chapter, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => DownloadOutcome::Failed {
                    error: e.to_string(),
                    retryable: false,
                    failed_pages: Vec::new(),
                },
            };
            queue.on_job_finished(item, outcome).await;
        });
    }

    async fn on_job_finished(&self, item: QueueItem, outcome: DownloadOutcome) {
        let key = item.key().clone();
        let max_retries = self.inner.settings.download_settings().max_retries;

        let (requeued, chain) = {
            let mut state = self.inner.state.lock();
            state.finished_since_pass += 1;

            let cancelled = match state.active.remove(&key) {
                Some(job) => job.cancel.is_cancelled(),
                None => true,
            };

            let mut requeued = false;
            if !cancelled {
                match &outcome {
                    DownloadOutcome::Completed { .. } | DownloadOutcome::Cancelled => {}
                    DownloadOutcome::Failed {
                        error, retryable, ..
                    } => {
                        if *retryable && item.retry_count < max_retries {
                            let mut retry = item.clone();
                            retry.retry_count += 1;
                            retry.sequence = state.next_sequence();
                            state.queued.push(retry);
                            requeued = true;
                        } else {
                            state.failed.insert(
                                key.clone(),
                                FailedJob {
                                    item: item.clone(),
                                    error: error.clone(),
                                    retryable: *retryable,
                                },
                            );
                        }
                    }
                }
            }
            (requeued, state.app_state == AppState::Foreground)
        };

        match &outcome {
            DownloadOutcome::Completed { pages, .. } => {
                info!(chapter = %key, pages, "Queue job completed")
            }
            DownloadOutcome::Failed { error, .. } if requeued => {
                info!(chapter = %key, attempt = item.retry_count + 1, error = %error, "Requeued after failure");
                self.inner.manager.mark_queued(&key);
            }
            DownloadOutcome::Failed { error, .. } => {
                warn!(chapter = %key, error = %error, "Queue job failed")
            }
            DownloadOutcome::Cancelled => debug!(chapter = %key, "Queue job cancelled"),
        }

        self.notify_changed();
        self.persist().await;

        if chain {
            self.process_queue().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ImageCache, PageFetcher};
    use crate::config::{CachePolicy, DownloadSettings, SharedSettings};
    use crate::download::events::ProgressHub;
    use crate::download::extractor::{ContentExtractor, PageRef};
    use crate::download::progress::DownloadStatus;
    use crate::storage::{Database, SqliteStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Fails chapters whose id starts with "bad"; others wait on the gate
    struct GatedExtractor {
        gate: Arc<Semaphore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentExtractor for GatedExtractor {
        async fn resolve_pages(&self, chapter: &ChapterRef) -> Result<Vec<PageRef>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if chapter.key.chapter_id.starts_with("bad") {
                return Err(PanelSyncError::extraction("mirror offline", false));
            }
            self.gate
                .acquire()
                .await
                .map_err(|_| PanelSyncError::Cancelled)?
                .forget();
            Ok(vec![PageRef::new(
                1,
                format!("https://cdn.example/{}.jpg", chapter.key.owner_key()),
            )])
        }
    }

    struct OkFetcher;

    #[async_trait]
    impl PageFetcher for OkFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(vec![0xAB; 1024])
        }
    }

    struct Harness {
        queue: DownloadQueue,
        settings: SharedSettings,
        store: Arc<dyn KeyValueStore>,
        gate: Arc<Semaphore>,
        extractor: Arc<GatedExtractor>,
        _dir: tempfile::TempDir,
    }

    async fn harness(settings: DownloadSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new_in_memory().await.unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(db.pool().clone()));
        let cache = ImageCache::open(
            dir.path(),
            CachePolicy::default(),
            store.clone(),
            Arc::new(OkFetcher),
        )
        .await
        .unwrap();

        let gate = Arc::new(Semaphore::new(0));
        let extractor = Arc::new(GatedExtractor {
            gate: gate.clone(),
            calls: AtomicUsize::new(0),
        });
        let manager = DownloadManager::new(cache, extractor.clone(), store.clone(), ProgressHub::new());
        let settings = SharedSettings::new(settings);
        let queue = DownloadQueue::new(manager, Arc::new(settings.clone()), store.clone());

        Harness {
            queue,
            settings,
            store,
            gate,
            extractor,
            _dir: dir,
        }
    }

    fn chapter(id: &str) -> ChapterRef {
        ChapterRef::new(ChapterKey::new("m1", id).unwrap(), format!("{}.json", id))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_chaining() {
        let h = harness(DownloadSettings::default()).await;
        for id in ["c1", "c2", "c3", "c4", "c5"] {
            h.queue.enqueue(chapter(id), 0).await.unwrap();
        }

        assert_eq!(h.queue.active_count(), 2);
        assert_eq!(h.queue.queued_count(), 3);

        h.gate.add_permits(1);
        wait_for(|| h.queue.queued_count() == 2).await;
        assert_eq!(h.queue.active_count(), 2);

        h.gate.add_permits(10);
        h.queue.wait_until_idle().await;
        for id in ["c1", "c2", "c3", "c4", "c5"] {
            let key = ChapterKey::new("m1", id).unwrap();
            assert!(h.queue.manager().is_chapter_downloaded(&key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let h = harness(DownloadSettings::default()).await;
        let first = h.queue.enqueue(chapter("c1"), 0).await.unwrap();
        let second = h.queue.enqueue(chapter("c1"), 5).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.queue.active_count() + h.queue.queued_count(), 1);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let h = harness(DownloadSettings::default()).await;
        h.queue.pause_queue().await;
        h.queue.enqueue(chapter("low"), 0).await.unwrap();
        h.queue.enqueue(chapter("high"), 10).await.unwrap();
        h.queue.enqueue(chapter("low2"), 0).await.unwrap();

        let order: Vec<String> = h
            .queue
            .snapshot()
            .queued
            .iter()
            .map(|item| item.chapter.key.chapter_id.clone())
            .collect();
        assert_eq!(order, vec!["high", "low", "low2"]);
    }

    #[tokio::test]
    async fn test_paused_queue_starts_nothing() {
        let h = harness(DownloadSettings::default()).await;
        h.queue.pause_queue().await;
        h.queue.enqueue(chapter("c1"), 0).await.unwrap();
        assert_eq!(h.queue.process_queue().await, 0);

        h.queue.resume_queue().await;
        assert_eq!(h.queue.active_count(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_requeued_until_budget() {
        let h = harness(DownloadSettings {
            max_retries: 2,
            ..Default::default()
        })
        .await;
        let key = ChapterKey::new("m1", "bad1").unwrap();
        h.queue.enqueue(chapter("bad1"), 0).await.unwrap();
        h.queue.wait_until_idle().await;

        // First attempt plus two retries
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 3);
        let snapshot = h.queue.snapshot();
        assert_eq!(snapshot.failed.len(), 1);
        assert!(snapshot.failed[0].retryable);
        assert_eq!(
            h.queue.manager().get_download_progress(&key).unwrap().status,
            DownloadStatus::Failed
        );

        h.settings.update(|s| s.max_retries = 0);
        h.queue.retry_failed(&key).await.unwrap();
        h.queue.wait_until_idle().await;
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 4);
        assert!(h.queue.retry_failed(&ChapterKey::new("m1", "c9").unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_queued_and_clear() {
        let h = harness(DownloadSettings {
            max_concurrent_downloads: 1,
            ..Default::default()
        })
        .await;
        h.queue.enqueue(chapter("c1"), 0).await.unwrap();
        h.queue.enqueue(chapter("c2"), 0).await.unwrap();
        h.queue.enqueue(chapter("c3"), 0).await.unwrap();

        let c2 = ChapterKey::new("m1", "c2").unwrap();
        assert!(h.queue.cancel(&c2).await);
        assert_eq!(
            h.queue.manager().get_download_progress(&c2).unwrap().status,
            DownloadStatus::Cancelled
        );
        assert!(!h.queue.cancel(&c2).await);

        assert_eq!(h.queue.clear_queue().await, 2);
        h.queue.wait_until_idle().await;
        assert_eq!(h.queue.active_count(), 0);
        assert!(h.queue.snapshot().failed.is_empty());
    }

    #[tokio::test]
    async fn test_restore_requeues_active_items() {
        let h = harness(DownloadSettings::default()).await;
        h.queue.set_app_state(AppState::Background).await;
        h.queue.enqueue(chapter("c1"), 0).await.unwrap();
        h.queue.enqueue(chapter("c2"), 0).await.unwrap();
        h.queue.process_queue().await;
        h.queue.persist().await;

        // Fresh queue over the same store
        let restored = DownloadQueue::new(
            h.queue.manager().clone(),
            Arc::new(h.settings.clone()),
            h.store.clone(),
        );
        assert_eq!(restored.restore().await, 2);
        assert_eq!(restored.queued_count(), 2);
        assert!(h.store.get(keys::QUEUE_STATE).await.unwrap().is_none());
        assert_eq!(restored.restore().await, 0);
    }

    #[tokio::test]
    async fn test_stale_snapshot_discarded() {
        let h = harness(DownloadSettings::default()).await;
        let stale = PersistedQueue {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now() - ChronoDuration::hours(2),
            paused: false,
            items: vec![QueueItem {
                id: "old".to_string(),
                chapter: chapter("c1"),
                priority: 0,
                enqueued_at: Utc::now(),
                retry_count: 0,
                sequence: 1,
            }],
            active: Vec::new(),
        };
        save_json(h.store.as_ref(), keys::QUEUE_STATE, &stale).await.unwrap();

        assert_eq!(h.queue.restore().await, 0);
        assert_eq!(h.queue.queued_count(), 0);
        assert!(h.store.get(keys::QUEUE_STATE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_background_pass_reports_work() {
        let h = harness(DownloadSettings::default()).await;
        h.queue.set_app_state(AppState::Background).await;
        h.queue.enqueue(chapter("c1"), 0).await.unwrap();
        assert_eq!(h.queue.active_count(), 0);

        assert!(h.queue.process_queue_in_background().await);
        assert_eq!(h.queue.active_count(), 1);

        h.gate.add_permits(1);
        h.queue.wait_until_idle().await;
        assert!(h.queue.process_queue_in_background().await);
        assert!(!h.queue.process_queue_in_background().await);

        h.settings.set_background_downloads(false);
        h.queue.enqueue(chapter("c2"), 0).await.unwrap();
        assert!(!h.queue.process_queue_in_background().await);
    }
}
