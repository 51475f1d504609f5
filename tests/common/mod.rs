//! Shared fakes for the integration tests
//!
//! `FakeFetcher` serves PNG-shaped bodies for any URL unless the URL was
//! registered as failing, and can hold every fetch behind a semaphore.
//! `StaticExtractor` maps chapters to fixed page lists.

#![allow(dead_code)]

use async_trait::async_trait;
use panelsync_core::cache::PageFetcher;
use panelsync_core::config::CachePolicy;
use panelsync_core::download::{ChapterKey, ChapterRef, ContentExtractor, PageRef};
use panelsync_core::storage::Database;
use panelsync_core::{CoreConfig, DownloadSettings, PanelSync, PanelSyncError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const PAGE_SIZE: usize = 2048;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// A PNG signature followed by non-repeating filler
pub fn png_body(seed: usize) -> Vec<u8> {
    let mut body = PNG_SIGNATURE.to_vec();
    body.extend((0..PAGE_SIZE - PNG_SIGNATURE.len()).map(|i| ((i * 31 + seed) % 251) as u8));
    body
}

pub fn key(content_id: &str, chapter_id: &str) -> ChapterKey {
    ChapterKey::new(content_id, chapter_id).unwrap()
}

pub fn chapter(content_id: &str, chapter_id: &str) -> ChapterRef {
    ChapterRef::new(key(content_id, chapter_id), format!("manifest:{}/{}", content_id, chapter_id))
}

pub fn page_url(key: &ChapterKey, page: u32) -> String {
    format!(
        "https://cdn.example/{}/{}/{:03}.png",
        key.content_id, key.chapter_id, page
    )
}

pub fn pages_for(key: &ChapterKey, count: u32) -> Vec<PageRef> {
    (1..=count).map(|n| PageRef::new(n, page_url(key, n))).collect()
}

pub struct FakeFetcher {
    failing: Mutex<HashMap<String, u16>>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every fetch consumes one permit from `gate` before answering
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self::build(Some(gate)))
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            failing: Mutex::new(HashMap::new()),
            gate,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Answer `url` with an HTTP `status` error from now on
    pub fn fail(&self, url: &str, status: u16) {
        self.failing.lock().insert(url.to_string(), status);
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().remove(url);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let status = self.failing.lock().get(url).copied();
        match status {
            Some(status) => Err(PanelSyncError::from_status(status, url)),
            None => Ok(png_body(url.len())),
        }
    }
}

#[derive(Default)]
pub struct StaticExtractor {
    chapters: Mutex<HashMap<ChapterKey, Vec<PageRef>>>,
}

impl StaticExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `count` pages for `key` and return them
    pub fn add(&self, key: &ChapterKey, count: u32) -> Vec<PageRef> {
        let pages = pages_for(key, count);
        self.chapters.lock().insert(key.clone(), pages.clone());
        pages
    }
}

#[async_trait]
impl ContentExtractor for StaticExtractor {
    async fn resolve_pages(&self, chapter: &ChapterRef) -> Result<Vec<PageRef>> {
        self.chapters
            .lock()
            .get(&chapter.key)
            .cloned()
            .ok_or_else(|| PanelSyncError::from_status(404, &chapter.page_list_source))
    }
}

pub fn config(dir: &Path, downloads: DownloadSettings) -> CoreConfig {
    CoreConfig {
        data_dir: dir.to_path_buf(),
        database_path: dir.join("panelsync.db"),
        cache: CachePolicy {
            base_delay_ms: 1,
            ..Default::default()
        },
        downloads,
        ..Default::default()
    }
}

/// Core backed by an in-memory database
pub async fn open_core(
    dir: &Path,
    downloads: DownloadSettings,
    fetcher: Arc<FakeFetcher>,
    extractor: Arc<StaticExtractor>,
) -> PanelSync {
    let database = Database::new_in_memory().await.unwrap();
    PanelSync::open_with(config(dir, downloads), database, fetcher, extractor)
        .await
        .unwrap()
}

/// Core backed by an in-memory database with a custom cache policy
pub async fn open_core_with_cache(
    dir: &Path,
    downloads: DownloadSettings,
    cache: CachePolicy,
    fetcher: Arc<FakeFetcher>,
    extractor: Arc<StaticExtractor>,
) -> PanelSync {
    let database = Database::new_in_memory().await.unwrap();
    let config = CoreConfig {
        cache,
        ..config(dir, downloads)
    };
    PanelSync::open_with(config, database, fetcher, extractor)
        .await
        .unwrap()
}

/// Core backed by the database file under `dir`, so a second instance sees the same state
pub async fn open_core_on_disk(
    dir: &Path,
    downloads: DownloadSettings,
    fetcher: Arc<FakeFetcher>,
    extractor: Arc<StaticExtractor>,
) -> PanelSync {
    let config = config(dir, downloads);
    let database = Database::new(&config.database_path).await.unwrap();
    PanelSync::open_with(config, database, fetcher, extractor)
        .await
        .unwrap()
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
