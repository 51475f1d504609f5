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


//! Disk-backed image cache
//!
//! # Features
//! - Fetch-or-return-cached resolution keyed by `(domain, owner, url)`
//! - Concurrent requests for the same key share one in-flight fetch
//! - Bounded exponential backoff; a retry short-circuits when the file appeared meanwhile
//! - LRU eviction by entry count (download domain), age expiry (preview domain)
//! - Pinned owners (chapters still downloading) are never evicted; an
//!   [`EvictionListener`] hears about every evicted download owner
//! - Stats computed from the metadata index, never from the filesystem
//!
//! # Failure Semantics
//! Disk and metadata failures are logged and swallowed. A fetch that fails every
//! attempt resolves to the original remote URL so callers always have something
//! renderable.

use crate::cache::entry::{
    self, CacheDomain, CacheEntry, CacheStats, CachedFile, DownloadCacheStats,
};
use crate::cache::fetcher::PageFetcher;
use crate::cache::paths;
use crate::config::CachePolicy;
use crate::error::{PanelSyncError, Result};
use crate::storage::kv::{keys, save_json, KeyValueStore};
use chrono::{DateTime, Utc};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Where a resolved image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Served from an existing cache entry
    Cached,
    /// Fetched and stored by this request
    Downloaded,
    /// Degraded fallback to the original remote URL
    Remote,
}

/// Last error of a resolution that fell back to the remote URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub message: String,
    pub retryable: bool,
}

impl From<&PanelSyncError> for FetchFailure {
    fn from(err: &PanelSyncError) -> Self {
        Self {
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Outcome of resolving one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Local file path, or the remote URL for [`ImageSource::Remote`]
    pub location: String,
    pub source: ImageSource,
    pub size_bytes: Option<u64>,
    pub failure: Option<FetchFailure>,
}

impl ResolvedImage {
    fn local(path: &Path, size_bytes: u64, source: ImageSource) -> Self {
        Self {
            location: path.to_string_lossy().into_owned(),
            source,
            size_bytes: Some(size_bytes),
            failure: None,
        }
    }

    fn remote(url: &str, failure: FetchFailure) -> Self {
        Self {
            location: url.to_string(),
            source: ImageSource::Remote,
            size_bytes: None,
            failure: Some(failure),
        }
    }

    pub fn is_local(&self) -> bool {
        self.source != ImageSource::Remote
    }

    /// A remote fallback whose last error may succeed later
    pub fn is_retryable(&self) -> bool {
        self.failure.as_ref().map(|f| f.retryable).unwrap_or(false)
    }
}

/// Told about download owners removed by capacity eviction
#[async_trait]
pub trait EvictionListener: Send + Sync {
    async fn on_evicted(&self, owner_key: &str);
}

/// Keeps an owner's download entry out of eviction while held
pub struct OwnerPin {
    inner: Arc<CacheInner>,
    owner_key: String,
}

impl Drop for OwnerPin {
    fn drop(&mut self) {
        let mut pinned = self.inner.pinned.lock();
        if let Some(count) = pinned.get_mut(&self.owner_key) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&self.owner_key);
            }
        }
    }
}

type SharedResolve = Shared<BoxFuture<'static, ResolvedImage>>;

/// Fetch in progress for one file key
struct InFlight {
    domain: CacheDomain,
    owner_key: String,
    future: SharedResolve,
    abort: AbortHandle,
}

/// In-memory copy of every persisted cache entry, keyed by storage key
#[derive(Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    last_stamp: Option<DateTime<Utc>>,
}

impl CacheIndex {
    /// Strictly increasing access timestamp
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn observe(&mut self, stamp: DateTime<Utc>) {
        if self.last_stamp.map(|last| stamp > last).unwrap_or(true) {
            self.last_stamp = Some(stamp);
        }
    }

    /// Remove least-recently-accessed download entries until within capacity
    ///
    /// Neither `keep` nor a pinned owner is chosen as the victim, so the count
    /// can stay above capacity until the pins are released.
    fn evict_over_capacity(
        &mut self,
        capacity: usize,
        keep: Option<&str>,
        pinned: &HashMap<String, usize>,
    ) -> Vec<(String, CacheEntry)> {
        let mut evicted = Vec::new();
        loop {
            let count = self
                .entries
                .values()
                .filter(|e| e.domain == CacheDomain::Download)
                .count();
            if count <= capacity {
                break;
            }

            let victim = self
                .entries
                .iter()
                .filter(|(key, e)| {
                    e.domain == CacheDomain::Download
                        && Some(key.as_str()) != keep
                        && !pinned.contains_key(&e.owner_key)
                })
                .min_by_key(|(_, e)| e.accessed_at)
                .map(|(key, _)| key.clone());

            match victim.and_then(|key| self.entries.remove(&key).map(|e| (key, e))) {
                Some(removed) => evicted.push(removed),
                None => break,
            }
        }
        evicted
    }

    fn take_expired_previews(
        &mut self,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
        keep: Option<&str>,
    ) -> Vec<(String, CacheEntry)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, e)| {
                e.domain == CacheDomain::Preview
                    && Some(key.as_str()) != keep
                    && e.is_expired(now, ttl)
            })
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|e| (key, e)))
            .collect()
    }
}

struct CacheInner {
    root: PathBuf,
    policy: CachePolicy,
    store: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn PageFetcher>,
    index: Mutex<CacheIndex>,
    in_flight: Mutex<HashMap<String, InFlight>>,

    /// Pin count per download owner; taken before `index` when both are held
    pinned: Mutex<HashMap<String, usize>>,
    eviction_listener: RwLock<Option<Arc<dyn EvictionListener>>>,
}

/// Image cache service
///
/// Cheap to clone; clones share the same index and in-flight map.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl ImageCache {
    /// Open a cache rooted at `root`, loading persisted entry metadata
    ///
    /// Unreadable metadata is skipped; only an unusable root directory is an error.
    pub async fn open(
        root: impl Into<PathBuf>,
        policy: CachePolicy,
        store: Arc<dyn KeyValueStore>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            PanelSyncError::storage(format!(
                "Failed to create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let mut index = CacheIndex::default();
        match store.entries_with_prefix(keys::CACHE_PREFIX).await {
            Ok(rows) => {
                for (key, json) in rows {
                    match serde_json::from_str::<CacheEntry>(&json) {
                        Ok(entry) => {
                            index.observe(entry.accessed_at);
                            index.entries.insert(key, entry);
                        }
                        Err(e) => warn!(key = %key, error = %e, "Skipping unreadable cache entry"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to load cache metadata, starting empty"),
        }

        info!(
            root = %root.display(),
            entries = index.entries.len(),
            "Image cache opened"
        );

        let cache = Self {
            inner: Arc::new(CacheInner {
                root,
                policy,
                store,
                fetcher,
                index: Mutex::new(index),
                in_flight: Mutex::new(HashMap::new()),
                pinned: Mutex::new(HashMap::new()),
                eviction_listener: RwLock::new(None),
            }),
        };
        cache.sweep_expired_previews().await;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    pub fn set_eviction_listener(&self, listener: Arc<dyn EvictionListener>) {
        *self.inner.eviction_listener.write() = Some(listener);
    }

    /// Exempt `owner_key` from capacity eviction until the pin is dropped
    pub fn pin_owner(&self, owner_key: &str) -> OwnerPin {
        *self
            .inner
            .pinned
            .lock()
            .entry(owner_key.to_string())
            .or_insert(0) += 1;
        OwnerPin {
            inner: self.inner.clone(),
            owner_key: owner_key.to_string(),
        }
    }

    pub fn is_pinned(&self, owner_key: &str) -> bool {
        self.inner.pinned.lock().contains_key(owner_key)
    }

    /// Evict download entries left over capacity while their owners were pinned
    ///
    /// Returns how many entries were evicted.
    pub async fn enforce_capacity(&self) -> usize {
        let evicted = {
            let pinned = self.inner.pinned.lock();
            self.inner.index.lock().evict_over_capacity(
                self.inner.policy.download_capacity,
                None,
                &pinned,
            )
        };
        let count = evicted.len();
        self.discard_evicted(evicted).await;
        count
    }

    /// Local path for `url`, or the remote URL itself when it cannot be cached
    pub async fn get_cached_image_path(
        &self,
        url: &str,
        domain: CacheDomain,
        owner_key: &str,
    ) -> String {
        self.resolve_image(url, domain, owner_key).await.location
    }

    /// Resolve `url` to a cached file, fetching it when needed
    pub async fn resolve_image(
        &self,
        url: &str,
        domain: CacheDomain,
        owner_key: &str,
    ) -> ResolvedImage {
        if let Err(e) = url::Url::parse(url) {
            warn!(url, error = %e, "Refusing to fetch malformed image URL");
            return ResolvedImage::remote(
                url,
                FetchFailure {
                    message: format!("Invalid URL: {}", e),
                    retryable: false,
                },
            );
        }

        if let Some(hit) = self.lookup(url, domain, owner_key).await {
            return hit;
        }

        let file_key = entry::file_key(domain, owner_key, url);
        let future = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&file_key) {
                Some(existing) => {
                    debug!(url, "Joining in-flight fetch");
                    existing.future.clone()
                }
                None => {
                    let cache = self.clone();
                    let task_key = file_key.clone();
                    let task_url = url.to_string();
                    let task_owner = owner_key.to_string();

                    // The task removes its own map entry, which cannot happen
                    // before the insert below since we still hold the lock
                    let handle = tokio::spawn(async move {
                        let resolved = cache.fetch_and_store(&task_url, domain, &task_owner).await;
                        cache.inner.in_flight.lock().remove(&task_key);
                        resolved
                    });
                    let abort = handle.abort_handle();

                    let fallback_url = url.to_string();
                    let future = async move {
                        match handle.await {
                            Ok(resolved) => resolved,
                            Err(e) => ResolvedImage::remote(
                                &fallback_url,
                                FetchFailure {
                                    message: if e.is_cancelled() {
                                        "Fetch cancelled".to_string()
                                    } else {
                                        format!("Fetch task failed: {}", e)
                                    },
                                    retryable: true,
                                },
                            ),
                        }
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(
                        file_key,
                        InFlight {
                            domain,
                            owner_key: owner_key.to_string(),
                            future: future.clone(),
                            abort,
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    /// Whether a file for `url` is indexed (does not refresh access time)
    pub fn contains(&self, url: &str, domain: CacheDomain, owner_key: &str) -> bool {
        let key = storage_key(domain, owner_key, url);
        self.inner
            .index
            .lock()
            .entries
            .get(&key)
            .map(|e| e.file_for(url).is_some())
            .unwrap_or(false)
    }

    /// Snapshot of one entry
    pub fn entry(&self, domain: CacheDomain, entry_key: &str) -> Option<CacheEntry> {
        let key = keys::cache_entry(domain.as_str(), entry_key);
        self.inner.index.lock().entries.get(&key).cloned()
    }

    /// Aggregate statistics over both domains
    pub fn get_cache_stats(&self) -> CacheStats {
        let index = self.inner.index.lock();
        let mut stats = CacheStats::default();
        for entry in index.entries.values() {
            stats.total_size_bytes += entry.size_bytes;
            stats.file_count += entry.file_count();
            match entry.domain {
                CacheDomain::Preview => {
                    stats.preview_entries += 1;
                    stats.preview_size_bytes += entry.size_bytes;
                }
                CacheDomain::Download => {
                    stats.download_entries += 1;
                    stats.download_size_bytes += entry.size_bytes;
                }
            }
        }
        stats
    }

    /// Download domain statistics, optionally for a single owner
    pub fn get_download_cache_stats(&self, owner_key: Option<&str>) -> DownloadCacheStats {
        let index = self.inner.index.lock();
        let mut stats = DownloadCacheStats::default();
        for entry in index.entries.values().filter(|e| {
            e.domain == CacheDomain::Download
                && owner_key.map(|owner| e.owner_key == owner).unwrap_or(true)
        }) {
            stats.entries += 1;
            stats.file_count += entry.file_count();
            stats.total_size_bytes += entry.size_bytes;
        }
        stats
    }

    /// Drop an owner's download entry, its files and pending fetches
    ///
    /// Returns `true` when an entry existed.
    pub async fn remove_owner(&self, owner_key: &str) -> bool {
        self.abort_in_flight(|f| f.domain == CacheDomain::Download && f.owner_key == owner_key);

        let key = keys::cache_entry(CacheDomain::Download.as_str(), owner_key);
        let removed = self.inner.index.lock().entries.remove(&key);
        match removed {
            Some(entry) => {
                info!(owner_key, files = entry.file_count(), "Removing cached owner");
                self.discard(&key, entry).await;
                true
            }
            None => false,
        }
    }

    /// Delete specific files of an owner, returning how many were removed
    pub async fn remove_files(&self, owner_key: &str, urls: &[String]) -> usize {
        let key = keys::cache_entry(CacheDomain::Download.as_str(), owner_key);
        let (removed, remaining) = {
            let mut index = self.inner.index.lock();
            let Some(entry) = index.entries.get_mut(&key) else {
                return 0;
            };
            let removed = entry.remove_urls(urls);
            let remaining = if entry.images.is_empty() {
                index.entries.remove(&key);
                None
            } else {
                Some(entry.clone())
            };
            (removed, remaining)
        };

        for file in &removed {
            remove_file_best_effort(Path::new(&file.path)).await;
        }
        match remaining {
            Some(entry) => self.persist(&key, &entry).await,
            None => self.delete_metadata(&key).await,
        }

        removed.len()
    }

    /// Evict every expired preview entry, returning how many were removed
    pub async fn sweep_expired_previews(&self) -> usize {
        let expired = self.inner.index.lock().take_expired_previews(
            Utc::now(),
            self.inner.policy.preview_ttl(),
            None,
        );
        let count = expired.len();
        for (key, entry) in expired {
            self.discard(&key, entry).await;
        }
        if count > 0 {
            debug!(count, "Swept expired previews");
        }
        count
    }

    /// Remove every entry of a domain, returning how many were removed
    pub async fn clear_domain(&self, domain: CacheDomain) -> usize {
        self.abort_in_flight(|f| f.domain == domain);

        let removed: Vec<(String, CacheEntry)> = {
            let mut index = self.inner.index.lock();
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| e.domain == domain)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| index.entries.remove(&key).map(|e| (key, e)))
                .collect()
        };

        let count = removed.len();
        for (key, entry) in removed {
            self.discard(&key, entry).await;
        }
        info!(domain = %domain, count, "Cleared cache domain");
        count
    }

    /// Serve from the index when the backing file is still usable
    async fn lookup(
        &self,
        url: &str,
        domain: CacheDomain,
        owner_key: &str,
    ) -> Option<ResolvedImage> {
        let key = storage_key(domain, owner_key, url);
        let (path, expired) = {
            let index = self.inner.index.lock();
            let entry = index.entries.get(&key)?;
            let file = entry.file_for(url)?;
            let expired = domain == CacheDomain::Preview
                && entry.is_expired(Utc::now(), self.inner.policy.preview_ttl());
            (PathBuf::from(&file.path), expired)
        };

        if expired {
            debug!(url, "Preview entry expired");
            let removed = self.inner.index.lock().entries.remove(&key);
            if let Some(entry) = removed {
                self.discard(&key, entry).await;
            }
            return None;
        }

        let Some(size) = usable_file_size(&path).await else {
            warn!(url, path = %path.display(), "Cached file missing, refetching");
            self.remove_files_for_key(&key, url).await;
            return None;
        };

        let touched = {
            let mut index = self.inner.index.lock();
            let stamp = index.next_stamp();
            index.entries.get_mut(&key).map(|entry| {
                entry.accessed_at = stamp;
                entry.clone()
            })
        };
        if let Some(entry) = touched {
            self.persist(&key, &entry).await;
        }

        Some(ResolvedImage::local(&path, size, ImageSource::Cached))
    }

    async fn fetch_and_store(&self, url: &str, domain: CacheDomain, owner_key: &str) -> ResolvedImage {
        let path = paths::image_path(&self.inner.root, domain, owner_key, url);
        let max_attempts = self.inner.policy.max_attempts.max(1);
        let mut last_failure = FetchFailure {
            message: format!("No fetch attempted for {}", url),
            retryable: true,
        };

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.inner.policy.backoff_delay(attempt - 1)).await;

                if let Some(size) = usable_file_size(&path).await {
                    debug!(url, attempt, "File appeared while waiting to retry");
                    self.record(url, domain, owner_key, &path, size).await;
                    return ResolvedImage::local(&path, size, ImageSource::Cached);
                }
            }

            match self.inner.fetcher.fetch(url).await {
                Ok(bytes) if bytes.is_empty() => {
                    debug!(url, attempt, "Empty response body");
                    last_failure = FetchFailure {
                        message: format!("Empty response for {}", url),
                        retryable: true,
                    };
                }
                Ok(bytes) => {
                    let size = bytes.len() as u64;
                    if let Err(e) = write_atomic(&path, &bytes).await {
                        warn!(url, path = %path.display(), error = %e, "Failed to write cached image");
                        return ResolvedImage::remote(url, FetchFailure::from(&e));
                    }

                    self.record(url, domain, owner_key, &path, size).await;
                    debug!(url, size, attempt, "Image cached");
                    return ResolvedImage::local(&path, size, ImageSource::Downloaded);
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    debug!(url, attempt, retryable, error = %e, "Image fetch failed");
                    last_failure = FetchFailure::from(&e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        warn!(url, error = %last_failure.message, "Image unavailable, falling back to remote URL");
        ResolvedImage::remote(url, last_failure)
    }

    /// Index a stored file, then apply the domain's eviction policy
    async fn record(&self, url: &str, domain: CacheDomain, owner_key: &str, path: &Path, size: u64) {
        let key = storage_key(domain, owner_key, url);
        let file = CachedFile {
            url: url.to_string(),
            path: path.to_string_lossy().into_owned(),
            size_bytes: size,
        };

        let (entry, evicted) = {
            let pinned = self.inner.pinned.lock();
            let mut index = self.inner.index.lock();
            let stamp = index.next_stamp();

            let entry = match domain {
                CacheDomain::Download => {
                    let entry = index
                        .entries
                        .entry(key.clone())
                        .or_insert_with(|| CacheEntry::new_download(owner_key, stamp));
                    entry.upsert_file(file);
                    entry.accessed_at = stamp;
                    entry.clone()
                }
                CacheDomain::Preview => {
                    let entry = CacheEntry::new_preview(
                        entry::entry_key(domain, owner_key, url),
                        owner_key,
                        file,
                        stamp,
                    );
                    index.entries.insert(key.clone(), entry.clone());
                    entry
                }
            };

            let evicted = match domain {
                CacheDomain::Download => index.evict_over_capacity(
                    self.inner.policy.download_capacity,
                    Some(&key),
                    &pinned,
                ),
                CacheDomain::Preview => index.take_expired_previews(
                    Utc::now(),
                    self.inner.policy.preview_ttl(),
                    Some(&key),
                ),
            };
            (entry, evicted)
        };

        self.persist(&key, &entry).await;
        self.discard_evicted(evicted).await;
    }

    async fn discard_evicted(&self, evicted: Vec<(String, CacheEntry)>) {
        let listener = self.inner.eviction_listener.read().clone();
        for (victim_key, victim) in evicted {
            info!(key = %victim_key, accessed_at = %victim.accessed_at, "Evicting cache entry");
            let owner_key = victim.owner_key.clone();
            let is_download = victim.domain == CacheDomain::Download;
            self.discard(&victim_key, victim).await;

            if let (true, Some(listener)) = (is_download, &listener) {
                listener.on_evicted(&owner_key).await;
            }
        }
    }

    async fn remove_files_for_key(&self, key: &str, url: &str) {
        let remaining = {
            let mut index = self.inner.index.lock();
            let Some(entry) = index.entries.get_mut(key) else {
                return;
            };
            match entry.domain {
                CacheDomain::Download => {
                    entry.remove_urls(&[url.to_string()]);
                    if entry.images.is_empty() {
                        index.entries.remove(key);
                        None
                    } else {
                        Some(entry.clone())
                    }
                }
                CacheDomain::Preview => {
                    index.entries.remove(key);
                    None
                }
            }
        };

        match remaining {
            Some(entry) => self.persist(key, &entry).await,
            None => self.delete_metadata(key).await,
        }
    }

    /// Delete an already unindexed entry's files and metadata
    async fn discard(&self, key: &str, entry: CacheEntry) {
        for path in entry.file_paths() {
            remove_file_best_effort(Path::new(&path)).await;
        }

        if entry.domain == CacheDomain::Download {
            let dir = paths::owner_dir(&self.inner.root, entry.domain, &entry.owner_key);
            // Only succeeds once empty
            let _ = fs::remove_dir(&dir).await;
        }

        self.delete_metadata(key).await;
    }

    async fn persist(&self, key: &str, entry: &CacheEntry) {
        if let Err(e) = save_json(self.inner.store.as_ref(), key, entry).await {
            warn!(key, error = %e, "Failed to persist cache entry");
        }
    }

    async fn delete_metadata(&self, key: &str) {
        if let Err(e) = self.inner.store.delete(key).await {
            warn!(key, error = %e, "Failed to delete cache entry metadata");
        }
    }

    fn abort_in_flight<F: Fn(&InFlight) -> bool>(&self, matches: F) {
        let mut in_flight = self.inner.in_flight.lock();
        in_flight.retain(|_, fetch| {
            if matches(fetch) {
                fetch.abort.abort();
                false
            } else {
                true
            }
        });
    }
}

fn storage_key(domain: CacheDomain, owner_key: &str, url: &str) -> String {
    keys::cache_entry(domain.as_str(), &entry::entry_key(domain, owner_key, url))
}

/// Size of a regular, non-empty file
async fn usable_file_size(path: &Path) -> Option<u64> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

/// Write to a temp file in the same directory, then rename into place
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            PanelSyncError::storage(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let temp_path = paths::partial_path(path);
    fs::write(&temp_path, contents).await.map_err(|e| {
        PanelSyncError::storage(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;

    if let Err(e) = fs::rename(&temp_path, path).await {
        remove_file_best_effort(&temp_path).await;
        return Err(PanelSyncError::storage(format!(
            "Failed to rename {} -> {}: {}",
            temp_path.display(),
            path.display(),
            e
        )));
    }

    Ok(())
}

async fn remove_file_best_effort(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete cached file"),
    }
}
