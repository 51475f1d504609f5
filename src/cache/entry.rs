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


//! Cache entry metadata
//!
//! # Domains
//! - `Preview`: one entry per image (search/browse thumbnails), expires by age
//! - `Download`: one entry per owner (a chapter), holding all of its page files,
//!   bounded by entry count and evicted least-recently-accessed first

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Independent cache partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDomain {
    /// Short-lived thumbnails
    Preview,
    /// Durable chapter pages
    Download,
}

impl CacheDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheDomain::Preview => "preview",
            CacheDomain::Download => "download",
        }
    }
}

impl std::fmt::Display for CacheDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic file key for `(domain, owner, url)`
pub fn file_key(domain: CacheDomain, owner_key: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(owner_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(url.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Entry key within a domain
pub fn entry_key(domain: CacheDomain, owner_key: &str, url: &str) -> String {
    match domain {
        CacheDomain::Download => owner_key.to_string(),
        CacheDomain::Preview => file_key(domain, owner_key, url),
    }
}

/// One cached file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    /// Remote URL the file was fetched from
    pub url: String,
    /// Local file path
    pub path: String,
    pub size_bytes: u64,
}

/// Cache entry metadata, persisted under `cache:{domain}:{key}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub domain: CacheDomain,

    /// Owner the entry belongs to (chapter key or preview scope)
    #[serde(default)]
    pub owner_key: String,

    /// Page files (download domain)
    #[serde(default)]
    pub images: Vec<CachedFile>,

    /// Single file (preview domain)
    #[serde(default)]
    pub single_file: Option<CachedFile>,

    pub created_at: DateTime<Utc>,

    /// Refreshed on every read; the only LRU ordering key
    pub accessed_at: DateTime<Utc>,

    #[serde(default)]
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new_download(owner_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: owner_key.to_string(),
            domain: CacheDomain::Download,
            owner_key: owner_key.to_string(),
            images: Vec::new(),
            single_file: None,
            created_at: now,
            accessed_at: now,
            size_bytes: 0,
        }
    }

    pub fn new_preview(key: String, owner_key: &str, file: CachedFile, now: DateTime<Utc>) -> Self {
        Self {
            key,
            domain: CacheDomain::Preview,
            owner_key: owner_key.to_string(),
            size_bytes: file.size_bytes,
            images: Vec::new(),
            single_file: Some(file),
            created_at: now,
            accessed_at: now,
        }
    }

    /// File cached for `url`, if any
    pub fn file_for(&self, url: &str) -> Option<&CachedFile> {
        match self.domain {
            CacheDomain::Download => self.images.iter().find(|f| f.url == url),
            CacheDomain::Preview => self.single_file.as_ref().filter(|f| f.url == url),
        }
    }

    /// Insert or replace the file for its URL (download domain)
    pub fn upsert_file(&mut self, file: CachedFile) {
        self.images.retain(|f| f.url != file.url);
        self.images.push(file);
        self.recompute_size();
    }

    /// Drop files for the given URLs, returning the removed ones
    pub fn remove_urls(&mut self, urls: &[String]) -> Vec<CachedFile> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .images
            .drain(..)
            .partition(|f| urls.iter().any(|u| *u == f.url));
        self.images = kept;
        self.recompute_size();
        removed
    }

    /// Every backing file path
    pub fn file_paths(&self) -> Vec<String> {
        self.images
            .iter()
            .chain(self.single_file.iter())
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.images.len() + usize::from(self.single_file.is_some())
    }

    /// Older than `ttl` measured from creation
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.created_at >= ttl,
            Err(_) => false,
        }
    }

    fn recompute_size(&mut self) {
        self.size_bytes = self
            .images
            .iter()
            .chain(self.single_file.iter())
            .map(|f| f.size_bytes)
            .sum();
    }
}

/// Aggregate statistics across both domains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_size_bytes: u64,
    pub file_count: usize,
    pub preview_entries: usize,
    pub download_entries: usize,
    pub preview_size_bytes: u64,
    pub download_size_bytes: u64,
}

/// Statistics for the download domain (optionally one owner)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCacheStats {
    pub entries: usize,
    pub file_count: usize,
    pub total_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(url: &str, size: u64) -> CachedFile {
        CachedFile {
            url: url.to_string(),
            path: format!("/cache/{}", size),
            size_bytes: size,
        }
    }

    #[test]
    fn test_file_key_deterministic_and_domain_scoped() {
        let a = file_key(CacheDomain::Download, "m1/c1", "https://cdn/1.jpg");
        let b = file_key(CacheDomain::Download, "m1/c1", "https://cdn/1.jpg");
        let c = file_key(CacheDomain::Preview, "m1/c1", "https://cdn/1.jpg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_upsert_and_remove_update_size() {
        let mut entry = CacheEntry::new_download("m1/c1", Utc::now());
        entry.upsert_file(file("u1", 10));
        entry.upsert_file(file("u2", 20));
        entry.upsert_file(file("u1", 15));
        assert_eq!(entry.size_bytes, 35);
        assert_eq!(entry.file_count(), 2);

        let removed = entry.remove_urls(&["u2".to_string()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(entry.size_bytes, 15);
    }

    #[test]
    fn test_preview_expiry_by_age() {
        let created = Utc::now() - chrono::Duration::minutes(61);
        let entry = CacheEntry::new_preview("k".into(), "search", file("u", 1), created);
        assert!(entry.is_expired(Utc::now(), Duration::from_secs(3600)));
        assert!(!entry.is_expired(created, Duration::from_secs(3600)));
    }
}
