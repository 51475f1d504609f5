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


//! Image cache
//!
//! Disk-backed page and thumbnail cache shared by the download manager, the
//! validator and the offline reader.
//!
//! # Modules
//! - `entry`: cache domains, entry metadata and statistics
//! - `paths`: deterministic on-disk layout
//! - `fetcher`: the `PageFetcher` boundary and its HTTP implementation
//! - `image_cache`: the `ImageCache` service (dedup, retry, eviction)

pub mod entry;
pub mod fetcher;
pub mod image_cache;
pub mod paths;

pub use entry::{CacheDomain, CacheEntry, CacheStats, CachedFile, DownloadCacheStats};
pub use fetcher::{HttpPageFetcher, PageFetcher};
pub use image_cache::{
    EvictionListener, FetchFailure, ImageCache, ImageSource, OwnerPin, ResolvedImage,
};
