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


//! Configuration and runtime settings
//!
//! # Settings Boundary
//! - `DownloadSettings` are owned by the host app (settings screen) and re-read by
//!   the queue before every scheduling pass, so changes apply without restart
//! - `SettingsProvider` is the narrow interface the queue consumes
//! - `SharedSettings` is the in-process implementation used by hosts and tests
//!
//! # Static Configuration
//! - `CoreConfig` holds paths and cache policy, loaded once at startup from JSON
//! - Missing fields fall back to defaults (`#[serde(default)]`)

use crate::error::{PanelSyncError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Lower bound for concurrent chapter downloads
pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;

/// Upper bound for concurrent chapter downloads
pub const MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// User-facing download settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadSettings {
    /// Maximum number of chapters downloading at once
    pub max_concurrent_downloads: usize,

    /// Allow the background scheduler to start downloads
    pub enable_background_downloads: bool,

    /// Maximum requeue attempts for a chapter that failed with a retryable error
    pub max_retries: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            enable_background_downloads: true,
            max_retries: 3,
        }
    }
}

impl DownloadSettings {
    /// Clamp values into their supported ranges
    pub fn validate(mut self) -> Self {
        self.max_concurrent_downloads = self
            .max_concurrent_downloads
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS);
        self
    }
}

/// Source of the current download settings
pub trait SettingsProvider: Send + Sync {
    /// Current settings snapshot
    fn download_settings(&self) -> DownloadSettings;
}

/// Thread-safe in-memory settings holder
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<DownloadSettings>>,
}

impl SharedSettings {
    pub fn new(settings: DownloadSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Apply a change; later scheduling passes observe it
    pub fn update<F: FnOnce(&mut DownloadSettings)>(&self, f: F) {
        let mut settings = self.inner.write();
        f(&mut settings);
    }

    pub fn set_max_concurrent_downloads(&self, value: usize) {
        self.update(|s| s.max_concurrent_downloads = value);
    }

    pub fn set_background_downloads(&self, enabled: bool) {
        self.update(|s| s.enable_background_downloads = enabled);
    }
}

impl SettingsProvider for SharedSettings {
    fn download_settings(&self) -> DownloadSettings {
        self.inner.read().clone().validate()
    }
}

/// Image cache policy for both cache domains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Maximum number of chapter entries in the download domain
    pub download_capacity: usize,

    /// Lifetime of preview entries in seconds
    pub preview_ttl_secs: u64,

    /// Fetch attempts per image (first attempt included)
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles for every further attempt
    pub base_delay_ms: u64,

    /// Per-request timeout for page fetches
    pub request_timeout_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            download_capacity: 50,
            preview_ttl_secs: 60 * 60,
            max_attempts: 3,
            base_delay_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

impl CachePolicy {
    pub fn preview_ttl(&self) -> Duration {
        Duration::from_secs(self.preview_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1).min(16));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Static core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root directory for cached images
    pub data_dir: PathBuf,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Image cache policy
    pub cache: CachePolicy,

    /// Initial download settings (the host may replace them at runtime)
    pub downloads: DownloadSettings,

    /// Time budget for a single background wake in seconds
    pub background_budget_secs: u64,

    /// Default log filter when RUST_LOG is not set
    pub log_filter: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let data_dir = Self::default_data_dir();
        Self {
            database_path: data_dir.join("panelsync.db"),
            data_dir,
            cache: CachePolicy::default(),
            downloads: DownloadSettings::default(),
            background_budget_secs: 25,
            log_filter: "info".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path).map_err(|e| {
            PanelSyncError::ConfigurationError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&json).map_err(|e| {
            PanelSyncError::ConfigurationError(format!(
                "Failed to parse {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Directory for the page cache
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn background_budget(&self) -> Duration {
        Duration::from_secs(self.background_budget_secs)
    }

    /// Get default data directory for the platform
    ///
    /// Mobile hosts pass their sandbox directory explicitly instead.
    pub fn default_data_dir() -> PathBuf {
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("PanelSync")
        }

        #[cfg(target_os = "linux")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local").join("share").join("PanelSync")
        }

        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(appdata).join("PanelSync")
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            PathBuf::from("./panelsync")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_clamped() {
        let settings = DownloadSettings {
            max_concurrent_downloads: 0,
            ..Default::default()
        }
        .validate();
        assert_eq!(settings.max_concurrent_downloads, MIN_CONCURRENT_DOWNLOADS);
    }

    #[test]
    fn test_shared_settings_update_visible() {
        let shared = SharedSettings::default();
        assert_eq!(shared.download_settings().max_concurrent_downloads, 2);

        shared.set_max_concurrent_downloads(4);
        assert_eq!(shared.download_settings().max_concurrent_downloads, 4);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = CachePolicy {
            base_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: DownloadSettings =
            serde_json::from_str(r#"{"maxConcurrentDownloads": 3}"#).unwrap();
        assert_eq!(settings.max_concurrent_downloads, 3);
        assert!(settings.enable_background_downloads);
        assert_eq!(settings.max_retries, 3);
    }

    #[test]
    fn test_missing_config_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.cache.download_capacity, 50);
    }
}
