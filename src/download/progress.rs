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


//! Chapter download progress tracking and reporting
//!
//! # Progress Information
//! - Content and chapter ids for identification
//! - Completed / total pages and bytes downloaded
//! - Current speed with a moving average over recently completed pages
//! - Time remaining (estimated from the average page size)
//! - Percentage complete (by pages, not bytes)
//! - Download status (Queued, Downloading, Paused, etc.)

use crate::download::job::ChapterKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Lifecycle of a chapter download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting for a free slot
    Queued,
    /// Pages are being fetched
    Downloading,
    /// Suspended by the user, pages kept
    Paused,
    /// Every page cached
    Completed,
    /// At least one page failed, or the page list could not be resolved
    Failed,
    /// Removed before finishing
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// Progress snapshot for a single chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub content_id: String,
    pub chapter_id: String,

    pub status: DownloadStatus,

    /// Percentage of pages completed (0.0 - 100.0)
    pub percent: f64,

    pub completed_pages: usize,

    /// 0 until the page list is resolved
    pub total_pages: usize,

    /// Bytes of completed pages
    pub bytes_downloaded: u64,

    /// Smoothed speed in bytes per second
    pub download_speed: f64,

    /// Estimated seconds remaining; absent while speed is unknown
    pub estimated_time_remaining: Option<u64>,

    /// Error message once failed
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn new(key: &ChapterKey) -> Self {
        Self {
            content_id: key.content_id.clone(),
            chapter_id: key.chapter_id.clone(),
            status: DownloadStatus::Queued,
            percent: 0.0,
            completed_pages: 0,
            total_pages: 0,
            bytes_downloaded: 0,
            download_speed: 0.0,
            estimated_time_remaining: None,
            error: None,
        }
    }

    pub fn key(&self) -> ChapterKey {
        ChapterKey {
            content_id: self.content_id.clone(),
            chapter_id: self.chapter_id.clone(),
        }
    }

    /// Calculate percentage from page counts
    pub fn calculate_percentage(&mut self) {
        if self.total_pages > 0 {
            self.percent = (self.completed_pages as f64 / self.total_pages as f64) * 100.0;
        } else {
            self.percent = 0.0;
        }
    }

    /// Estimate the remaining time from the average page size so far
    pub fn calculate_eta(&mut self) {
        let remaining_pages = self.total_pages.saturating_sub(self.completed_pages);
        if self.download_speed > 0.0 && self.completed_pages > 0 {
            let average_page = self.bytes_downloaded as f64 / self.completed_pages as f64;
            let remaining_bytes = average_page * remaining_pages as f64;
            self.estimated_time_remaining = Some((remaining_bytes / self.download_speed) as u64);
        } else {
            self.estimated_time_remaining = None;
        }
    }

    /// Format download speed as human-readable string (e.g., "350.0 KB/s")
    pub fn speed_string(&self) -> String {
        format!("{:.1} KB/s", self.download_speed / 1_000.0)
    }

    /// Format ETA as human-readable string (e.g., "1m 30s")
    pub fn eta_string(&self) -> String {
        let Some(seconds) = self.estimated_time_remaining else {
            return "calculating...".to_string();
        };

        let minutes = seconds / 60;
        if minutes > 0 {
            format!("{}m {}s", minutes, seconds % 60)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Format bytes as human-readable string (e.g., "4.2 MB")
    pub fn bytes_string(bytes: u64) -> String {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    }

    /// Format progress as display string
    pub fn display_string(&self) -> String {
        let label = format!("{}/{}", self.content_id, self.chapter_id);
        match self.status {
            DownloadStatus::Queued => format!("{}: Queued", label),
            DownloadStatus::Downloading => format!(
                "{}: {:.0}% ({}/{} pages, {}) - {} - {}",
                label,
                self.percent,
                self.completed_pages,
                self.total_pages,
                Self::bytes_string(self.bytes_downloaded),
                self.speed_string(),
                self.eta_string()
            ),
            DownloadStatus::Paused => format!("{}: Paused at {:.0}%", label, self.percent),
            DownloadStatus::Completed => format!("{}: Completed", label),
            DownloadStatus::Failed => format!(
                "{}: Failed - {}",
                label,
                self.error.as_deref().unwrap_or("Unknown error")
            ),
            DownloadStatus::Cancelled => format!("{}: Cancelled", label),
        }
    }
}

/// Speed tracker with moving average
///
/// Keeps samples of cumulative bytes inside a time window, capped to a small
/// number of recent pages so a long chapter does not smooth out slowdowns.
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,

    /// Time window for averaging (default 10 seconds)
    window_duration: Duration,

    /// Maximum samples retained
    max_samples: usize,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,

    /// Total bytes at this point in time
    position: u64,
}

impl SpeedTracker {
    /// Create new speed tracker with default 10-second window over 8 pages
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10), 8)
    }

    pub fn with_window(window_duration: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
            max_samples: max_samples.max(2),
        }
    }

    /// Add a position sample (total bytes downloaded so far)
    pub fn add_position(&mut self, position: u64) {
        self.add_position_at(position, Instant::now());
    }

    fn add_position_at(&mut self, position: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        while let Some(sample) = self.samples.front() {
            let too_old = now.duration_since(sample.timestamp) > self.window_duration;
            if too_old || self.samples.len() > self.max_samples {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Get current average speed in bytes per second
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }

    /// Estimate time remaining based on current speed
    pub fn estimate_time_remaining(&self, bytes_remaining: u64) -> Option<Duration> {
        let speed = self.average_speed();
        if speed > 0.0 {
            Some(Duration::from_secs_f64(bytes_remaining as f64 / speed))
        } else {
            None
        }
    }

    /// Drop all samples (after a pause the old rate is meaningless)
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress tracker combining the snapshot with speed tracking
#[derive(Debug)]
pub struct ProgressTracker {
    progress: DownloadProgress,
    speed_tracker: SpeedTracker,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(key: &ChapterKey) -> Self {
        Self {
            progress: DownloadProgress::new(key),
            speed_tracker: SpeedTracker::new(),
            start_time: Instant::now(),
        }
    }

    /// Page list resolved; pages already cached count as completed
    ///
    /// A pause requested while the page list was resolving is kept.
    pub fn start(&mut self, total_pages: usize, completed_pages: usize, bytes: u64) {
        if self.progress.status != DownloadStatus::Paused {
            self.progress.status = DownloadStatus::Downloading;
        }
        self.progress.total_pages = total_pages;
        self.progress.completed_pages = completed_pages;
        self.progress.bytes_downloaded = bytes;
        self.progress.error = None;
        self.speed_tracker.reset();
        self.speed_tracker.add_position(bytes);
        self.refresh();
    }

    /// Record one completed page of `bytes` size
    pub fn page_completed(&mut self, bytes: u64) {
        self.progress.completed_pages += 1;
        self.progress.bytes_downloaded += bytes;
        self.speed_tracker.add_position(self.progress.bytes_downloaded);
        self.refresh();
    }

    pub fn set_status(&mut self, status: DownloadStatus) {
        if status == DownloadStatus::Downloading && self.progress.status == DownloadStatus::Paused {
            self.speed_tracker.reset();
            self.speed_tracker.add_position(self.progress.bytes_downloaded);
        }
        self.progress.status = status;
        if status.is_terminal() {
            self.progress.download_speed = 0.0;
            self.progress.estimated_time_remaining = None;
        }
    }

    /// Set error message and status to Failed
    pub fn set_error(&mut self, message: String) {
        self.set_status(DownloadStatus::Failed);
        self.progress.error = Some(message);
    }

    pub fn get_progress(&self) -> &DownloadProgress {
        &self.progress
    }

    pub fn clone_progress(&self) -> DownloadProgress {
        self.progress.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn refresh(&mut self) {
        self.progress.download_speed = self.speed_tracker.average_speed();
        self.progress.calculate_percentage();
        self.progress.calculate_eta();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ChapterKey {
        ChapterKey::new("m1", "c1").unwrap()
    }

    #[test]
    fn test_progress_percentage_by_pages() {
        let mut progress = DownloadProgress::new(&key());
        progress.total_pages = 4;
        progress.completed_pages = 1;
        progress.calculate_percentage();
        assert_eq!(progress.percent, 25.0);

        progress.completed_pages = 4;
        progress.calculate_percentage();
        assert_eq!(progress.percent, 100.0);
    }

    #[test]
    fn test_speed_tracker_window() {
        let mut tracker = SpeedTracker::with_window(Duration::from_secs(10), 3);
        let start = Instant::now();

        tracker.add_position_at(0, start);
        tracker.add_position_at(100_000, start + Duration::from_millis(100));
        // 100KB in 100ms = 1MB/s
        let speed = tracker.average_speed();
        assert!(speed > 900_000.0 && speed < 1_100_000.0);

        // Capped to the 3 most recent samples
        tracker.add_position_at(200_000, start + Duration::from_millis(200));
        tracker.add_position_at(200_000, start + Duration::from_millis(1_200));
        assert_eq!(tracker.samples.len(), 3);
        assert!(tracker.average_speed() < 200_000.0);
    }

    #[test]
    fn test_eta_from_average_page_size() {
        let mut progress = DownloadProgress::new(&key());
        progress.total_pages = 10;
        progress.completed_pages = 5;
        progress.bytes_downloaded = 5_000_000;
        progress.download_speed = 1_000_000.0;
        progress.calculate_eta();

        // 5 pages of 1MB at 1MB/s
        assert_eq!(progress.estimated_time_remaining, Some(5));

        progress.download_speed = 0.0;
        progress.calculate_eta();
        assert_eq!(progress.estimated_time_remaining, None);
    }

    #[test]
    fn test_tracker_lifecycle() {
        let mut tracker = ProgressTracker::new(&key());
        assert_eq!(tracker.get_progress().status, DownloadStatus::Queued);

        tracker.start(3, 1, 500);
        tracker.page_completed(500);
        let progress = tracker.clone_progress();
        assert_eq!(progress.status, DownloadStatus::Downloading);
        assert_eq!(progress.completed_pages, 2);
        assert_eq!(progress.bytes_downloaded, 1_000);

        tracker.set_error("page 3 failed".to_string());
        assert_eq!(tracker.get_progress().status, DownloadStatus::Failed);
        assert!(tracker.get_progress().display_string().contains("page 3 failed"));
    }
}
