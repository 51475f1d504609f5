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


//! Service wiring
//!
//! [`PanelSync`] constructs every component explicitly and hands each its
//! collaborators. There is no global state; tests and hosts may run several
//! independent instances side by side.

use crate::cache::{HttpPageFetcher, ImageCache, PageFetcher};
use crate::config::{CoreConfig, SharedSettings};
use crate::download::{
    BackgroundSync, ContentExtractor, DownloadManager, DownloadQueue, ManifestExtractor,
    ProgressHub,
};
use crate::error::{PanelSyncError, Result};
use crate::reader::OfflineReader;
use crate::storage::{Database, KeyValueStore, SqliteStore};
use crate::validation::DownloadValidator;
use std::sync::Arc;
use tracing::{info, warn};

/// Fully wired download subsystem
pub struct PanelSync {
    pub config: CoreConfig,
    pub database: Database,
    pub store: Arc<dyn KeyValueStore>,
    pub settings: SharedSettings,
    pub events: ProgressHub,
    pub cache: ImageCache,
    pub manager: DownloadManager,
    pub queue: DownloadQueue,
    pub validator: DownloadValidator,
    pub reader: OfflineReader,
}

impl PanelSync {
    /// Open with the HTTP page fetcher and the manifest extractor
    pub async fn open(config: CoreConfig) -> Result<Self> {
        let timeout = config.cache.request_timeout();
        let fetcher = Arc::new(HttpPageFetcher::new(timeout)?);
        let extractor = Arc::new(ManifestExtractor::new(timeout)?);
        let database = Database::new(&config.database_path).await?;
        Self::open_with(config, database, fetcher, extractor).await
    }

    /// Open with caller-supplied collaborators
    ///
    /// A persisted queue snapshot is restored but not started; call
    /// [`DownloadQueue::process_queue`] when the host is ready.
    pub async fn open_with(
        config: CoreConfig,
        database: Database,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn ContentExtractor>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await.map_err(|e| {
            PanelSyncError::storage(format!(
                "Failed to create data directory {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;

        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(database.pool().clone()));
        let settings = SharedSettings::new(config.downloads.clone());
        let events = ProgressHub::new();

        let cache =
            ImageCache::open(config.cache_dir(), config.cache.clone(), store.clone(), fetcher)
                .await?;
        let manager = DownloadManager::new(cache.clone(), extractor, store.clone(), events.clone());
        let queue = DownloadQueue::new(manager.clone(), Arc::new(settings.clone()), store.clone());
        let validator = DownloadValidator::new(store.clone(), cache.clone());
        let reader = OfflineReader::new(store.clone());

        let restored = queue.restore().await;
        info!(
            data_dir = %config.data_dir.display(),
            restored,
            "PanelSync core opened"
        );

        Ok(Self {
            config,
            database,
            store,
            settings,
            events,
            cache,
            manager,
            queue,
            validator,
            reader,
        })
    }

    /// Wake handler bounded by the configured background budget
    pub fn background_sync(&self) -> BackgroundSync {
        BackgroundSync::new(self.queue.clone(), self.config.background_budget())
    }

    /// Persist the queue and close the database
    pub async fn shutdown(self) -> Result<()> {
        self.queue.prepare_for_suspension().await;
        if let Err(e) = self.database.checkpoint().await {
            warn!(error = %e, "WAL checkpoint failed");
        }
        self.database.close().await
    }
}
