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


//! Background wake adapter
//!
//! Hosts wake the process periodically while it is in the background. Each
//! wake runs one bounded scheduling pass and reports whether it did anything,
//! then persists the queue because the process may be suspended right after.

use crate::download::queue::DownloadQueue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result reported back to the host scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkResult {
    NewData,
    NoData,
    Failed,
}

/// Handler invoked on each background wake
#[async_trait]
pub trait WakeHandler: Send + Sync {
    async fn on_wake(&self) -> WorkResult;
}

/// Queue-driven wake handler with a time budget per wake
#[derive(Clone)]
pub struct BackgroundSync {
    queue: DownloadQueue,
    budget: Duration,
}

impl BackgroundSync {
    pub fn new(queue: DownloadQueue, budget: Duration) -> Self {
        Self { queue, budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

#[async_trait]
impl WakeHandler for BackgroundSync {
    async fn on_wake(&self) -> WorkResult {
        let result = match tokio::time::timeout(
            self.budget,
            self.queue.process_queue_in_background(),
        )
        .await
        {
            Ok(true) => WorkResult::NewData,
            Ok(false) => WorkResult::NoData,
            Err(_) => {
                warn!(budget_ms = self.budget.as_millis() as u64, "Background pass exceeded its budget");
                WorkResult::Failed
            }
        };

        self.queue.prepare_for_suspension().await;
        debug!(?result, "Background wake finished");
        result
    }
}

/// Invoke `handler` every `interval` until `shutdown` fires
///
/// Stands in for the host scheduler on platforms without one (and in the CLI).
/// Returns the number of wakes.
pub async fn run_periodic(
    handler: Arc<dyn WakeHandler>,
    interval: Duration,
    shutdown: CancellationToken,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut wakes = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                wakes += 1;
                let result = handler.on_wake().await;
                debug!(wakes, ?result, "Periodic wake");
            }
        }
    }

    info!(wakes, "Periodic background scheduler stopped");
    wakes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        wakes: AtomicUsize,
    }

    #[async_trait]
    impl WakeHandler for CountingHandler {
        async fn on_wake(&self) -> WorkResult {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            WorkResult::NoData
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_periodic_until_shutdown() {
        let handler = Arc::new(CountingHandler {
            wakes: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_periodic(
            handler.clone(),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        // First tick fires immediately, then one per interval
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        let wakes = task.await.unwrap();

        assert_eq!(wakes, 3);
        assert_eq!(handler.wakes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_work_result_serialization() {
        assert_eq!(
            serde_json::to_string(&WorkResult::NewData).unwrap(),
            "\"newData\""
        );
    }
}
