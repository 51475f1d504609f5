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


//! Page image fetching
//!
//! The image cache fetches bytes through the [`PageFetcher`] trait so tests and
//! hosts can substitute their own transport. [`HttpPageFetcher`] is the
//! reqwest implementation.
//!
//! # Error Classification
//! - Timeouts, connection failures, 5xx, 408, 429 → `TransientNetwork`
//! - Other 4xx, malformed URLs → `PermanentContent`

use crate::error::{PanelSyncError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;

/// Fetches the raw bytes of a page image
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP page fetcher
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,

    /// Headers sent with every request (e.g. Referer required by image hosts)
    request_headers: HashMap<String, String>,
}

impl HttpPageFetcher {
    /// Create a fetcher with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            request_headers: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, request_headers: HashMap<String, String>) -> Self {
        self.request_headers = request_headers;
        self
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        for (key, value) in &self.request_headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(e, url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PanelSyncError::from_status(status.as_u16(), url));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(e, url))?;

        Ok(bytes.to_vec())
    }
}

/// Map a reqwest failure onto the retry taxonomy
pub fn classify_request_error(err: reqwest::Error, url: &str) -> PanelSyncError {
    if let Some(status) = err.status() {
        return PanelSyncError::from_status(status.as_u16(), url);
    }

    if err.is_builder() {
        return PanelSyncError::permanent(format!("Invalid request for {}: {}", url, err), None);
    }

    // Timeouts, connect failures, truncated bodies
    PanelSyncError::transient(format!("Request to {} failed: {}", url, err), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_malformed_url_is_permanent() {
        let fetcher = HttpPageFetcher::new(Duration::from_secs(1)).unwrap();
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(!err.is_retryable(), "unexpected classification: {:?}", err);
    }
}
