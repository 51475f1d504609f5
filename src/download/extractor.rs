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


//! Content extractor boundary
//!
//! Resolves a chapter's page-list source into an ordered list of page image
//! URLs. Implementations have no side effects and classify their failures as
//! `Extraction { permanent }`.
//!
//! # Manifest Format
//! [`ManifestExtractor`] reads a JSON manifest from a local file or an http(s)
//! URL. Accepted shapes:
//! - `["https://…/1.jpg", "https://…/2.jpg"]`
//! - `{"pages": ["https://…/1.jpg", …]}`
//! - `{"pages": [{"pageNumber": 1, "url": "https://…/1.jpg"}, …]}`
//!
//! Relative page URLs are resolved against an http(s) manifest URL.

use crate::cache::fetcher::classify_request_error;
use crate::download::job::ChapterRef;
use crate::error::{PanelSyncError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// One page of a resolved chapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    /// 1-based
    pub page_number: u32,
    pub url: String,
}

impl PageRef {
    pub fn new(page_number: u32, url: impl Into<String>) -> Self {
        Self {
            page_number,
            url: url.into(),
        }
    }
}

/// Resolves page lists for chapters
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn resolve_pages(&self, chapter: &ChapterRef) -> Result<Vec<PageRef>>;
}

/// Sort by page number and reject empty lists, page 0 and duplicates
pub fn normalize_pages(mut pages: Vec<PageRef>) -> Result<Vec<PageRef>> {
    if pages.is_empty() {
        return Err(PanelSyncError::extraction("Chapter has no pages", true));
    }

    pages.sort_by_key(|p| p.page_number);

    let mut seen = HashSet::new();
    for page in &pages {
        if page.page_number == 0 {
            return Err(PanelSyncError::extraction("Page numbers start at 1", true));
        }
        if !seen.insert(page.page_number) {
            return Err(PanelSyncError::extraction(
                format!("Duplicate page number {}", page.page_number),
                true,
            ));
        }
    }

    Ok(pages)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    Urls(Vec<ManifestPage>),
    Object { pages: Vec<ManifestPage> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestPage {
    Numbered {
        #[serde(alias = "pageNumber")]
        page_number: u32,
        url: String,
    },
    Url(String),
}

/// Extractor reading JSON page manifests
#[derive(Debug, Clone)]
pub struct ManifestExtractor {
    client: Client,
}

impl ManifestExtractor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn read_source(&self, source: &str) -> Result<(String, Option<Url>)> {
        match Url::parse(source) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                let body = self.fetch_manifest(&url).await?;
                Ok((body, Some(url)))
            }
            Ok(url) if url.scheme() == "file" => {
                let path = url.to_file_path().map_err(|_| {
                    PanelSyncError::extraction(format!("Invalid file URL: {}", source), true)
                })?;
                Ok((read_manifest_file(&path).await?, None))
            }
            _ => Ok((read_manifest_file(Path::new(source)).await?, None)),
        }
    }

    async fn fetch_manifest(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| as_extraction(classify_request_error(e, url.as_str())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(as_extraction(PanelSyncError::from_status(
                status.as_u16(),
                url.as_str(),
            )));
        }

        response
            .text()
            .await
            .map_err(|e| as_extraction(classify_request_error(e, url.as_str())))
    }
}

#[async_trait]
impl ContentExtractor for ManifestExtractor {
    async fn resolve_pages(&self, chapter: &ChapterRef) -> Result<Vec<PageRef>> {
        let (body, base) = self.read_source(&chapter.page_list_source).await?;
        let pages = parse_manifest(&body, base.as_ref())?;
        debug!(chapter = %chapter.key, pages = pages.len(), "Resolved page list");
        Ok(pages)
    }
}

/// Parse manifest JSON into a normalized page list
pub fn parse_manifest(body: &str, base: Option<&Url>) -> Result<Vec<PageRef>> {
    let manifest: Manifest = serde_json::from_str(body)
        .map_err(|e| PanelSyncError::extraction(format!("Malformed page manifest: {}", e), true))?;

    let entries = match manifest {
        Manifest::Urls(pages) | Manifest::Object { pages } => pages,
    };

    let pages = entries
        .into_iter()
        .enumerate()
        .map(|(index, page)| {
            let (page_number, raw_url) = match page {
                ManifestPage::Numbered { page_number, url } => (page_number, url),
                ManifestPage::Url(url) => (index as u32 + 1, url),
            };
            Ok(PageRef::new(page_number, resolve_url(&raw_url, base)?))
        })
        .collect::<Result<Vec<_>>>()?;

    normalize_pages(pages)
}

fn resolve_url(raw: &str, base: Option<&Url>) -> Result<String> {
    let resolved = match base {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    };
    resolved
        .map(|u| u.to_string())
        .map_err(|e| PanelSyncError::extraction(format!("Invalid page URL {:?}: {}", raw, e), true))
}

async fn read_manifest_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        PanelSyncError::extraction(
            format!("Cannot read page manifest {}: {}", path.display(), e),
            e.kind() != std::io::ErrorKind::Interrupted,
        )
    })
}

/// Network failures keep their retryability as extraction failures
fn as_extraction(err: PanelSyncError) -> PanelSyncError {
    let permanent = !err.is_retryable();
    PanelSyncError::extraction(err.to_string(), permanent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::job::ChapterKey;

    #[test]
    fn test_parse_url_list_numbers_in_order() {
        let pages = parse_manifest(r#"["https://cdn/a.jpg", "https://cdn/b.jpg"]"#, None).unwrap();
        assert_eq!(pages[0], PageRef::new(1, "https://cdn/a.jpg"));
        assert_eq!(pages[1].page_number, 2);
    }

    #[test]
    fn test_parse_numbered_pages_sorted() {
        let body = r#"{"pages": [
            {"pageNumber": 2, "url": "https://cdn/2.jpg"},
            {"page_number": 1, "url": "https://cdn/1.jpg"}
        ]}"#;
        let pages = parse_manifest(body, None).unwrap();
        assert_eq!(pages[0].url, "https://cdn/1.jpg");
        assert_eq!(pages[1].url, "https://cdn/2.jpg");
    }

    #[test]
    fn test_relative_urls_resolved_against_manifest() {
        let base = Url::parse("https://cdn.example/m1/c1/manifest.json").unwrap();
        let pages = parse_manifest(r#"{"pages": ["001.jpg"]}"#, Some(&base)).unwrap();
        assert_eq!(pages[0].url, "https://cdn.example/m1/c1/001.jpg");
    }

    #[test]
    fn test_invalid_manifests_are_permanent() {
        for body in ["not json", "[]", r#"["relative.jpg"]"#] {
            let err = parse_manifest(body, None).unwrap_err();
            assert!(!err.is_retryable(), "{} should be permanent", body);
        }

        let duplicate = r#"{"pages": [
            {"pageNumber": 1, "url": "https://cdn/1.jpg"},
            {"pageNumber": 1, "url": "https://cdn/1b.jpg"}
        ]}"#;
        assert!(parse_manifest(duplicate, None).is_err());
    }

    #[tokio::test]
    async fn test_resolve_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("c1.json");
        std::fs::write(&manifest, r#"["https://cdn/1.jpg","https://cdn/2.jpg"]"#).unwrap();

        let extractor = ManifestExtractor::new(Duration::from_secs(5)).unwrap();
        let chapter = ChapterRef::new(
            ChapterKey::new("m1", "c1").unwrap(),
            manifest.to_string_lossy(),
        );
        let pages = extractor.resolve_pages(&chapter).await.unwrap();
        assert_eq!(pages.len(), 2);

        let missing = ChapterRef::new(
            ChapterKey::new("m1", "c2").unwrap(),
            dir.path().join("absent.json").to_string_lossy(),
        );
        assert!(extractor.resolve_pages(&missing).await.is_err());
    }
}
