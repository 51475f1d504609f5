//! Integration tests for cached pages after a download
//!
//! Covers cache eviction and its effect on chapter records, integrity
//! validation with repair, and offline reads of downloaded chapters, both
//! cache-only and blended with a live page list.

mod common;

use common::*;
use panelsync_core::cache::{CacheDomain, ImageCache};
use panelsync_core::config::CachePolicy;
use panelsync_core::download::{ChapterKey, DownloadOutcome};
use panelsync_core::reader::{render_markup, ChapterContent, NotOfflineReason, PageSource};
use panelsync_core::storage::{Database, KeyValueStore, SqliteStore};
use panelsync_core::validation::{PageIssue, ValidationOptions};
use panelsync_core::{DownloadSettings, PanelSync, RecommendedAction};
use std::path::Path;
use std::sync::Arc;

async fn downloaded(dir: &Path, chapter_id: &str, pages: u32) -> (PanelSync, Arc<FakeFetcher>, ChapterKey) {
    let fetcher = FakeFetcher::new();
    let extractor = StaticExtractor::new();
    let k = key("m1", chapter_id);
    extractor.add(&k, pages);

    let core = open_core(dir, DownloadSettings::default(), fetcher.clone(), extractor).await;
    let outcome = core.manager.start_download(&chapter("m1", chapter_id)).await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed { .. }));
    (core, fetcher, k)
}

#[tokio::test]
async fn test_capacity_three_evicts_least_recently_used_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new_in_memory().await.unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(db.pool().clone()));
    let policy = CachePolicy {
        download_capacity: 3,
        base_delay_ms: 1,
        ..Default::default()
    };
    let cache = ImageCache::open(dir.path().join("cache"), policy, store, FakeFetcher::new())
        .await
        .unwrap();

    let owners: Vec<ChapterKey> = ["a", "b", "c", "d"].iter().map(|c| key("m1", c)).collect();
    let urls: Vec<String> = owners.iter().map(|k| page_url(k, 1)).collect();

    let mut paths = Vec::new();
    for (owner, url) in owners.iter().zip(&urls).take(3) {
        let resolved = cache
            .resolve_image(url, CacheDomain::Download, &owner.owner_key())
            .await;
        assert!(resolved.is_local());
        paths.push(resolved.location);
    }

    // Reading "a" leaves "b" as the oldest entry
    cache
        .resolve_image(&urls[0], CacheDomain::Download, &owners[0].owner_key())
        .await;
    cache
        .resolve_image(&urls[3], CacheDomain::Download, &owners[3].owner_key())
        .await;

    assert!(!cache.contains(&urls[1], CacheDomain::Download, &owners[1].owner_key()));
    assert!(!Path::new(&paths[1]).exists());
    for i in [0, 2, 3] {
        assert!(cache.contains(&urls[i], CacheDomain::Download, &owners[i].owner_key()));
    }
    assert!(Path::new(&paths[0]).exists());
    assert_eq!(cache.get_download_cache_stats(None).entries, 3);
}

#[tokio::test]
async fn test_eviction_during_concurrent_downloads_updates_records() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = StaticExtractor::new();
    let chapter_keys = [key("m1", "a"), key("m1", "b")];
    for k in &chapter_keys {
        extractor.add(k, 3);
    }
    let policy = CachePolicy {
        download_capacity: 1,
        base_delay_ms: 1,
        ..Default::default()
    };
    let core = open_core_with_cache(
        dir.path(),
        DownloadSettings::default(),
        policy,
        FakeFetcher::new(),
        extractor,
    )
    .await;

    for k in &chapter_keys {
        core.queue
            .enqueue(chapter(&k.content_id, &k.chapter_id), 0)
            .await
            .unwrap();
    }
    tokio::time::timeout(std::time::Duration::from_secs(5), core.queue.wait_until_idle())
        .await
        .unwrap();

    let mut downloaded = 0;
    for k in &chapter_keys {
        let listed = core.manager.is_chapter_downloaded(k).await.unwrap();
        let content = core.reader.get_chapter_content("m1", &k.chapter_id).await.unwrap();
        assert_eq!(listed, content.is_offline(), "chapter {} disagrees: {:?}", k, content);
        if listed {
            downloaded += 1;
        } else {
            let record = core.manager.chapter_record(k).await.unwrap().unwrap();
            assert!(!record.completed);
            assert!(record.images.iter().all(|i| i.local_path.is_none()));
        }
    }
    assert_eq!(downloaded, 1);
    assert_eq!(core.manager.cache().get_download_cache_stats(None).entries, 1);
}

#[tokio::test]
async fn test_validation_follows_redownload_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::new();
    let extractor = StaticExtractor::new();
    let k = key("m1", "c1");
    let pages = extractor.add(&k, 3);
    for page in &pages {
        fetcher.fail(&page.url, 503);
    }
    let core = open_core(dir.path(), DownloadSettings::default(), fetcher.clone(), extractor).await;

    let outcome = core.manager.start_download(&chapter("m1", "c1")).await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Failed { .. }));
    let options = ValidationOptions::default();
    let broken = core
        .validator
        .validate_chapter_integrity("m1", "c1", options)
        .await
        .unwrap();
    assert_eq!(broken.integrity_score, 0.0);
    assert_eq!(broken.recommended_action, RecommendedAction::RedownloadAll);

    for page in &pages {
        fetcher.heal(&page.url);
    }
    let outcome = core.manager.start_download(&chapter("m1", "c1")).await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed { pages: 3, .. }));

    // No forced refresh: the new record alone retires the earlier result
    let healthy = core
        .validator
        .validate_chapter_integrity("m1", "c1", options)
        .await
        .unwrap();
    assert_eq!(healthy.integrity_score, 100.0);
    assert!(healthy.is_healthy());

    assert!(core.manager.remove_chapter(&k).await.unwrap());
    let removed = core
        .validator
        .validate_chapter_integrity("m1", "c1", options)
        .await
        .unwrap();
    assert_eq!(removed.total_images, 0);
    assert_eq!(removed.recommended_action, RecommendedAction::RedownloadAll);
}

#[tokio::test]
async fn test_downloaded_chapter_reads_offline() {
    let dir = tempfile::tempdir().unwrap();
    let (core, _fetcher, k) = downloaded(dir.path(), "c1", 4).await;

    let content = core.reader.get_chapter_content("m1", "c1").await.unwrap();
    let ChapterContent::Offline(offline) = content else {
        panic!("chapter should be offline");
    };
    let numbers: Vec<u32> = offline.pages.iter().map(|p| p.page_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(offline.pages.iter().all(|p| p.source == PageSource::Local));

    let markup = render_markup("m1", "c1", &offline.pages);
    assert_eq!(markup.matches(r#"data-source="local""#).count(), 4);
    assert!(core.reader.is_available_offline("m1", "c1").await.unwrap());

    let never = core.reader.get_chapter_content("m1", "c9").await.unwrap();
    assert_eq!(never, ChapterContent::NotOffline(NotOfflineReason::NotDownloaded));

    // A vanished file takes the chapter offline-unavailable
    let record = core.manager.chapter_record(&k).await.unwrap().unwrap();
    std::fs::remove_file(record.images[2].local_path.as_deref().unwrap()).unwrap();
    let content = core.reader.get_chapter_content("m1", "c1").await.unwrap();
    assert_eq!(
        content,
        ChapterContent::NotOffline(NotOfflineReason::FilesMissing {
            missing_pages: vec![3]
        })
    );
}

#[tokio::test]
async fn test_blended_content_prefers_cache_and_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let (core, _fetcher, k) = downloaded(dir.path(), "c1", 3).await;

    // The live list has grown by two pages since the download
    let network = pages_for(&k, 5);
    let first = core
        .reader
        .get_blended_chapter_content("m1", "c1", &network)
        .await
        .unwrap();
    let second = core
        .reader
        .get_blended_chapter_content("m1", "c1", &network)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.pages.len(), 5);
    assert_eq!(first.local_count(), 3);
    assert_eq!(first.missing_pages, vec![4, 5]);
    assert_eq!(first.pages[3].source, PageSource::Remote);
    assert_eq!(first.pages[3].url, network[3].url);
}

#[tokio::test]
async fn test_one_empty_page_in_ten_is_repaired_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (core, fetcher, k) = downloaded(dir.path(), "c1", 10).await;
    assert_eq!(fetcher.calls(), 10);

    let record = core.manager.chapter_record(&k).await.unwrap().unwrap();
    let broken = record.images[6].local_path.clone().unwrap();
    std::fs::write(&broken, b"").unwrap();

    let options = ValidationOptions {
        deep_scan: true,
        force_refresh: true,
    };
    let result = core
        .validator
        .validate_chapter_integrity("m1", "c1", options)
        .await
        .unwrap();
    assert_eq!(result.total_images, 10);
    assert_eq!(result.valid_images, 9);
    assert_eq!(result.integrity_score, 90.0);
    assert_eq!(result.recommended_action, RecommendedAction::RedownloadCorrupted);
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].page_number, 7);
    assert_eq!(result.issues[0].issue, PageIssue::TooSmall { size: 0 });

    let report = core.validator.repair_chapter("m1", "c1").await.unwrap();
    assert_eq!(report.pages_reset, vec![7]);
    assert!(!core.manager.is_chapter_downloaded(&k).await.unwrap());

    // Only the repaired page is fetched again
    core.queue.enqueue(chapter("m1", "c1"), 0).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), core.queue.wait_until_idle())
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 11);
    assert!(core.manager.is_chapter_downloaded(&k).await.unwrap());

    let healthy = core
        .validator
        .validate_chapter_integrity("m1", "c1", options)
        .await
        .unwrap();
    assert_eq!(healthy.integrity_score, 100.0);
    assert!(healthy.is_healthy());
    assert!(core.reader.get_chapter_content("m1", "c1").await.unwrap().is_offline());
}
