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


use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use panelsync_core::cache::CacheDomain;
use panelsync_core::download::{ChapterKey, ChapterRef, ListenerScope};
use panelsync_core::reader::{render_markup, ChapterContent};
use panelsync_core::validation::ValidationOptions;
use panelsync_core::{logging, CoreConfig, PanelSync};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "panelsync-cli")]
#[command(about = "PanelSync CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DomainArg {
    Preview,
    Download,
    All,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a chapter from a page manifest and wait for it
    Download {
        /// Content (series) id
        #[arg(long)]
        content: String,
        /// Chapter id
        #[arg(long)]
        chapter: String,
        /// Page manifest (file path or http(s) URL)
        #[arg(long)]
        source: String,
        /// Queue priority (higher runs first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Show the persisted download queue
    QueueStatus,
    /// Check a downloaded chapter's files
    Validate {
        #[arg(long)]
        content: String,
        #[arg(long)]
        chapter: String,
        /// Skip content sampling
        #[arg(long)]
        shallow: bool,
        /// Act on the recommendation
        #[arg(long)]
        repair: bool,
    },
    /// Read a chapter from the cache
    Read {
        #[arg(long)]
        content: String,
        #[arg(long)]
        chapter: String,
        /// Write reader markup to this file
        #[arg(long)]
        html: Option<PathBuf>,
    },
    /// Show cache statistics
    Stats,
    /// Remove cached images
    ClearCache {
        #[arg(long, value_enum, default_value_t = DomainArg::Preview)]
        domain: DomainArg,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.database_path = data_dir.join("panelsync.db");
        config.data_dir = data_dir;
    }
    logging::init(&config.log_filter);

    let core = PanelSync::open(config)
        .await
        .context("Failed to open PanelSync core")?;

    let result = run(&core, cli.command).await;
    core.shutdown().await?;
    result
}

async fn run(core: &PanelSync, command: Commands) -> Result<()> {
    match command {
        Commands::Download {
            content,
            chapter,
            source,
            priority,
        } => {
            let key = ChapterKey::new(content, chapter)?;
            let (subscription, mut events) = core
                .events
                .subscribe_channel(ListenerScope::Chapter(key.clone()));

            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    println!("{}", event.progress.display_string());
                    if event.progress.status.is_terminal() {
                        break;
                    }
                }
            });

            let item = core
                .queue
                .enqueue(ChapterRef::new(key.clone(), source), priority)
                .await?;
            println!("Queued {} ({})", key, item.id);

            core.queue.process_queue().await;
            core.queue.wait_until_idle().await;
            subscription.unsubscribe();
            let _ = printer.await;

            let failed = core.manager.failed_pages(&key);
            if !failed.is_empty() {
                println!("Failed pages: {:?}", failed);
            }
            if core.manager.is_chapter_downloaded(&key).await? {
                println!("✓ {} available offline", key);
            }
        }
        Commands::QueueStatus => {
            let snapshot = core.queue.snapshot();
            println!("Paused: {}", snapshot.paused);
            println!("Active: {}", snapshot.active.len());
            for item in &snapshot.active {
                println!("  {} (retries {})", item.chapter.key, item.retry_count);
            }
            println!("Queued: {}", snapshot.queued.len());
            for item in &snapshot.queued {
                println!("  {} priority {}", item.chapter.key, item.priority);
            }
            println!("Failed: {}", snapshot.failed.len());
            for job in &snapshot.failed {
                println!("  {}: {}", job.item.chapter.key, job.error);
            }
        }
        Commands::Validate {
            content,
            chapter,
            shallow,
            repair,
        } => {
            if repair {
                let report = core.validator.repair_chapter(&content, &chapter).await?;
                println!("Action: {}", report.action.as_str());
                if report.requires_download() {
                    println!("Pages reset: {:?}", report.pages_reset);
                }
                return Ok(());
            }

            let options = ValidationOptions {
                deep_scan: !shallow,
                force_refresh: true,
            };
            let result = core
                .validator
                .validate_chapter_integrity(&content, &chapter, options)
                .await?;
            println!(
                "Integrity: {:.1}% ({} valid, {} corrupted, {} missing of {})",
                result.integrity_score,
                result.valid_images,
                result.corrupted_images,
                result.missing_images,
                result.total_images
            );
            for issue in &result.issues {
                println!("  page {}: {:?}", issue.page_number, issue.issue);
            }
            println!("Recommended action: {}", result.recommended_action.as_str());
        }
        Commands::Read {
            content,
            chapter,
            html,
        } => match core.reader.get_chapter_content(&content, &chapter).await? {
            ChapterContent::Offline(offline) => {
                println!("{} pages available offline", offline.pages.len());
                if let Some(path) = html {
                    let markup = render_markup(&content, &chapter, &offline.pages);
                    std::fs::write(&path, markup)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Markup written to {}", path.display());
                }
            }
            ChapterContent::NotOffline(reason) => println!("Not available offline: {:?}", reason),
        },
        Commands::Stats => {
            let stats = core.cache.get_cache_stats();
            println!("Files: {}", stats.file_count);
            println!("Total size: {:.1} MB", stats.total_size_bytes as f64 / 1_000_000.0);
            println!(
                "Preview entries: {} ({:.1} MB)",
                stats.preview_entries,
                stats.preview_size_bytes as f64 / 1_000_000.0
            );
            println!(
                "Download entries: {} ({:.1} MB)",
                stats.download_entries,
                stats.download_size_bytes as f64 / 1_000_000.0
            );
        }
        Commands::ClearCache { domain } => {
            let domains: &[CacheDomain] = match domain {
                DomainArg::Preview => &[CacheDomain::Preview],
                DomainArg::Download => &[CacheDomain::Download],
                DomainArg::All => &[CacheDomain::Preview, CacheDomain::Download],
            };
            for domain in domains {
                let removed = core.cache.clear_domain(*domain).await;
                println!("Removed {} {} entries", removed, domain);
            }
        }
    }

    Ok(())
}
