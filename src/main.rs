//! newswatch binary entrypoint.
//! Wires the store, cache, judge, fetch cascade and engines together,
//! then runs the scheduler and worker pool until interrupted.

use std::sync::Arc;
use std::time::Duration;

use newswatch::cache::MemoryCache;
use newswatch::config::AppConfig;
use newswatch::dedup::DedupEngine;
use newswatch::extract::SelectorExtractor;
use newswatch::feed::{FeedClient, FeedFetcher};
use newswatch::fetch::{browser::BrowserDriver, client::HttpFetcher, FetchPipeline};
use newswatch::jobs::scheduler::{spawn_housekeeping, spawn_scheduler, spawn_watch_sweep};
use newswatch::jobs::worker::{spawn_workers, CrawlContext};
use newswatch::jobs::JobQueue;
use newswatch::judge::build_judge;
use newswatch::store::MemoryStore;
use newswatch::watch::WatchEngine;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newswatch=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op where unset.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default()?;
    tracing::info!(workers = cfg.crawl.worker_count, "starting newswatch");

    let store = MemoryStore::shared();
    let cache = MemoryCache::shared();
    let judge = build_judge(&cfg.judge);

    let browser = Arc::new(BrowserDriver::new(
        Duration::from_secs(cfg.crawl.navigation_timeout_secs),
        Duration::from_millis(cfg.crawl.settle_delay_ms),
    ));
    let fetch = Arc::new(FetchPipeline::new(
        Arc::clone(&cache),
        HttpFetcher::new(Duration::from_secs(cfg.crawl.http_timeout_secs)),
        Arc::clone(&browser),
        Duration::from_secs(cfg.crawl.html_cache_ttl_secs),
    ));
    let extractor = Arc::new(SelectorExtractor::new(
        Arc::clone(&fetch),
        Arc::clone(&cache),
        Arc::clone(&judge),
        cfg.crawl.ai_extraction_fallback,
    ));
    let feed: Arc<dyn FeedFetcher> = Arc::new(FeedClient::new(Duration::from_secs(
        cfg.crawl.feed_timeout_secs,
    )));
    let dedup = Arc::new(DedupEngine::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&judge),
        cfg.dedup.clone(),
    ));
    let watch = Arc::new(WatchEngine::new(
        Arc::clone(&store),
        Arc::clone(&judge),
        cfg.watch.clone(),
    ));

    let (queue, rx) = JobQueue::new();
    let ctx = Arc::new(CrawlContext {
        store: Arc::clone(&store),
        fetch,
        extractor,
        feed,
        dedup,
        watch: Arc::clone(&watch),
        cfg: cfg.clone(),
    });

    let _workers = spawn_workers(Arc::clone(&ctx), queue.clone(), rx);
    let _scheduler = spawn_scheduler(
        Arc::clone(&store),
        queue.clone(),
        Duration::from_secs(cfg.crawl.schedule_interval_secs),
    );
    let _housekeeping = spawn_housekeeping(Arc::clone(&store), cfg.retention.clone());
    let _sweep = spawn_watch_sweep(watch, Duration::from_secs(300));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    browser.shutdown().await;
    Ok(())
}
