// tests/orchestrator.rs
//! Feed-job orchestration semantics: 304 is a success that leaves stored
//! validators alone, 200 overwrites them, and re-running the same feed is
//! idempotent at the article level.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use newswatch::cache::MemoryCache;
use newswatch::config::AppConfig;
use newswatch::dedup::DedupEngine;
use newswatch::extract::SelectorExtractor;
use newswatch::feed::{FeedFetch, FeedFetcher};
use newswatch::fetch::{browser::BrowserDriver, client::HttpFetcher, FetchPipeline};
use newswatch::jobs::scheduler::enqueue_manual;
use newswatch::jobs::worker::{run_job, CrawlContext};
use newswatch::jobs::{JobPayload, JobQueue};
use newswatch::judge::DisabledJudge;
use newswatch::model::{
    ExtractedArticle, FeedConfig, Owner, Source, SourceKind, SourceStatus, TriggerReason,
};
use newswatch::store::{MemoryStore, Store};
use newswatch::watch::WatchEngine;

/// Scripted feed transport; records the validators it was handed.
struct StubFeed {
    response: Mutex<Option<FeedFetch>>,
    seen_etag: Mutex<Option<String>>,
}

impl StubFeed {
    fn returning(response: FeedFetch) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Some(response)),
            seen_etag: Mutex::new(None),
        })
    }
}

#[async_trait]
impl FeedFetcher for StubFeed {
    async fn fetch(
        &self,
        _feed_url: &str,
        last_etag: Option<&str>,
        _last_modified: Option<&str>,
    ) -> anyhow::Result<FeedFetch> {
        *self.seen_etag.lock().await = last_etag.map(|s| s.to_string());
        self.response
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("stub exhausted"))
    }
}

fn feed_source() -> Source {
    Source {
        id: 0,
        name: "feed".into(),
        url: "https://haber.example".into(),
        kind: SourceKind::Feed,
        owner: Owner::System,
        refresh_interval_secs: 300,
        selectors: None,
        feed: Some(FeedConfig {
            feed_url: "https://haber.example/rss".into(),
            enrich_content: false,
            content_selector: None,
            last_etag: Some("etag-1".into()),
            last_modified: Some("Mon, 03 Aug 2026 09:00:00 GMT".into()),
        }),
        status: SourceStatus::Active,
        health: Default::default(),
    }
}

fn context(store: Arc<MemoryStore>, feed: Arc<dyn FeedFetcher>) -> CrawlContext {
    let cfg = AppConfig::default();
    let cache = MemoryCache::shared();
    let judge = Arc::new(DisabledJudge);
    let browser = Arc::new(BrowserDriver::new(
        Duration::from_secs(5),
        Duration::from_millis(10),
    ));
    let fetch = Arc::new(FetchPipeline::new(
        Arc::clone(&cache),
        HttpFetcher::new(Duration::from_secs(5)),
        browser,
        Duration::from_secs(60),
    ));
    CrawlContext {
        store: store.clone(),
        fetch: Arc::clone(&fetch),
        extractor: Arc::new(SelectorExtractor::new(
            fetch,
            Arc::clone(&cache),
            judge.clone(),
            false,
        )),
        feed,
        dedup: Arc::new(DedupEngine::new(
            store.clone(),
            cache,
            judge.clone(),
            cfg.dedup.clone(),
        )),
        watch: Arc::new(WatchEngine::new(store, judge, cfg.watch.clone())),
        cfg,
    }
}

fn feed_item(url: &str) -> ExtractedArticle {
    ExtractedArticle {
        title: "Gündem maddesi".into(),
        url: url.into(),
        content: "yeterince uzun olmayan metin".into(),
        summary: "özet".into(),
        partial: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn not_modified_is_success_and_keeps_validators() {
    let store = Arc::new(MemoryStore::new());
    let sid = store.add_source(feed_source()).await;
    let stub = StubFeed::returning(FeedFetch::NotModified);
    let ctx = context(store.clone(), stub.clone());

    let source = store.source(sid).await.unwrap().unwrap();
    let payload = JobPayload::for_source(&source, TriggerReason::Manual);
    let result = run_job(&ctx, &payload).await.unwrap();

    assert_eq!(result.items_found, 0);
    assert_eq!(result.items_inserted, 0);
    assert!(result.errors.is_empty());

    // conditional headers were sent, stored validators stayed put
    assert_eq!(stub.seen_etag.lock().await.as_deref(), Some("etag-1"));
    let source = store.source(sid).await.unwrap().unwrap();
    let feed = source.feed.unwrap();
    assert_eq!(feed.last_etag.as_deref(), Some("etag-1"));
    assert_eq!(
        feed.last_modified.as_deref(),
        Some("Mon, 03 Aug 2026 09:00:00 GMT")
    );
}

#[tokio::test]
async fn fresh_fetch_overwrites_validators_and_inserts_items() {
    let store = Arc::new(MemoryStore::new());
    let sid = store.add_source(feed_source()).await;
    let stub = StubFeed::returning(FeedFetch::Fetched {
        items: vec![
            feed_item("https://haber.example/a"),
            feed_item("https://haber.example/b"),
        ],
        etag: Some("etag-2".into()),
        last_modified: None,
    });
    let ctx = context(store.clone(), stub);

    let source = store.source(sid).await.unwrap().unwrap();
    let payload = JobPayload::for_source(&source, TriggerReason::Scheduled);
    let result = run_job(&ctx, &payload).await.unwrap();

    assert_eq!(result.items_found, 2);
    assert_eq!(result.items_inserted, 2);
    assert_eq!(store.article_count().await, 2);

    // a 200 always overwrites both validators
    let feed = store.source(sid).await.unwrap().unwrap().feed.unwrap();
    assert_eq!(feed.last_etag.as_deref(), Some("etag-2"));
    assert_eq!(feed.last_modified, None);
}

#[tokio::test]
async fn manual_trigger_creates_an_audit_row_and_queues_the_job() {
    let store = Arc::new(MemoryStore::new());
    let sid = store.add_source(feed_source()).await;
    let (queue, mut rx) = JobQueue::new();

    let shared: newswatch::store::SharedStore = store.clone();
    let audit_id = enqueue_manual(&shared, &queue, sid).await.unwrap();

    let queued = rx.recv().await.expect("job queued");
    assert_eq!(queued.audit_id, audit_id);
    assert_eq!(queued.payload.source_id, sid);
    assert_eq!(queued.payload.triggered_by, TriggerReason::Manual);
    assert_eq!(
        queued.payload.last_etag.as_deref(),
        Some("etag-1"),
        "payload carries the stored validators"
    );

    let job = store.job(audit_id).await.expect("audit row");
    assert_eq!(job.status, newswatch::model::JobStatus::Pending);
}

#[tokio::test]
async fn rerunning_the_same_feed_inserts_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    let sid = store.add_source(feed_source()).await;
    let source = store.source(sid).await.unwrap().unwrap();

    let first = context(
        store.clone(),
        StubFeed::returning(FeedFetch::Fetched {
            items: vec![feed_item("https://haber.example/a")],
            etag: None,
            last_modified: None,
        }),
    );
    let payload = JobPayload::for_source(&source, TriggerReason::Manual);
    let r1 = run_job(&first, &payload).await.unwrap();
    assert_eq!(r1.items_inserted, 1);

    let second = context(
        store.clone(),
        StubFeed::returning(FeedFetch::Fetched {
            items: vec![feed_item("https://haber.example/a")],
            etag: None,
            last_modified: None,
        }),
    );
    let r2 = run_job(&second, &payload).await.unwrap();
    assert_eq!(r2.items_found, 1);
    assert_eq!(r2.items_inserted, 0, "same (source, url) must not insert twice");
    assert_eq!(store.article_count().await, 1);
}
