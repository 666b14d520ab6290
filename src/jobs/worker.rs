// src/jobs/worker.rs
//! The bounded worker pool. Each worker pulls one job at a time and runs
//! it to completion: fetch, extract, persist, dedup-check, watch-check,
//! health bookkeeping. Transient failures are retried with exponential
//! backoff; nothing here ever takes the worker task down.

use super::{JobPayload, JobQueue, JobResult, QueuedJob};
use crate::config::AppConfig;
use crate::dedup::DedupEngine;
use crate::extract::{extract_with_selector, SelectorExtractor};
use crate::feed::{FeedFetch, FeedFetcher};
use crate::fetch::{FetchError, FetchPipeline};
use crate::model::{Article, JobStatus, SourceKind, TriggerReason};
use crate::store::{CrawlOutcome, InsertOutcome, SharedStore};
use crate::watch::WatchEngine;
use anyhow::{anyhow, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("crawl_jobs_total", "Crawl jobs processed.");
        describe_counter!("crawl_jobs_failed_total", "Crawl jobs that ended FAILED.");
        describe_counter!("crawl_items_inserted_total", "Articles inserted by crawl jobs.");
        describe_counter!(
            "crawl_items_duplicate_total",
            "Articles discarded as same-source duplicates."
        );
        describe_histogram!("crawl_job_ms", "Crawl job duration in milliseconds.");
    });
}

/// Everything a worker needs to execute a job.
pub struct CrawlContext {
    pub store: SharedStore,
    pub fetch: Arc<FetchPipeline>,
    pub extractor: Arc<SelectorExtractor>,
    pub feed: Arc<dyn FeedFetcher>,
    pub dedup: Arc<DedupEngine>,
    pub watch: Arc<WatchEngine>,
    pub cfg: AppConfig,
}

/// Spawn the worker pool over the shared queue receiver.
pub fn spawn_workers(
    ctx: Arc<CrawlContext>,
    queue: JobQueue,
    rx: mpsc::UnboundedReceiver<QueuedJob>,
) -> Vec<JoinHandle<()>> {
    ensure_metrics_described();
    let rx = Arc::new(Mutex::new(rx));
    (0..ctx.cfg.crawl.worker_count)
        .map(|worker_id| {
            let ctx = Arc::clone(&ctx);
            let queue = queue.clone();
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else {
                        break; // queue closed, shut the worker down
                    };
                    let scheduled = job.payload.triggered_by == TriggerReason::Scheduled;
                    process_job(&ctx, job).await;
                    if scheduled {
                        // only now does it stop counting as in flight
                        queue.scheduled_in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                info!(target: "jobs", worker_id, "worker stopped");
            })
        })
        .collect()
}

/// Run one job through the retry policy and record audit + health state.
async fn process_job(ctx: &CrawlContext, job: QueuedJob) {
    let QueuedJob { payload, audit_id } = job;
    counter!("crawl_jobs_total").increment(1);
    if let Err(e) = ctx.store.job_running(audit_id).await {
        warn!(target: "jobs", error = ?e, "could not mark job running");
    }

    let started = Instant::now();
    let mut attempt = 1u32;
    let outcome = loop {
        match run_job(ctx, &payload).await {
            Ok(result) => break Ok(result),
            Err(e) => {
                let transient = e
                    .downcast_ref::<FetchError>()
                    .map(FetchError::is_transient)
                    .unwrap_or(false);
                if transient && attempt < ctx.cfg.crawl.job_attempts {
                    let backoff = Duration::from_secs(
                        ctx.cfg.crawl.retry_base_secs * 2u64.pow(attempt - 1),
                    );
                    warn!(
                        target: "jobs",
                        source = payload.source_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "transient job failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    continue;
                }
                break Err(e);
            }
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;
    histogram!("crawl_job_ms").record(duration_ms as f64);

    match outcome {
        Ok(mut result) => {
            result.duration_ms = duration_ms;
            if let Err(e) = ctx
                .store
                .finish_job(
                    audit_id,
                    JobStatus::Completed,
                    result.items_found,
                    result.items_inserted,
                    join_errors(&result.errors),
                )
                .await
            {
                warn!(target: "jobs", error = ?e, "could not finalize job");
            }
            if let Err(e) = ctx
                .store
                .record_crawl_outcome(
                    payload.source_id,
                    CrawlOutcome {
                        success: true,
                        duration_ms,
                        error: None,
                    },
                )
                .await
            {
                warn!(target: "jobs", error = ?e, "could not record source health");
            }
            info!(
                target: "jobs",
                source = payload.source_id,
                found = result.items_found,
                inserted = result.items_inserted,
                duration_ms,
                "job completed"
            );
        }
        Err(e) => {
            counter!("crawl_jobs_failed_total").increment(1);
            let message = format!("{e:#}");
            if let Err(err) = ctx
                .store
                .finish_job(audit_id, JobStatus::Failed, 0, 0, Some(message.clone()))
                .await
            {
                warn!(target: "jobs", error = ?err, "could not finalize failed job");
            }
            match ctx
                .store
                .record_crawl_outcome(
                    payload.source_id,
                    CrawlOutcome {
                        success: false,
                        duration_ms,
                        error: Some(message.clone()),
                    },
                )
                .await
            {
                Ok(status) => warn!(
                    target: "jobs",
                    source = payload.source_id,
                    status = ?status,
                    error = %message,
                    "job failed"
                ),
                Err(err) => warn!(target: "jobs", error = ?err, "could not record source health"),
            }
        }
    }
}

fn join_errors(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

/// One attempt at a job, routed by source kind.
pub async fn run_job(ctx: &CrawlContext, payload: &JobPayload) -> Result<JobResult> {
    match payload.source_kind {
        SourceKind::Selector => run_selector_job(ctx, payload).await,
        SourceKind::Feed => run_feed_job(ctx, payload).await,
    }
}

async fn run_selector_job(ctx: &CrawlContext, payload: &JobPayload) -> Result<JobResult> {
    let source = ctx
        .store
        .source(payload.source_id)
        .await?
        .ok_or_else(|| anyhow!("source {} vanished", payload.source_id))?;

    let outcome = ctx.extractor.run(&source).await?;
    let mut result = JobResult {
        source_id: payload.source_id,
        items_found: outcome.articles.len() as u32,
        errors: outcome.errors,
        ..Default::default()
    };

    for article in outcome.articles {
        ingest_article(ctx, payload.source_id, article, &mut result).await;
    }
    Ok(result)
}

async fn run_feed_job(ctx: &CrawlContext, payload: &JobPayload) -> Result<JobResult> {
    let feed_url = payload
        .feed_url
        .as_deref()
        .ok_or_else(|| anyhow!("feed source {} has no feed url", payload.source_id))?;

    let fetched = ctx
        .feed
        .fetch(
            feed_url,
            payload.last_etag.as_deref(),
            payload.last_feed_modified.as_deref(),
        )
        .await?;

    let mut result = JobResult {
        source_id: payload.source_id,
        ..Default::default()
    };

    let items = match fetched {
        FeedFetch::NotModified => {
            // success with zero items; stored validators stay untouched
            return Ok(result);
        }
        FeedFetch::Fetched {
            items,
            etag,
            last_modified,
        } => {
            ctx.store
                .set_feed_validators(payload.source_id, etag, last_modified)
                .await?;
            items
        }
    };
    result.items_found = items.len() as u32;

    let enrich = payload.enrich_content.unwrap_or(false);
    for mut item in items {
        if item.partial && enrich {
            if let Some(selector) = payload.content_selector.as_deref() {
                match ctx.fetch.fetch_page(&item.url).await {
                    Ok(page) => {
                        if let Some(content) = extract_with_selector(&page.html, selector) {
                            item.partial =
                                content.chars().count() < crate::feed::PARTIAL_MIN_CHARS;
                            item.content = content;
                        }
                    }
                    Err(e) => {
                        warn!(target: "jobs", url = %item.url, error = %e, "enrichment fetch failed");
                        result.errors.push(format!("enrich {}: {e}", item.url));
                    }
                }
            }
        }
        ingest_article(ctx, payload.source_id, item, &mut result).await;
    }
    Ok(result)
}

/// Insert, then push the new article through dedup and watch. Post-insert
/// engine errors are job-level notes, not failures.
async fn ingest_article(
    ctx: &CrawlContext,
    source_id: i64,
    item: crate::model::ExtractedArticle,
    result: &mut JobResult,
) {
    let article: Article = match ctx.store.insert_article(source_id, item).await {
        Ok(InsertOutcome::Inserted(a)) => a,
        Ok(InsertOutcome::Duplicate) => {
            counter!("crawl_items_duplicate_total").increment(1);
            return;
        }
        Err(e) => {
            warn!(target: "jobs", error = ?e, "article insert failed");
            result.errors.push(format!("insert: {e:#}"));
            return;
        }
    };
    result.items_inserted += 1;
    counter!("crawl_items_inserted_total").increment(1);

    if let Err(e) = ctx.dedup.process_new(&article).await {
        warn!(target: "jobs", article = article.id, error = ?e, "dedup pass failed");
        result.errors.push(format!("dedup {}: {e:#}", article.id));
    }
    if let Err(e) = ctx.watch.analyze(&article).await {
        warn!(target: "jobs", article = article.id, error = ?e, "watch pass failed");
        result.errors.push(format!("watch {}: {e:#}", article.id));
    }
}
