// src/jobs/scheduler.rs
//! Periodic enqueue of one crawl job per ACTIVE source, plus retention
//! housekeeping and the watch-analysis sweep. A tick is skipped entirely
//! while a previous scheduled sweep is still in flight, with no partial
//! batches.

use super::{JobPayload, JobQueue, QueuedJob};
use crate::config::RetentionConfig;
use crate::model::{SourceStatus, TriggerReason};
use crate::store::SharedStore;
use crate::watch::WatchEngine;
use chrono::{Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Enqueue a manual job for one source right now.
pub async fn enqueue_manual(
    store: &SharedStore,
    queue: &JobQueue,
    source_id: i64,
) -> anyhow::Result<i64> {
    let source = store
        .source(source_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("source {source_id} not found"))?;
    let audit = store.create_job(source_id, TriggerReason::Manual).await?;
    queue.enqueue(QueuedJob {
        payload: JobPayload::for_source(&source, TriggerReason::Manual),
        audit_id: audit.id,
    });
    Ok(audit.id)
}

/// Fixed-interval scheduler over ACTIVE sources. Sources in ERROR are not
/// scheduled; an explicit activate/reset brings them back.
pub fn spawn_scheduler(
    store: SharedStore,
    queue: JobQueue,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;

            let in_flight = queue.scheduled_in_flight();
            if in_flight > 0 {
                info!(target: "jobs", in_flight, "previous sweep still running, skipping tick");
                counter!("schedule_ticks_skipped_total").increment(1);
                continue;
            }

            let sources = match store.sources_with_status(SourceStatus::Active).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(target: "jobs", error = ?e, "could not list active sources");
                    continue;
                }
            };
            gauge!("schedule_active_sources").set(sources.len() as f64);

            for source in sources {
                match store.create_job(source.id, TriggerReason::Scheduled).await {
                    Ok(audit) => queue.enqueue(QueuedJob {
                        payload: JobPayload::for_source(&source, TriggerReason::Scheduled),
                        audit_id: audit.id,
                    }),
                    Err(e) => {
                        warn!(target: "jobs", source = source.id, error = ?e, "could not create audit job")
                    }
                }
            }
            counter!("schedule_ticks_total").increment(1);
        }
    })
}

/// Hourly purge of old articles and job audit rows.
pub fn spawn_housekeeping(store: SharedStore, retention: RetentionConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let article_cutoff = Utc::now() - ChronoDuration::days(retention.article_days);
            match store.purge_articles_before(article_cutoff).await {
                Ok(n) if n > 0 => info!(target: "jobs", purged = n, "purged old articles"),
                Ok(_) => {}
                Err(e) => warn!(target: "jobs", error = ?e, "article purge failed"),
            }
            let job_cutoff = Utc::now() - ChronoDuration::days(retention.job_days);
            match store.purge_jobs_before(job_cutoff).await {
                Ok(n) if n > 0 => info!(target: "jobs", purged = n, "purged old crawl jobs"),
                Ok(_) => {}
                Err(e) => warn!(target: "jobs", error = ?e, "job purge failed"),
            }
        }
    })
}

/// Periodic watch-analysis sweep over recently created, still-unanalyzed
/// articles.
pub fn spawn_watch_sweep(watch: Arc<WatchEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = watch.sweep_unanalyzed().await {
                warn!(target: "watch", error = ?e, "unanalyzed sweep failed");
            }
        }
    })
}
