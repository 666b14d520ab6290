// src/jobs/mod.rs
//! Queue-based crawl orchestration: one job per source per run, a bounded
//! worker pool, a fixed-interval scheduler with an in-flight guard, and
//! retention housekeeping.

pub mod scheduler;
pub mod worker;

use crate::model::{SelectorRules, Source, SourceKind, TriggerReason};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Discriminated job payload handed to a worker. Mirrors what the
/// orchestrator knows about the source at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub source_id: i64,
    pub url: String,
    pub source_kind: SourceKind,
    pub triggered_by: TriggerReason,
    #[serde(default)]
    pub selectors: Option<SelectorRules>,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub last_etag: Option<String>,
    #[serde(default)]
    pub last_feed_modified: Option<String>,
    #[serde(default)]
    pub enrich_content: Option<bool>,
    #[serde(default)]
    pub content_selector: Option<String>,
}

impl JobPayload {
    pub fn for_source(source: &Source, triggered_by: TriggerReason) -> Self {
        let feed = source.feed.as_ref();
        Self {
            source_id: source.id,
            url: source.url.clone(),
            source_kind: source.kind,
            triggered_by,
            selectors: source.selectors.clone(),
            feed_url: feed.map(|f| f.feed_url.clone()),
            last_etag: feed.and_then(|f| f.last_etag.clone()),
            last_feed_modified: feed.and_then(|f| f.last_modified.clone()),
            enrich_content: feed.map(|f| f.enrich_content),
            content_selector: feed.and_then(|f| f.content_selector.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    pub source_id: i64,
    pub items_found: u32,
    pub items_inserted: u32,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// A payload plus its audit row id, as carried on the queue.
#[derive(Debug)]
pub struct QueuedJob {
    pub payload: JobPayload,
    pub audit_id: i64,
}

/// Sender half of the crawl queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    /// Scheduled jobs still queued or running; the scheduler skips a whole
    /// tick while this is non-zero.
    pub(crate) scheduled_in_flight: Arc<AtomicUsize>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                scheduled_in_flight: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn enqueue(&self, job: QueuedJob) {
        if job.payload.triggered_by == TriggerReason::Scheduled {
            self.scheduled_in_flight
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        // send fails only when every worker is gone; nothing to do then
        let _ = self.tx.send(job);
    }

    pub fn scheduled_in_flight(&self) -> usize {
        self.scheduled_in_flight
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}
