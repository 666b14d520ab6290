// src/watch.rs
//! Watch relevance engine: decides which active watch keywords a new or
//! backfilled article is *contextually* relevant to. Substring hits inside
//! unrelated words do not count; the judgment is semantic, one call per
//! (article, keyword) pair.

use crate::config::WatchConfig;
use crate::judge::SharedJudge;
use crate::model::{Article, Owner, WatchMatch};
use crate::store::SharedStore;
use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use metrics::{counter, describe_counter, gauge};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("watch_articles_analyzed_total", "Articles checked for watch relevance.");
        describe_counter!("watch_matches_total", "Watch matches persisted.");
        describe_counter!(
            "watch_judge_failures_total",
            "Relevance judge calls degraded to not-relevant."
        );
    });
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub struct WatchEngine {
    store: SharedStore,
    judge: SharedJudge,
    cfg: WatchConfig,
}

impl WatchEngine {
    pub fn new(store: SharedStore, judge: SharedJudge, cfg: WatchConfig) -> Self {
        ensure_metrics_described();
        Self { store, judge, cfg }
    }

    /// Check one article against every keyword applicable to its source:
    /// a system-wide source is matched against all users' active keywords,
    /// a user-owned source only against that user's (data isolation).
    /// Returns the number of matches persisted. The article is marked
    /// analyzed once all applicable keywords were checked (also when
    /// there were none) so it is never re-checked forever.
    pub async fn analyze(&self, article: &Article) -> Result<usize> {
        let source = self
            .store
            .source(article.source_id)
            .await?
            .ok_or_else(|| anyhow!("source {} not found", article.source_id))?;
        let keywords = self.store.active_keywords_for(source.owner).await?;

        if keywords.is_empty() {
            self.store.mark_article_analyzed(article.id, Utc::now()).await?;
            counter!("watch_articles_analyzed_total").increment(1);
            return Ok(0);
        }

        // With no judge configured there is nothing to check against yet;
        // leave the article unanalyzed so the hourly sweep can pick it up
        // if a judge becomes available within the sweep window.
        if !self.judge.available() {
            debug!(target: "watch", article = article.id, "judge unavailable, deferring");
            return Ok(0);
        }

        let mut persisted = 0usize;
        for kw in &keywords {
            let verdict = match self
                .judge
                .relevance(
                    &kw.term,
                    kw.description.as_deref(),
                    &article.title,
                    &article.summary,
                    &truncate_chars(&article.content, 1000),
                )
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    // degrade to not-relevant, never fail the pass
                    counter!("watch_judge_failures_total").increment(1);
                    warn!(target: "watch", keyword = %kw.term, error = %e, "relevance judge failed");
                    continue;
                }
            };
            if verdict.is_relevant && verdict.confidence >= self.cfg.confidence_threshold {
                self.store
                    .upsert_watch_match(WatchMatch {
                        article_id: article.id,
                        keyword_id: kw.id,
                        confidence: verdict.confidence,
                        rationale: verdict.reason.clone(),
                        matched_at: Utc::now(),
                    })
                    .await?;
                counter!("watch_matches_total").increment(1);
                info!(
                    target: "watch",
                    article = article.id,
                    keyword = %kw.term,
                    confidence = verdict.confidence,
                    "watch match"
                );
                persisted += 1;
            }
        }

        self.store.mark_article_analyzed(article.id, Utc::now()).await?;
        counter!("watch_articles_analyzed_total").increment(1);
        Ok(persisted)
    }

    /// Periodic safety net: re-run relevance over articles created within
    /// the last hour that are still unanalyzed, bounded per run.
    pub async fn sweep_unanalyzed(&self) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::hours(1);
        let pending = self
            .store
            .unanalyzed_since(cutoff, self.cfg.sweep_batch)
            .await?;
        gauge!("watch_sweep_pending").set(pending.len() as f64);
        let mut analyzed = 0usize;
        for article in pending {
            match self.analyze(&article).await {
                Ok(_) => analyzed += 1,
                Err(e) => warn!(target: "watch", article = article.id, error = ?e, "sweep analyze failed"),
            }
        }
        if analyzed > 0 {
            debug!(target: "watch", analyzed, "sweep pass done");
        }
        Ok(analyzed)
    }
}
