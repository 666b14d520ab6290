// src/dedup/mod.rs
//! Layered duplicate detection: exact hash (at insert), lexical prefilter,
//! semantic judge, group formation. Each layer exists to keep the next,
//! more expensive one off the hot path.

pub mod lexical;

use crate::cache::{judge_key, SharedCache};
use crate::config::DedupConfig;
use crate::judge::{JudgeError, SharedJudge, StorySide, StoryVerdict};
use crate::model::{sha256_hex, Article};
use crate::store::SharedStore;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use metrics::{counter, describe_counter, histogram};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backfill circuit breaker: stop fuzzy matching after this many
/// consecutive judge failures.
pub const MAX_CONSECUTIVE_JUDGE_FAILURES: u32 = 5;

const JUDGE_RETRY_ATTEMPTS: u32 = 3;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "dedup_prefilter_discards_total",
            "Candidates discarded by the lexical prefilter."
        );
        describe_counter!("dedup_judge_calls_total", "Real semantic judge calls.");
        describe_counter!(
            "dedup_judge_cache_hits_total",
            "Judge verdicts served from cache."
        );
        describe_counter!(
            "dedup_judge_failures_total",
            "Judge calls degraded to a non-duplicate verdict."
        );
        describe_counter!("dedup_groups_created_total", "Article groups created.");
        describe_counter!(
            "dedup_groups_extended_total",
            "Articles linked into existing groups."
        );
    });
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub exact_grouped: usize,
    pub fuzzy_grouped: usize,
    pub aborted_by_breaker: bool,
}

pub struct DedupEngine {
    store: SharedStore,
    cache: SharedCache,
    judge: SharedJudge,
    cfg: DedupConfig,
}

impl DedupEngine {
    pub fn new(store: SharedStore, cache: SharedCache, judge: SharedJudge, cfg: DedupConfig) -> Self {
        ensure_metrics_described();
        Self {
            store,
            cache,
            judge,
            cfg,
        }
    }

    /// Run stages 2-5 for one freshly inserted article. Returns the group
    /// id if the article was judged a duplicate of an existing one.
    /// Stage 1 (the exact (source, url) hash) already happened at insert.
    pub async fn process_new(&self, article: &Article) -> Result<Option<i64>> {
        if !self.judge.available() {
            debug!(target: "dedup", article = article.id, "judge unavailable, hash-only mode");
            return Ok(None);
        }
        let mut consecutive_failures = 0u32;
        let best = self.best_duplicate(article, &mut consecutive_failures).await?;
        match best {
            Some((matched, similarity)) => {
                let group_id = self.attach(article, &matched, similarity).await?;
                Ok(Some(group_id))
            }
            None => Ok(None),
        }
    }

    /// Bulk pass over ungrouped articles: a zero-cost exact-title stage
    /// first, then the fuzzy stages over the remainder, capped by the
    /// consecutive-judge-failure circuit breaker.
    pub async fn backfill(&self, articles: Vec<Article>) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();

        // Exact pass: bucket by normalized title, group buckets that span
        // more than one source, similarity 1.0, no semantic calls.
        let mut buckets: HashMap<String, Vec<Article>> = HashMap::new();
        for a in articles.into_iter().filter(|a| a.group_id.is_none()) {
            buckets.entry(lexical::normalize_title(&a.title)).or_default().push(a);
        }
        let mut remainder: Vec<Article> = Vec::new();
        for (_, bucket) in buckets {
            let distinct_sources = {
                let mut ids: Vec<i64> = bucket.iter().map(|a| a.source_id).collect();
                ids.sort_unstable();
                ids.dedup();
                ids.len()
            };
            if bucket.len() < 2 || distinct_sources < 2 {
                remainder.extend(bucket);
                continue;
            }
            let Some(representative) = bucket.iter().max_by_key(|a| a.content.len()) else {
                continue;
            };
            let group = self.store.create_group(representative).await?;
            counter!("dedup_groups_created_total").increment(1);
            for a in &bucket {
                self.store.link_to_group(a.id, group.id, 1.0).await?;
                report.exact_grouped += 1;
            }
        }

        // Fuzzy pass over whatever the exact stage left ungrouped.
        if !self.judge.available() {
            return Ok(report);
        }
        let mut consecutive_failures = 0u32;
        for article in &remainder {
            if consecutive_failures >= MAX_CONSECUTIVE_JUDGE_FAILURES {
                warn!(
                    target: "dedup",
                    failures = consecutive_failures,
                    "backfill aborted: too many consecutive judge failures"
                );
                report.aborted_by_breaker = true;
                break;
            }
            // the article may have been grouped by an earlier iteration
            let current = match self.store.article(article.id).await? {
                Some(a) if a.group_id.is_none() => a,
                _ => continue,
            };
            if let Some((matched, similarity)) =
                self.best_duplicate(&current, &mut consecutive_failures).await?
            {
                self.attach(&current, &matched, similarity).await?;
                report.fuzzy_grouped += 1;
            }
        }
        Ok(report)
    }

    /// Stages 2-4: candidate retrieval, lexical prefilter, judged pass with
    /// early exit. Returns the best-scoring duplicate at or above the
    /// duplicate threshold.
    async fn best_duplicate(
        &self,
        article: &Article,
        consecutive_failures: &mut u32,
    ) -> Result<Option<(Article, f64)>> {
        let since = Utc::now() - ChronoDuration::days(self.cfg.lookback_days);
        let candidates = self
            .store
            .recent_articles(Some(article.source_id), since, self.cfg.candidate_cap)
            .await?;

        // Lexical prefilter, best lexical score first so the early exit
        // tends to trigger on the first judge calls.
        let mut survivors: Vec<(Article, f64)> = candidates
            .into_iter()
            .filter(|c| c.id != article.id)
            .map(|c| {
                let score = lexical::title_similarity(&article.title, &c.title);
                (c, score)
            })
            .filter(|(_, score)| {
                let pass = *score >= self.cfg.prefilter_threshold;
                if !pass {
                    counter!("dedup_prefilter_discards_total").increment(1);
                }
                pass
            })
            .collect();
        survivors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut judged: Vec<(Article, f64)> = Vec::new();
        let mut made_real_call = false;
        for (candidate, lexical_score) in survivors {
            if *consecutive_failures >= MAX_CONSECUTIVE_JUDGE_FAILURES {
                break;
            }
            let (verdict, ok) = self
                .judged_same_story(article, &candidate, &mut made_real_call)
                .await;
            if ok {
                *consecutive_failures = 0;
            } else {
                *consecutive_failures += 1;
            }
            debug!(
                target: "dedup",
                article = article.id,
                candidate = candidate.id,
                lexical = lexical_score,
                similarity = verdict.similarity,
                "judged candidate pair"
            );
            let similarity = verdict.similarity;
            judged.push((candidate, similarity));
            if similarity >= self.cfg.early_exit_threshold {
                break; // good enough, stop spending
            }
        }

        judged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(judged
            .into_iter()
            .next()
            .filter(|(_, similarity)| *similarity >= self.cfg.duplicate_threshold))
    }

    /// One cached/rate-limited/retried judge call. Returns the verdict and
    /// whether it came from a healthy call (cache hits count as healthy);
    /// failures other than rate limits degrade to a non-duplicate verdict.
    async fn judged_same_story(
        &self,
        a: &Article,
        b: &Article,
        made_real_call: &mut bool,
    ) -> (StoryVerdict, bool) {
        let key = judge_key(&pair_hash(&a.title, &b.title));
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(verdict) = serde_json::from_str::<StoryVerdict>(&cached) {
                counter!("dedup_judge_cache_hits_total").increment(1);
                return (verdict, true);
            }
        }

        let side_a = StorySide {
            title: &a.title,
            content: &a.content,
        };
        let side_b = StorySide {
            title: &b.title,
            content: &b.content,
        };

        let mut last_err: Option<JudgeError> = None;
        for attempt in 1..=JUDGE_RETRY_ATTEMPTS {
            // fixed inter-call delay within one matching pass
            if *made_real_call {
                tokio::time::sleep(Duration::from_millis(self.cfg.judge_delay_ms)).await;
            }
            *made_real_call = true;
            let started = std::time::Instant::now();
            counter!("dedup_judge_calls_total").increment(1);
            match self.judge.same_story(side_a.clone(), side_b.clone()).await {
                Ok(verdict) => {
                    histogram!("dedup_judge_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
                    if let Ok(json) = serde_json::to_string(&verdict) {
                        self.cache
                            .put(&key, json, Duration::from_secs(self.cfg.judge_cache_ttl_secs))
                            .await;
                    }
                    return (verdict, true);
                }
                Err(e) if e.is_rate_limit() && attempt < JUDGE_RETRY_ATTEMPTS => {
                    // linear backoff, rate limits only
                    let backoff = Duration::from_millis(self.cfg.judge_delay_ms * attempt as u64);
                    warn!(target: "dedup", attempt, "judge rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        counter!("dedup_judge_failures_total").increment(1);
        warn!(target: "dedup", error = ?last_err, "judge failed, degrading to non-duplicate");
        (
            StoryVerdict {
                is_same_news: false,
                similarity: 0.0,
                reason: "judge unavailable".into(),
            },
            false,
        )
    }

    /// Stage 5: join the matched article's group, or found a new one seeded
    /// from the longer-content member, retroactively linking the matched
    /// article with similarity 1.0. Two existing groups are never merged.
    async fn attach(&self, article: &Article, matched: &Article, similarity: f64) -> Result<i64> {
        if let Some(group_id) = matched.group_id {
            self.store.link_to_group(article.id, group_id, similarity).await?;
            counter!("dedup_groups_extended_total").increment(1);
            info!(
                target: "dedup",
                article = article.id,
                group = group_id,
                similarity,
                "joined existing group"
            );
            return Ok(group_id);
        }
        let representative = if matched.content.len() >= article.content.len() {
            matched
        } else {
            article
        };
        let group = self.store.create_group(representative).await?;
        self.store.link_to_group(matched.id, group.id, 1.0).await?;
        self.store
            .link_to_group(article.id, group.id, similarity)
            .await?;
        counter!("dedup_groups_created_total").increment(1);
        info!(
            target: "dedup",
            article = article.id,
            matched = matched.id,
            group = group.id,
            similarity,
            "created group"
        );
        Ok(group.id)
    }
}

/// Order-insensitive cache key for a title pair.
fn pair_hash(title_a: &str, title_b: &str) -> String {
    let (first, second) = if title_a <= title_b {
        (title_a, title_b)
    } else {
        (title_b, title_a)
    };
    sha256_hex(&format!("{first}\n{second}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_hash_is_order_insensitive() {
        assert_eq!(pair_hash("a", "b"), pair_hash("b", "a"));
        assert_ne!(pair_hash("a", "b"), pair_hash("a", "c"));
    }
}
