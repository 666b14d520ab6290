// src/model.rs
//! Domain types shared across the pipeline: sources, articles, groups,
//! crawl-job audit rows, watch keywords and matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Site scraped with per-source CSS selector rules.
    Selector,
    /// RSS/Atom syndication feed.
    Feed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceStatus {
    Active,
    Paused,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerReason {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Who owns a source (and therefore whose watch keywords apply to it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    /// Shared source: matched against every user's active keywords.
    System,
    /// Private source: matched only against this user's keywords.
    User(i64),
}

/// CSS selector rules for a selector-kind source. Only `list_item` is
/// required for the list phase; article links are auto-detected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRules {
    pub list_item: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Feed-kind source configuration, including the conditional-request
/// validators persisted from the last successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub feed_url: String,
    /// Fetch each truncated item's own page and re-extract its content.
    #[serde(default)]
    pub enrich_content: bool,
    /// Single content selector used for enrichment (not the full extractor).
    #[serde(default)]
    pub content_selector: Option<String>,
    #[serde(default)]
    pub last_etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

/// Crawl health counters, mutated only by the job orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub total_crawls: u64,
    pub successful_crawls: u64,
    pub failed_crawls: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
    pub owner: Owner,
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub selectors: Option<SelectorRules>,
    #[serde(default)]
    pub feed: Option<FeedConfig>,
    pub status: SourceStatus,
    #[serde(default)]
    pub health: SourceHealth,
}

/// Consecutive failures before a source is flipped to `Error` status.
pub const ERROR_FAILURE_THRESHOLD: u32 = 5;

impl Source {
    /// Health bookkeeping invariant: any success resets the consecutive
    /// failure count (and an `Error` source back to `Active`); the
    /// `ERROR_FAILURE_THRESHOLD`th consecutive failure flips to `Error`.
    /// `Paused` is an operator state and is never changed here.
    pub fn apply_crawl_outcome(&mut self, success: bool, duration_ms: u64, error: Option<String>) {
        self.health.total_crawls += 1;
        let n = self.health.total_crawls as f64;
        self.health.avg_duration_ms =
            (self.health.avg_duration_ms * (n - 1.0) + duration_ms as f64) / n;
        if success {
            self.health.successful_crawls += 1;
            self.health.consecutive_failures = 0;
            self.health.last_error = None;
            if self.status == SourceStatus::Error {
                self.status = SourceStatus::Active;
            }
        } else {
            self.health.failed_crawls += 1;
            self.health.consecutive_failures += 1;
            self.health.last_error = error;
            if self.health.consecutive_failures >= ERROR_FAILURE_THRESHOLD
                && self.status == SourceStatus::Active
            {
                self.status = SourceStatus::Error;
            }
        }
    }
}

/// One normalized piece of content. Content fields are immutable once set;
/// only group linkage, read state and watch-analysis flags change later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content: String,
    pub summary: String,
    pub image_url: Option<String>,
    /// Neither content nor summary could be extracted.
    pub partial: bool,
    /// Stable hash over (source_id, url); unique per source.
    pub source_hash: String,
    /// Hash over the normalized URL alone, comparable across sources.
    pub url_hash: String,
    pub group_id: Option<i64>,
    pub group_similarity: Option<f64>,
    pub read: bool,
    pub analyzed: bool,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Extractor/feed output before persistence; hashes are derived on insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedArticle {
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content: String,
    pub summary: String,
    pub image_url: Option<String>,
    pub partial: bool,
}

impl ExtractedArticle {
    pub fn is_partial(&self) -> bool {
        self.content.is_empty() && self.summary.is_empty()
    }
}

/// A cluster of articles from different sources judged to report the same
/// event. Representative fields come from the "best" member (longest
/// content wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleGroup {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub image_url: Option<String>,
    pub member_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Audit record: one row per orchestrator run per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: i64,
    pub source_id: i64,
    pub status: JobStatus,
    pub triggered_by: TriggerReason,
    pub items_found: u32,
    pub items_inserted: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchKeyword {
    pub id: i64,
    pub user_id: i64,
    pub term: String,
    /// Free-text disambiguation hint passed to the semantic judge.
    pub description: Option<String>,
    pub active: bool,
    /// Presentation only.
    pub color: Option<String>,
}

/// Link between an article and a keyword; unique per (article, keyword).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchMatch {
    pub article_id: i64,
    pub keyword_id: i64,
    pub confidence: f64,
    pub rationale: String,
    pub matched_at: DateTime<Utc>,
}

pub(crate) fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Per-source identity hash: the storage layer enforces uniqueness on this.
pub fn source_hash(source_id: i64, article_url: &str) -> String {
    sha256_hex(&format!("{}:{}", source_id, normalize_url(article_url)))
}

/// Cross-source URL hash, for exact same-link detection between sources.
pub fn url_hash(article_url: &str) -> String {
    sha256_hex(&normalize_url(article_url))
}

/// Trim, lowercase the scheme+host, drop fragments and trailing slashes so
/// trivially different spellings of one link hash equal.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(mut u) => {
            u.set_fragment(None);
            let mut s = u.to_string();
            while s.ends_with('/') && u.path() != "/" {
                s.pop();
            }
            s
        }
        Err(_) => trimmed.trim_end_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_hash_is_stable_and_url_normalized() {
        let a = source_hash(1, "https://example.com/post/");
        let b = source_hash(1, "  https://example.com/post#frag ");
        assert_eq!(a, b);
        assert_ne!(a, source_hash(2, "https://example.com/post"));
    }

    #[test]
    fn url_hash_matches_across_sources() {
        assert_eq!(
            url_hash("https://example.com/a"),
            url_hash("https://example.com/a#top")
        );
    }

    #[test]
    fn fifth_consecutive_failure_flips_to_error_and_success_reverts() {
        let mut s = Source {
            id: 1,
            name: "s".into(),
            url: "https://s.example".into(),
            kind: SourceKind::Selector,
            owner: Owner::System,
            refresh_interval_secs: 300,
            selectors: None,
            feed: None,
            status: SourceStatus::Active,
            health: Default::default(),
        };
        for _ in 0..4 {
            s.apply_crawl_outcome(false, 100, Some("timeout".into()));
        }
        assert_eq!(s.status, SourceStatus::Active);
        assert_eq!(s.health.consecutive_failures, 4);

        s.apply_crawl_outcome(false, 100, Some("timeout".into()));
        assert_eq!(s.status, SourceStatus::Error);

        s.apply_crawl_outcome(true, 100, None);
        assert_eq!(s.status, SourceStatus::Active);
        assert_eq!(s.health.consecutive_failures, 0);
        assert!(s.health.last_error.is_none());
    }

    #[test]
    fn paused_source_stays_paused_through_failures() {
        let mut s = Source {
            id: 1,
            name: "s".into(),
            url: "https://s.example".into(),
            kind: SourceKind::Feed,
            owner: Owner::System,
            refresh_interval_secs: 300,
            selectors: None,
            feed: None,
            status: SourceStatus::Paused,
            health: Default::default(),
        };
        for _ in 0..6 {
            s.apply_crawl_outcome(false, 10, Some("down".into()));
        }
        assert_eq!(s.status, SourceStatus::Paused);
    }

    #[test]
    fn extracted_partial_means_no_content_and_no_summary() {
        let mut ex = ExtractedArticle {
            title: "t".into(),
            url: "https://x".into(),
            ..Default::default()
        };
        assert!(ex.is_partial());
        ex.summary = "s".into();
        assert!(!ex.is_partial());
    }
}
