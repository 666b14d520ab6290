// src/config.rs
//! Runtime configuration: TOML file + environment overrides.
//!
//! Resolution order: `NEWSWATCH_CONFIG_PATH` env var, then
//! `config/newswatch.toml`, then built-in defaults. Individual knobs can
//! be overridden via `NEWSWATCH_*` env vars after the file is loaded.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/newswatch.toml";
pub const ENV_CONFIG_PATH: &str = "NEWSWATCH_CONFIG_PATH";

fn default_worker_count() -> usize {
    2
}
fn default_schedule_interval_secs() -> u64 {
    60
}
fn default_html_cache_ttl_secs() -> u64 {
    300
}
fn default_http_timeout_secs() -> u64 {
    15
}
fn default_feed_timeout_secs() -> u64 {
    30
}
fn default_navigation_timeout_secs() -> u64 {
    30
}
fn default_settle_delay_ms() -> u64 {
    1500
}
fn default_job_attempts() -> u32 {
    3
}
fn default_retry_base_secs() -> u64 {
    5
}
fn default_lookback_days() -> i64 {
    7
}
fn default_candidate_cap() -> usize {
    500
}
fn default_prefilter_threshold() -> f64 {
    0.15
}
fn default_duplicate_threshold() -> f64 {
    0.8
}
fn default_early_exit_threshold() -> f64 {
    0.9
}
fn default_judge_cache_ttl_secs() -> u64 {
    86_400
}
fn default_judge_delay_ms() -> u64 {
    500
}
fn default_watch_threshold() -> f64 {
    0.7
}
fn default_sweep_batch() -> usize {
    50
}
fn default_article_retention_days() -> i64 {
    30
}
fn default_job_retention_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub worker_count: usize,
    pub schedule_interval_secs: u64,
    pub html_cache_ttl_secs: u64,
    pub http_timeout_secs: u64,
    pub feed_timeout_secs: u64,
    pub navigation_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub job_attempts: u32,
    pub retry_base_secs: u64,
    /// LLM-driven field extraction for partial selector articles.
    pub ai_extraction_fallback: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            schedule_interval_secs: default_schedule_interval_secs(),
            html_cache_ttl_secs: default_html_cache_ttl_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            feed_timeout_secs: default_feed_timeout_secs(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            job_attempts: default_job_attempts(),
            retry_base_secs: default_retry_base_secs(),
            ai_extraction_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub lookback_days: i64,
    pub candidate_cap: usize,
    pub prefilter_threshold: f64,
    pub duplicate_threshold: f64,
    pub early_exit_threshold: f64,
    pub judge_cache_ttl_secs: u64,
    /// Fixed inter-call delay between semantic judge calls in one pass.
    pub judge_delay_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            candidate_cap: default_candidate_cap(),
            prefilter_threshold: default_prefilter_threshold(),
            duplicate_threshold: default_duplicate_threshold(),
            early_exit_threshold: default_early_exit_threshold(),
            judge_cache_ttl_secs: default_judge_cache_ttl_secs(),
            judge_delay_ms: default_judge_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub confidence_threshold: f64,
    pub sweep_batch: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_watch_threshold(),
            sweep_batch: default_sweep_batch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub article_days: i64,
    pub job_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            article_days: default_article_retention_days(),
            job_days: default_job_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub enabled: bool,
    /// "openai" is the only wired provider; anything else disables the judge.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// "ENV" means: read from OPENAI_API_KEY.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub crawl: CrawlConfig,
    pub dedup: DedupConfig,
    pub watch: WatchConfig,
    pub retention: RetentionConfig,
    pub judge: JudgeConfig,
}

impl AppConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(s).context("parsing newswatch config")?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Env var, then default file, then built-in defaults.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            Self::from_path(&PathBuf::from(p))?
        } else {
            let p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if p.exists() {
                Self::from_path(&p)?
            } else {
                AppConfig::default()
            }
        };
        cfg.apply_env_overrides();
        cfg.sanitize();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_f64("NEWSWATCH_DUPLICATE_THRESHOLD") {
            self.dedup.duplicate_threshold = v;
        }
        if let Some(v) = env_f64("NEWSWATCH_PREFILTER_THRESHOLD") {
            self.dedup.prefilter_threshold = v;
        }
        if let Some(v) = env_f64("NEWSWATCH_WATCH_THRESHOLD") {
            self.watch.confidence_threshold = v;
        }
        if let Some(v) = std::env::var("NEWSWATCH_WORKERS")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
        {
            self.crawl.worker_count = v;
        }
    }

    fn sanitize(&mut self) {
        self.crawl.worker_count = self.crawl.worker_count.clamp(1, 16);
        self.crawl.job_attempts = self.crawl.job_attempts.clamp(1, 10);
        for t in [
            &mut self.dedup.prefilter_threshold,
            &mut self.dedup.duplicate_threshold,
            &mut self.dedup.early_exit_threshold,
            &mut self.watch.confidence_threshold,
        ] {
            if !t.is_finite() {
                *t = 0.0;
            }
            *t = t.clamp(0.0, 1.0);
        }
        if self.watch.sweep_batch == 0 {
            self.watch.sweep_batch = default_sweep_batch();
        }
        if self.dedup.candidate_cap == 0 {
            self.dedup.candidate_cap = default_candidate_cap();
        }
    }
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0))
}
