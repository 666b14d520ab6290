// src/fetch/mod.rs
//! Fetch orchestrator: content cache, then the lightweight HTTP client,
//! then the headless browser; the expensive path is taken only when a
//! page demonstrably needs script execution. Failures propagate; there is
//! no silent empty result.

pub mod browser;
pub mod client;

use crate::cache::{html_key, SharedCache};
use self::browser::BrowserDriver;
use self::client::HttpFetcher;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} for {url}")]
    BadStatus { url: String, status: u16 },
    #[error("timeout fetching {url}")]
    Timeout { url: String },
    #[error("browser error: {0}")]
    Browser(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Transient failures are retried by the job queue's backoff policy.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::InvalidUrl(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchVia {
    Cache,
    Http,
    Browser,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    pub via: FetchVia,
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("fetch_cache_hits_total", "Pages served from the HTML cache.");
        describe_counter!("fetch_http_total", "Pages served by the lightweight HTTP client.");
        describe_counter!(
            "fetch_browser_total",
            "Pages that needed the headless browser."
        );
        describe_counter!("fetch_failures_total", "Page fetches that failed outright.");
    });
}

pub struct FetchPipeline {
    cache: SharedCache,
    http: HttpFetcher,
    browser: Arc<BrowserDriver>,
    html_cache_ttl: Duration,
}

impl FetchPipeline {
    pub fn new(
        cache: SharedCache,
        http: HttpFetcher,
        browser: Arc<BrowserDriver>,
        html_cache_ttl: Duration,
    ) -> Self {
        ensure_metrics_described();
        Self {
            cache,
            http,
            browser,
            html_cache_ttl,
        }
    }

    /// The cascade: cache probe, lightweight HTTP with JS-dependence
    /// classification, headless fallback.
    pub async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let key = html_key(url);
        if let Some(html) = self.cache.get(&key).await {
            counter!("fetch_cache_hits_total").increment(1);
            debug!(target: "fetch", url, "cache hit");
            return Ok(FetchedPage {
                html,
                via: FetchVia::Cache,
            });
        }

        match self.http.fetch(url).await {
            Ok(html) if !needs_js_rendering(&html) => {
                counter!("fetch_http_total").increment(1);
                self.cache
                    .put(&key, html.clone(), self.html_cache_ttl)
                    .await;
                return Ok(FetchedPage {
                    html,
                    via: FetchVia::Http,
                });
            }
            Ok(_) => {
                info!(target: "fetch", url, "page classified JS-dependent, using browser");
            }
            Err(e) => {
                info!(target: "fetch", url, error = %e, "lightweight fetch failed, using browser");
            }
        }

        match self.browser.fetch_page(url).await {
            Ok(html) => {
                counter!("fetch_browser_total").increment(1);
                Ok(FetchedPage {
                    html,
                    via: FetchVia::Browser,
                })
            }
            Err(e) => {
                counter!("fetch_failures_total").increment(1);
                Err(e)
            }
        }
    }
}

/// Heuristic JS-dependence classification of a fetched body. Any signal
/// routes the page to the browser: a near-empty body, a recognized SPA
/// root with no text, framework marker attributes, or a loading
/// placeholder on a short page.
pub fn needs_js_rendering(html: &str) -> bool {
    let doc = Html::parse_document(html);
    let body_text = text_of(&doc, "body");
    let body_len = body_text.chars().count();

    if body_len < 500 {
        return true;
    }

    for root in ["#root", "#app", "#__next"] {
        if let Ok(sel) = Selector::parse(root) {
            if let Some(el) = doc.select(&sel).next() {
                let text: String = el.text().collect::<Vec<_>>().join(" ");
                if text.split_whitespace().count() < 10 {
                    return true;
                }
            }
        }
    }

    for marker in ["[data-reactroot]", "[ng-version]", "[data-v-app]"] {
        if let Ok(sel) = Selector::parse(marker) {
            if doc.select(&sel).next().is_some() {
                return true;
            }
        }
    }
    if html.contains("__NEXT_DATA__") {
        return true;
    }

    let lowered = body_text.to_lowercase();
    if body_len < 1000 && (lowered.contains("loading") || lowered.contains("yükleniyor")) {
        return true;
    }

    false
}

fn text_of(doc: &Html, selector: &str) -> String {
    let Ok(sel) = Selector::parse(selector) else {
        return String::new();
    };
    doc.select(&sel)
        .next()
        .map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}
