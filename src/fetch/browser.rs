// src/fetch/browser.rs
//! Headless-browser tier. One Chromium process is launched lazily and
//! shared across jobs; every fetch gets a fresh page that is closed on
//! every exit path. Static resources and tracking/ad domains are blocked
//! to keep renders cheap.

use super::FetchError;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// URL patterns blocked in browser contexts: images, fonts, media, and
/// the usual tracking/ad hosts. Bandwidth reduction, not ad filtering.
const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*.png",
    "*.jpg",
    "*.jpeg",
    "*.gif",
    "*.webp",
    "*.svg",
    "*.ico",
    "*.woff",
    "*.woff2",
    "*.ttf",
    "*.otf",
    "*.mp4",
    "*.webm",
    "*.mp3",
    "*googletagmanager.com*",
    "*google-analytics.com*",
    "*doubleclick.net*",
    "*googlesyndication.com*",
    "*facebook.net*",
    "*hotjar.com*",
    "*criteo.com*",
];

pub struct BrowserDriver {
    inner: Arc<Mutex<Option<Arc<Browser>>>>,
    navigation_timeout: Duration,
    settle_delay: Duration,
}

impl BrowserDriver {
    pub fn new(navigation_timeout: Duration, settle_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            navigation_timeout,
            settle_delay,
        }
    }

    async fn get_or_launch(&self) -> Result<Arc<Browser>, FetchError> {
        let mut guard = self.inner.lock().await;
        if let Some(ref b) = *guard {
            return Ok(Arc::clone(b));
        }

        let config = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .build()
            .map_err(|e| FetchError::Browser(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::Browser(format!("browser launch: {e}")))?;

        tokio::spawn(async move { while handler.next().await.is_some() {} });

        let shared = Arc::new(browser);
        *guard = Some(Arc::clone(&shared));
        Ok(shared)
    }

    /// Render a page and return its serialized DOM. The page is always
    /// closed, also when navigation or extraction fails.
    pub async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let browser = self.get_or_launch().await?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::Browser(format!("new page: {e}")))?;

        let result = self.render(&page, url).await;

        if let Err(e) = page.close().await {
            debug!(target: "fetch", url, error = %e, "page close error");
        }
        result
    }

    async fn render(&self, page: &Page, url: &str) -> Result<String, FetchError> {
        page.execute(EnableParams::default())
            .await
            .map_err(|e| FetchError::Browser(format!("network enable: {e}")))?;
        page.execute(SetBlockedUrLsParams {
            urls: BLOCKED_URL_PATTERNS.iter().map(|s| s.to_string()).collect(),
        })
        .await
        .map_err(|e| FetchError::Browser(format!("blocklist: {e}")))?;

        tokio::time::timeout(self.navigation_timeout, page.goto(url))
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
            })?
            .map_err(|e| FetchError::Browser(format!("navigate: {e}")))?;

        // content-loaded wait, best effort, then a fixed settle delay for
        // late-rendering frameworks
        let _ = tokio::time::timeout(self.navigation_timeout, page.wait_for_navigation()).await;
        tokio::time::sleep(self.settle_delay).await;

        tokio::time::timeout(self.navigation_timeout, page.content())
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
            })?
            .map_err(|e| FetchError::Browser(format!("read content: {e}")))
    }

    /// Close the shared browser process if it was ever launched.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(browser) = guard.take() {
            match Arc::try_unwrap(browser) {
                Ok(mut b) => {
                    if let Err(e) = b.close().await {
                        warn!(target: "fetch", error = %e, "browser close error");
                    }
                }
                Err(_) => warn!(target: "fetch", "browser still shared at shutdown"),
            }
        }
    }
}
