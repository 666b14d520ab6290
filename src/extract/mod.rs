// src/extract/mod.rs
//! Two-phase selector extractor: a list page yields article links via
//! configured `list_item` rules with auto-detected anchors; each detail
//! page is then fetched through the same cache/HTTP/browser cascade and
//! mined for title/date/content/summary/image.

pub mod dom;

use crate::cache::{metadata_key, selector_key, SharedCache};
use crate::fetch::FetchPipeline;
use crate::judge::SharedJudge;
use crate::model::{ExtractedArticle, SelectorRules, Source};
use anyhow::{anyhow, Context, Result};
use self::dom::{DomBackend, DomNode, HtmlBackend};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// How long the per-source extraction caches (resolved links, run
/// metadata) stay valid. Consumed by the selector-preview surfaces.
const SOURCE_CACHE_TTL: Duration = Duration::from_secs(300);

pub const CONTENT_MAX_CHARS: usize = 5_000;
pub const SUMMARY_MAX_CHARS: usize = 500;

/// Lazy-load attributes checked before falling back to a nested `img`.
const IMAGE_ATTRS: &[&str] = &["src", "data-src", "data-lazy-src", "data-original"];

#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub articles: Vec<ExtractedArticle>,
    pub errors: Vec<String>,
}

pub struct SelectorExtractor {
    fetch: Arc<FetchPipeline>,
    cache: SharedCache,
    judge: SharedJudge,
    ai_fallback: bool,
}

impl SelectorExtractor {
    pub fn new(
        fetch: Arc<FetchPipeline>,
        cache: SharedCache,
        judge: SharedJudge,
        ai_fallback: bool,
    ) -> Self {
        Self {
            fetch,
            cache,
            judge,
            ai_fallback,
        }
    }

    /// Run both phases for a selector source. A list page matching nothing
    /// is a recoverable zero-items outcome; a failed list-page fetch is an
    /// error the job layer turns into a FAILED run.
    #[instrument(level = "info", skip_all, fields(source = source.id))]
    pub async fn run(&self, source: &Source) -> Result<ExtractionOutcome> {
        let rules = source
            .selectors
            .as_ref()
            .ok_or_else(|| anyhow!("source {} has no selector rules", source.id))?;

        let page = self
            .fetch
            .fetch_page(&source.url)
            .await
            .with_context(|| format!("fetching list page {}", source.url))?;
        let links = list_links(&page.html, &rules.list_item, &source.url);
        if let Ok(json) = serde_json::to_string(&links) {
            // kept fresh for the selector-preview surfaces
            self.cache
                .put(&selector_key(source.id), json, SOURCE_CACHE_TTL)
                .await;
        }
        if links.is_empty() {
            warn!(target: "extract", url = %source.url, selector = %rules.list_item, "list page yielded no links");
            return Ok(ExtractionOutcome::default());
        }
        info!(target: "extract", count = links.len(), "list phase resolved links");

        let mut outcome = ExtractionOutcome::default();
        for link in links {
            let detail = match self.fetch.fetch_page(&link).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(target: "extract", url = %link, error = %e, "detail fetch failed");
                    outcome.errors.push(format!("{link}: {e}"));
                    continue;
                }
            };
            let mut article = extract_detail(&detail.html, &link, rules);
            if article.partial {
                article = self.try_recover_fields(article, &detail.html).await;
            }
            debug!(target: "extract", url = %link, partial = article.partial, "detail extracted");
            outcome.articles.push(article);
        }

        let meta = serde_json::json!({
            "fetched_via": format!("{:?}", page.via),
            "items": outcome.articles.len(),
            "errors": outcome.errors.len(),
            "at": chrono::Utc::now().to_rfc3339(),
        });
        self.cache
            .put(&metadata_key(source.id), meta.to_string(), SOURCE_CACHE_TTL)
            .await;
        Ok(outcome)
    }

    /// LLM fallback for partial articles: reduce the page to plain text and
    /// ask the judge service to recover the missing fields. The article is
    /// accepted as-is when the fallback is disabled or fails.
    async fn try_recover_fields(
        &self,
        mut article: ExtractedArticle,
        html: &str,
    ) -> ExtractedArticle {
        if !self.ai_fallback || !self.judge.available() {
            return article;
        }
        let reduced = html_to_plain_text(html);
        match self.judge.extract_fields(&reduced).await {
            Ok(fields) => {
                if article.title.is_empty() {
                    if let Some(t) = fields.title {
                        article.title = sanitize_text(&t);
                    }
                }
                if article.content.is_empty() {
                    if let Some(c) = fields.content {
                        article.content = truncate_chars(&sanitize_text(&c), CONTENT_MAX_CHARS);
                    }
                }
                if article.summary.is_empty() {
                    if let Some(s) = fields.summary {
                        article.summary = truncate_chars(&sanitize_text(&s), SUMMARY_MAX_CHARS);
                    }
                }
                article.partial = article.content.is_empty() && article.summary.is_empty();
                article
            }
            Err(e) => {
                debug!(target: "extract", error = %e, "field recovery failed, keeping partial");
                article
            }
        }
    }
}

/// List phase: select `list_item` nodes, auto-detect each node's article
/// link (the node itself is an anchor, else its first anchor descendant,
/// else the nearest ancestor anchor), resolve and dedupe preserving order.
pub fn list_links(html: &str, list_item_selector: &str, page_url: &str) -> Vec<String> {
    let backend = HtmlBackend::parse(html);
    let root = backend.root();
    let mut links = Vec::new();
    for node in root.select(list_item_selector) {
        let Some(href) = detect_link(node) else {
            continue;
        };
        let Some(resolved) = resolve_url(page_url, href) else {
            continue;
        };
        if let Ok(parsed) = Url::parse(&resolved) {
            if !matches!(parsed.scheme(), "http" | "https") {
                continue;
            }
        }
        if !links.contains(&resolved) {
            links.push(resolved);
        }
    }
    links
}

fn detect_link<'a, N: DomNode<'a>>(node: N) -> Option<&'a str> {
    if node.is_tag("a") {
        return node.attr("href");
    }
    if let Some(a) = node.select("a").into_iter().next() {
        return a.attr("href");
    }
    let mut cursor = node.parent();
    while let Some(n) = cursor {
        if n.is_tag("a") {
            return n.attr("href");
        }
        cursor = n.parent();
    }
    None
}

/// Detail phase over one fetched page.
pub fn extract_detail(html: &str, page_url: &str, rules: &SelectorRules) -> ExtractedArticle {
    let backend = HtmlBackend::parse(html);
    let root = backend.root();

    let mut title = rules
        .title
        .as_deref()
        .and_then(|sel| first_text(root, sel))
        .unwrap_or_default();
    if title.is_empty() {
        title = first_text(root, "title").unwrap_or_default();
    }

    let published_at = rules.date.as_deref().and_then(|sel| {
        root.select(sel).into_iter().next().and_then(|node| {
            let raw = node
                .attr("datetime")
                .map(str::to_string)
                .unwrap_or_else(|| node.text_content());
            crate::feed::parse_datetime(raw.trim())
        })
    });

    let content = rules
        .content
        .as_deref()
        .and_then(|sel| first_text(root, sel))
        .map(|t| truncate_chars(&t, CONTENT_MAX_CHARS))
        .unwrap_or_default();

    let summary = rules
        .summary
        .as_deref()
        .and_then(|sel| first_text(root, sel))
        .map(|t| truncate_chars(&t, SUMMARY_MAX_CHARS))
        .unwrap_or_default();

    let image_url = rules
        .image
        .as_deref()
        .and_then(|sel| root.select(sel).into_iter().next())
        .and_then(detect_image)
        .and_then(|raw| resolve_url(page_url, &raw));

    let partial = content.is_empty() && summary.is_empty();
    ExtractedArticle {
        title,
        url: page_url.to_string(),
        published_at,
        content,
        summary,
        image_url,
        partial,
    }
}

/// Feed enrichment: apply one configured content selector to a detail
/// page, nothing else.
pub fn extract_with_selector(html: &str, selector: &str) -> Option<String> {
    let backend = HtmlBackend::parse(html);
    first_text(backend.root(), selector).map(|t| truncate_chars(&t, CONTENT_MAX_CHARS))
}

fn first_text<'a, N: DomNode<'a>>(root: N, selector: &str) -> Option<String> {
    root.select(selector)
        .into_iter()
        .map(|n| sanitize_text(&n.text_content()))
        .find(|t| !t.is_empty())
}

fn detect_image<'a, N: DomNode<'a>>(node: N) -> Option<String> {
    for attr in IMAGE_ATTRS {
        if let Some(v) = node.attr(attr) {
            if !v.trim().is_empty() {
                return Some(v.trim().to_string());
            }
        }
    }
    if let Some(srcset) = node.attr("srcset").or_else(|| node.attr("data-srcset")) {
        if let Some(first) = srcset.split(',').next() {
            let url = first.split_whitespace().next().unwrap_or("").trim();
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    if let Some(img) = node.select("img").into_iter().next() {
        for attr in IMAGE_ATTRS {
            if let Some(v) = img.attr(attr) {
                if !v.trim().is_empty() {
                    return Some(v.trim().to_string());
                }
            }
        }
    }
    None
}

/// Resolve a possibly-relative URL against the page it came from.
/// Protocol-relative (`//host/x`) and root-relative (`/x`) forms get
/// explicit handling; everything else goes through RFC 3986 join.
pub fn resolve_url(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if let Some(rest) = href.strip_prefix("//") {
        let base = Url::parse(page_url).ok()?;
        return Some(format!("{}://{}", base.scheme(), rest));
    }
    if let Ok(absolute) = Url::parse(href) {
        return Some(absolute.to_string());
    }
    let base = Url::parse(page_url).ok()?;
    if href.starts_with('/') {
        // root-relative: replaces the whole path on the page's host
        return base.join(href).ok().map(|u| u.to_string());
    }
    base.join(href).ok().map(|u| u.to_string())
}

/// Collapse whitespace and newlines, trim.
pub fn sanitize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Crude markdown-ish reduction used by the LLM field-recovery fallback:
/// drop script/style blocks, strip tags, decode entities, collapse.
pub fn html_to_plain_text(html: &str) -> String {
    static RE_SCRIPT: OnceCell<Regex> = OnceCell::new();
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_script = RE_SCRIPT
        .get_or_init(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").unwrap());
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    let without_blocks = re_script.replace_all(html, " ");
    let without_tags = re_tags.replace_all(&without_blocks, " ");
    sanitize_text(&html_escape::decode_html_entities(&without_tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_PAGE: &str = r#"
<html><body>
  <ul>
    <li class="item"><a href="/haber/1">Birinci</a></li>
    <li class="item"><span><a href="/haber/2">İkinci</a></span></li>
    <li class="item">üçüncü, bağlantısız</li>
    <li class="item"><a href="/haber/1">Birinci tekrar</a></li>
  </ul>
  <a href="/haber/3"><div class="wrapped"><span class="inner">Sarılı</span></div></a>
</body></html>"#;

    #[test]
    fn list_links_detects_self_descendant_and_dedupes() {
        let links = list_links(LIST_PAGE, ".item", "https://x.com/");
        assert_eq!(
            links,
            vec![
                "https://x.com/haber/1".to_string(),
                "https://x.com/haber/2".to_string(),
            ]
        );
    }

    #[test]
    fn list_links_walks_up_to_ancestor_anchor() {
        let links = list_links(LIST_PAGE, ".inner", "https://x.com/");
        assert_eq!(links, vec!["https://x.com/haber/3".to_string()]);
    }

    #[test]
    fn list_links_zero_matches_is_empty_not_error() {
        assert!(list_links(LIST_PAGE, ".missing", "https://x.com/").is_empty());
    }

    #[test]
    fn resolve_url_relative_forms() {
        assert_eq!(
            resolve_url("https://x.com/blog/post", "images/a.jpg").as_deref(),
            Some("https://x.com/blog/images/a.jpg")
        );
        assert_eq!(
            resolve_url("https://x.com/blog/post", "//cdn.x.com/a.jpg").as_deref(),
            Some("https://cdn.x.com/a.jpg")
        );
        assert_eq!(
            resolve_url("https://x.com/blog/post", "/images/a.jpg").as_deref(),
            Some("https://x.com/images/a.jpg")
        );
        assert_eq!(
            resolve_url("https://x.com/a", "https://y.com/b").as_deref(),
            Some("https://y.com/b")
        );
        assert_eq!(resolve_url("https://x.com/a", "   "), None);
    }

    #[test]
    fn detail_extraction_with_truncation_and_partial_flag() {
        let rules = SelectorRules {
            list_item: ".item".into(),
            title: Some("h1".into()),
            date: Some("time".into()),
            content: Some(".body".into()),
            summary: Some(".lead".into()),
            image: Some(".hero img".into()),
        };
        let long_body = "kelime ".repeat(2000);
        let html = format!(
            r#"<html><head><title>fallback</title></head><body>
<h1> Büyük   Haber </h1>
<time datetime="2026-02-03T10:00:00Z">3 Şubat</time>
<p class="lead">Özet</p>
<div class="hero"><img data-src="/img/foto.jpg"></div>
<div class="body">{long_body}</div>
</body></html>"#
        );
        let article = extract_detail(&html, "https://x.com/haber/1", &rules);
        assert_eq!(article.title, "Büyük Haber");
        assert_eq!(article.summary, "Özet");
        assert_eq!(article.content.chars().count(), CONTENT_MAX_CHARS);
        assert_eq!(article.image_url.as_deref(), Some("https://x.com/img/foto.jpg"));
        assert!(article.published_at.is_some());
        assert!(!article.partial);

        let empty = extract_detail(
            "<html><head><title>t</title></head><body></body></html>",
            "https://x.com/haber/2",
            &rules,
        );
        assert_eq!(empty.title, "t");
        assert!(empty.partial);
    }

    #[test]
    fn image_lazyload_and_nested_fallbacks() {
        let rules = SelectorRules {
            list_item: ".x".into(),
            image: Some(".wrap".into()),
            ..Default::default()
        };
        let html = r#"<div class="wrap"><img src="/real.png"></div>"#;
        let a = extract_detail(html, "https://x.com/", &rules);
        assert_eq!(a.image_url.as_deref(), Some("https://x.com/real.png"));

        let html = r#"<img class="wrap" data-original="//cdn.x.com/lazy.png">"#;
        let a = extract_detail(html, "https://x.com/", &rules);
        assert_eq!(a.image_url.as_deref(), Some("https://cdn.x.com/lazy.png"));
    }

    #[test]
    fn plain_text_reduction_strips_scripts_and_entities() {
        let html = "<div><script>var x=1;</script><p>D&uuml;nya &amp; haber</p></div>";
        assert_eq!(html_to_plain_text(html), "Dünya & haber");
    }
}
