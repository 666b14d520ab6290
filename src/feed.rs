// src/feed.rs
//! RSS/Atom ingestion with conditional requests. A 304 is a *successful*
//! no-op: zero items, stored validators untouched. A 200 re-parses the
//! feed and always overwrites the stored ETag/Last-Modified.

use crate::extract::{html_to_plain_text, sanitize_text, truncate_chars, SUMMARY_MAX_CHARS};
use crate::fetch::FetchError;
use crate::model::ExtractedArticle;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, histogram};
use once_cell::sync::OnceCell;
use quick_xml::de::from_str;
use regex::Regex;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use serde::Deserialize;
use std::time::Duration;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;
use tracing::debug;

/// Items with less normalized content than this are marked partial and
/// become candidates for detail-page enrichment.
pub const PARTIAL_MIN_CHARS: usize = 200;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_fetches_total", "Feed fetch attempts.");
        describe_counter!("feed_not_modified_total", "Conditional fetches answered with 304.");
        describe_counter!("feed_items_total", "Feed entries parsed.");
        describe_counter!("feed_parse_errors_total", "Feeds that failed to parse.");
    });
}

/// Outcome of a conditional feed fetch.
#[derive(Debug)]
pub enum FeedFetch {
    /// 304: nothing new; the caller must treat this as success and must
    /// not touch the stored validators.
    NotModified,
    Fetched {
        items: Vec<ExtractedArticle>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Fetch seam so the orchestrator can be exercised without a network.
#[async_trait::async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(
        &self,
        feed_url: &str,
        last_etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedFetch>;
}

pub struct FeedClient {
    http: reqwest::Client,
}

impl FeedClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("newswatch/0.1 feed reader")
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { http }
    }
}

#[async_trait::async_trait]
impl FeedFetcher for FeedClient {
    async fn fetch(
        &self,
        feed_url: &str,
        last_etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedFetch> {
        ensure_metrics_described();
        counter!("feed_fetches_total").increment(1);

        let mut req = self.http.get(feed_url);
        if let Some(etag) = last_etag {
            req = req.header(IF_NONE_MATCH, etag);
        }
        if let Some(lm) = last_modified {
            req = req.header(IF_MODIFIED_SINCE, lm);
        }

        let resp = req
            .send()
            .await
            .map_err(FetchError::from)
            .with_context(|| format!("fetching feed {feed_url}"))?;

        if resp.status().as_u16() == 304 {
            counter!("feed_not_modified_total").increment(1);
            debug!(target: "feed", url = feed_url, "not modified");
            return Ok(FeedFetch::NotModified);
        }
        if !resp.status().is_success() {
            return Err(FetchError::BadStatus {
                url: feed_url.to_string(),
                status: resp.status().as_u16(),
            }
            .into());
        }

        let etag = header_string(&resp, ETAG);
        let last_modified = header_string(&resp, LAST_MODIFIED);
        let body = resp
            .text()
            .await
            .map_err(FetchError::from)
            .context("reading feed body")?;

        let t0 = std::time::Instant::now();
        let entries = parse_feed(&body).inspect_err(|_| {
            counter!("feed_parse_errors_total").increment(1);
        })?;
        histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("feed_items_total").increment(entries.len() as u64);

        let items = entries.into_iter().filter_map(normalize_entry).collect();
        Ok(FeedFetch::Fetched {
            items,
            etag,
            last_modified,
        })
    }
}

fn header_string(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// ------------------------------------------------------------
// Parsing (RSS 2.0 and Atom, detected by root element)
// ------------------------------------------------------------

/// Source-format-independent view of one feed entry.
#[derive(Debug, Default, Clone)]
pub struct FeedEntry {
    pub title: String,
    pub link: Option<String>,
    pub published: Option<String>,
    pub content_encoded: Option<String>,
    pub content: Option<String>,
    pub description: Option<String>,
    pub summary: Option<String>,
    /// From media:content / media:thumbnail.
    pub media_url: Option<String>,
    /// From an enclosure with an image MIME type only.
    pub enclosure_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "encoded")]
    content_encoded: Option<String>,
    content: Option<String>,
    enclosure: Option<RssEnclosure>,
    #[serde(rename = "media:content")]
    media_content: Option<MediaRef>,
    #[serde(rename = "media:thumbnail")]
    media_thumbnail: Option<MediaRef>,
}

#[derive(Debug, Deserialize)]
struct RssEnclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    mime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaRef {
    #[serde(rename = "@url")]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<String>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

/// Parse a feed document, RSS first, Atom as fallback.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let cleaned = scrub_html_entities_for_xml(xml);
    if let Ok(rss) = from_str::<Rss>(&cleaned) {
        return Ok(rss.channel.items.into_iter().map(FeedEntry::from_rss).collect());
    }
    let atom: AtomFeed = from_str(&cleaned).context("parsing feed as RSS then Atom")?;
    Ok(atom.entries.into_iter().map(FeedEntry::from_atom).collect())
}

impl FeedEntry {
    fn from_rss(item: RssItem) -> Self {
        let enclosure_image_url = item.enclosure.and_then(|e| {
            let is_image = e
                .mime
                .as_deref()
                .map(|m| m.starts_with("image/"))
                .unwrap_or(false);
            if is_image {
                e.url
            } else {
                None
            }
        });
        FeedEntry {
            title: item.title.unwrap_or_default(),
            link: item.link,
            published: item.pub_date,
            content_encoded: item.content_encoded,
            content: item.content,
            description: item.description,
            summary: None,
            media_url: item
                .media_content
                .and_then(|m| m.url)
                .or(item.media_thumbnail.and_then(|m| m.url)),
            enclosure_image_url,
        }
    }

    fn from_atom(entry: AtomEntry) -> Self {
        // prefer the alternate link, else the first link carrying an href
        let link = entry
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .and_then(|l| l.href.clone())
            .or_else(|| entry.links.iter().find_map(|l| l.href.clone()));
        FeedEntry {
            title: entry.title.unwrap_or_default(),
            link,
            published: entry.published.or(entry.updated),
            content_encoded: None,
            content: entry.content,
            description: None,
            summary: entry.summary,
            media_url: None,
            enclosure_image_url: None,
        }
    }

    /// Raw HTML body chosen by priority: full encoded content, content,
    /// description, summary.
    fn body_html(&self) -> Option<&str> {
        [
            self.content_encoded.as_deref(),
            self.content.as_deref(),
            self.description.as_deref(),
            self.summary.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
    }
}

/// Normalize one entry into the shared article shape. Entries without a
/// link cannot become articles (the canonical URL is the identity).
pub fn normalize_entry(entry: FeedEntry) -> Option<ExtractedArticle> {
    let link = entry.link.as_deref()?.trim().to_string();
    if link.is_empty() {
        return None;
    }
    let title = sanitize_text(&html_escape::decode_html_entities(&entry.title));

    let body_html = entry.body_html().unwrap_or_default().to_string();
    let content = html_to_plain_text(&body_html);
    let summary = entry
        .summary
        .as_deref()
        .or(entry.description.as_deref())
        .map(html_to_plain_text)
        .map(|t| truncate_chars(&t, SUMMARY_MAX_CHARS))
        .unwrap_or_default();

    let image_url = entry
        .media_url
        .clone()
        .or_else(|| entry.enclosure_image_url.clone())
        .or_else(|| first_img_src(&body_html))
        .and_then(|raw| crate::extract::resolve_url(&link, &raw));

    let published_at = entry.published.as_deref().and_then(parse_datetime);
    let partial = content.chars().count() < PARTIAL_MIN_CHARS;

    Some(ExtractedArticle {
        title,
        url: link,
        published_at,
        content,
        summary,
        image_url,
        partial,
    })
}

/// First `<img src>` in the raw entry body.
fn first_img_src(html: &str) -> Option<String> {
    static RE_IMG: OnceCell<Regex> = OnceCell::new();
    let re = RE_IMG.get_or_init(|| {
        Regex::new(r#"(?is)<img[^>]+src\s*=\s*["']([^"']+)["']"#).unwrap()
    });
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Feed dates come as RFC 2822 (RSS) or RFC 3339 (Atom).
pub(crate) fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    let parsed = OffsetDateTime::parse(raw, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(raw, &Rfc3339))
        .ok()?;
    DateTime::<Utc>::from_timestamp(parsed.unix_timestamp(), parsed.nanosecond())
}

/// Feeds routinely embed HTML entities that are not valid XML entities.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS_FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:media="http://search.yahoo.com/mrss/">
  <channel>
    <title>Haberler</title>
    <item>
      <title>Merkez Bankası faiz kararını açıkladı</title>
      <link>https://haber.example/ekonomi/faiz</link>
      <pubDate>Mon, 03 Aug 2026 10:30:00 +0300</pubDate>
      <description>Kısa açıklama</description>
      <content:encoded><![CDATA[<p>Uzun içerik metni burada yer alıyor ve yeterince ayrıntılı.</p><img src="/foto/karar.jpg">]]></content:encoded>
    </item>
    <item>
      <title>Kısa haber</title>
      <link>https://haber.example/kisa</link>
      <description>Tek cümle.</description>
      <enclosure url="https://cdn.example/gorsel.png" type="image/png"/>
    </item>
    <item>
      <title>Bağlantısız</title>
      <description>Atlanmalı.</description>
    </item>
  </channel>
</rss>"#;

    const ATOM_FIXTURE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Duyurular</title>
  <entry>
    <title>Yeni sürüm duyurusu</title>
    <link rel="alternate" href="https://blog.example/duyuru"/>
    <published>2026-08-01T09:00:00Z</published>
    <summary>Sürüm notları özeti</summary>
  </entry>
</feed>"#;

    #[test]
    fn rss_items_parse_with_content_priority() {
        let entries = parse_feed(RSS_FIXTURE).unwrap();
        assert_eq!(entries.len(), 3);

        let article = normalize_entry(entries[0].clone()).unwrap();
        assert_eq!(article.url, "https://haber.example/ekonomi/faiz");
        // content:encoded wins over description
        assert!(article.content.contains("Uzun içerik"));
        assert!(!article.content.contains("<p>"));
        assert_eq!(article.summary, "Kısa açıklama");
        assert!(article.published_at.is_some());
        // image resolved from the content's first <img src>
        assert_eq!(
            article.image_url.as_deref(),
            Some("https://haber.example/foto/karar.jpg")
        );
    }

    #[test]
    fn short_item_is_partial_and_enclosure_image_used() {
        let entries = parse_feed(RSS_FIXTURE).unwrap();
        let article = normalize_entry(entries[1].clone()).unwrap();
        assert!(article.partial);
        assert_eq!(article.image_url.as_deref(), Some("https://cdn.example/gorsel.png"));
    }

    #[test]
    fn linkless_item_is_dropped() {
        let entries = parse_feed(RSS_FIXTURE).unwrap();
        assert!(normalize_entry(entries[2].clone()).is_none());
    }

    #[test]
    fn atom_feed_parses_with_rfc3339_dates() {
        let entries = parse_feed(ATOM_FIXTURE).unwrap();
        assert_eq!(entries.len(), 1);
        let article = normalize_entry(entries[0].clone()).unwrap();
        assert_eq!(article.url, "https://blog.example/duyuru");
        assert_eq!(article.title, "Yeni sürüm duyurusu");
        assert!(article.published_at.is_some());
        assert_eq!(article.summary, "Sürüm notları özeti");
    }

    #[test]
    fn non_image_enclosure_is_ignored() {
        let xml = r#"<rss><channel><item>
            <title>Ses</title>
            <link>https://x.example/podcast</link>
            <description>bölüm</description>
            <enclosure url="https://x.example/ep.mp3" type="audio/mpeg"/>
        </item></channel></rss>"#;
        let entries = parse_feed(xml).unwrap();
        let article = normalize_entry(entries[0].clone()).unwrap();
        assert!(article.image_url.is_none());
    }

    #[test]
    fn datetime_parsing_both_formats() {
        assert!(parse_datetime("Mon, 03 Aug 2026 10:30:00 +0300").is_some());
        assert!(parse_datetime("2026-08-01T09:00:00Z").is_some());
        assert!(parse_datetime("yarın").is_none());
    }
}
