// src/store.rs
//! Persistence collaborator. The pipeline only needs the operations below;
//! the real storage layer must enforce uniqueness on `Article::source_hash`
//! so the exact-dedup stage is race-safe. `MemoryStore` is the reference
//! implementation used by the binary and by tests.

use crate::model::{
    source_hash, url_hash, Article, ArticleGroup, CrawlJob, ExtractedArticle, JobStatus, Owner,
    Source, SourceStatus, TriggerReason, WatchKeyword, WatchMatch,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of an article insert attempt.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Article),
    /// An article with the same (source, url) hash already exists,
    /// including the case where a concurrent insert won the race.
    Duplicate,
}

/// What a finished crawl reports back for health bookkeeping.
#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- articles --
    async fn insert_article(&self, source_id: i64, item: ExtractedArticle)
        -> Result<InsertOutcome>;
    async fn article(&self, id: i64) -> Result<Option<Article>>;
    /// Recent articles for duplicate-candidate retrieval, newest first.
    async fn recent_articles(
        &self,
        exclude_source: Option<i64>,
        since: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<Article>>;
    async fn mark_article_analyzed(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    async fn unanalyzed_since(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Article>>;
    async fn purge_articles_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // -- groups --
    async fn create_group(&self, representative: &Article) -> Result<ArticleGroup>;
    async fn group(&self, id: i64) -> Result<Option<ArticleGroup>>;
    /// Attach an article to a group, bump the member count, and refresh the
    /// representative fields if the newcomer carries longer content.
    async fn link_to_group(&self, article_id: i64, group_id: i64, similarity: f64) -> Result<()>;

    // -- sources --
    async fn source(&self, id: i64) -> Result<Option<Source>>;
    async fn sources_with_status(&self, status: SourceStatus) -> Result<Vec<Source>>;
    async fn set_source_status(&self, id: i64, status: SourceStatus) -> Result<()>;
    /// Read-modify-write of the health counters; serialized by the store.
    async fn record_crawl_outcome(&self, id: i64, outcome: CrawlOutcome) -> Result<SourceStatus>;
    async fn set_feed_validators(
        &self,
        id: i64,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Result<()>;

    // -- watch --
    async fn active_keywords_for(&self, owner: Owner) -> Result<Vec<WatchKeyword>>;
    async fn upsert_watch_match(&self, m: WatchMatch) -> Result<()>;
    async fn watch_matches_for(&self, article_id: i64) -> Result<Vec<WatchMatch>>;

    // -- crawl job audit --
    async fn create_job(&self, source_id: i64, trigger: TriggerReason) -> Result<CrawlJob>;
    async fn job_running(&self, id: i64) -> Result<()>;
    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        items_found: u32,
        items_inserted: u32,
        error: Option<String>,
    ) -> Result<()>;
    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

pub type SharedStore = Arc<dyn Store>;

#[derive(Default)]
struct Tables {
    sources: HashMap<i64, Source>,
    articles: HashMap<i64, Article>,
    /// source_hash -> article id; the uniqueness constraint.
    article_hashes: HashMap<String, i64>,
    groups: HashMap<i64, ArticleGroup>,
    keywords: HashMap<i64, WatchKeyword>,
    matches: HashMap<(i64, i64), WatchMatch>,
    jobs: HashMap<i64, CrawlJob>,
}

/// Mutexed in-memory store. All read-modify-writes happen under one lock,
/// which also stands in for the storage-layer uniqueness constraint.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Test/bootstrap helper: register a source as-is (id assigned).
    pub async fn add_source(&self, mut source: Source) -> i64 {
        let id = self.next_id();
        source.id = id;
        self.tables.lock().await.sources.insert(id, source);
        id
    }

    /// Test/bootstrap helper: register a watch keyword (id assigned).
    pub async fn add_keyword(&self, mut kw: WatchKeyword) -> i64 {
        let id = self.next_id();
        kw.id = id;
        self.tables.lock().await.keywords.insert(id, kw);
        id
    }

    pub async fn article_count(&self) -> usize {
        self.tables.lock().await.articles.len()
    }

    pub async fn group_count(&self) -> usize {
        self.tables.lock().await.groups.len()
    }

    pub async fn job(&self, id: i64) -> Option<CrawlJob> {
        self.tables.lock().await.jobs.get(&id).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_article(
        &self,
        source_id: i64,
        item: ExtractedArticle,
    ) -> Result<InsertOutcome> {
        let mut t = self.tables.lock().await;
        let hash = source_hash(source_id, &item.url);
        if t.article_hashes.contains_key(&hash) {
            return Ok(InsertOutcome::Duplicate);
        }
        let id = self.next_id();
        let article = Article {
            id,
            source_id,
            title: item.title,
            url: item.url.clone(),
            published_at: item.published_at,
            content: item.content,
            summary: item.summary,
            image_url: item.image_url,
            partial: item.partial,
            source_hash: hash.clone(),
            url_hash: url_hash(&item.url),
            group_id: None,
            group_similarity: None,
            read: false,
            analyzed: false,
            analyzed_at: None,
            created_at: Utc::now(),
        };
        t.article_hashes.insert(hash, id);
        t.articles.insert(id, article.clone());
        Ok(InsertOutcome::Inserted(article))
    }

    async fn article(&self, id: i64) -> Result<Option<Article>> {
        Ok(self.tables.lock().await.articles.get(&id).cloned())
    }

    async fn recent_articles(
        &self,
        exclude_source: Option<i64>,
        since: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<Article>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Article> = t
            .articles
            .values()
            .filter(|a| a.created_at >= since)
            .filter(|a| exclude_source != Some(a.source_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out.truncate(cap);
        Ok(out)
    }

    async fn mark_article_analyzed(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.lock().await;
        let a = t
            .articles
            .get_mut(&id)
            .ok_or_else(|| anyhow!("article {id} not found"))?;
        a.analyzed = true;
        a.analyzed_at = Some(at);
        Ok(())
    }

    async fn unanalyzed_since(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Article>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Article> = t
            .articles
            .values()
            .filter(|a| !a.analyzed && a.created_at >= cutoff)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.id);
        out.truncate(limit);
        Ok(out)
    }

    async fn purge_articles_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut t = self.tables.lock().await;
        let doomed: Vec<i64> = t
            .articles
            .values()
            .filter(|a| a.created_at < cutoff)
            .map(|a| a.id)
            .collect();
        for id in &doomed {
            if let Some(a) = t.articles.remove(id) {
                t.article_hashes.remove(&a.source_hash);
            }
        }
        Ok(doomed.len())
    }

    async fn create_group(&self, representative: &Article) -> Result<ArticleGroup> {
        let mut t = self.tables.lock().await;
        let id = self.next_id();
        let group = ArticleGroup {
            id,
            title: representative.title.clone(),
            content: representative.content.clone(),
            summary: representative.summary.clone(),
            image_url: representative.image_url.clone(),
            member_count: 0,
            created_at: Utc::now(),
        };
        t.groups.insert(id, group.clone());
        Ok(group)
    }

    async fn group(&self, id: i64) -> Result<Option<ArticleGroup>> {
        Ok(self.tables.lock().await.groups.get(&id).cloned())
    }

    async fn link_to_group(&self, article_id: i64, group_id: i64, similarity: f64) -> Result<()> {
        let mut t = self.tables.lock().await;
        if !t.groups.contains_key(&group_id) {
            return Err(anyhow!("group {group_id} not found"));
        }
        let (title, content, summary, image) = {
            let a = t
                .articles
                .get_mut(&article_id)
                .ok_or_else(|| anyhow!("article {article_id} not found"))?;
            a.group_id = Some(group_id);
            a.group_similarity = Some(similarity);
            (
                a.title.clone(),
                a.content.clone(),
                a.summary.clone(),
                a.image_url.clone(),
            )
        };
        if let Some(g) = t.groups.get_mut(&group_id) {
            g.member_count += 1;
            if content.len() > g.content.len() {
                g.title = title;
                g.content = content;
                g.summary = summary;
                g.image_url = image;
            }
        }
        Ok(())
    }

    async fn source(&self, id: i64) -> Result<Option<Source>> {
        Ok(self.tables.lock().await.sources.get(&id).cloned())
    }

    async fn sources_with_status(&self, status: SourceStatus) -> Result<Vec<Source>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Source> = t
            .sources
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    async fn set_source_status(&self, id: i64, status: SourceStatus) -> Result<()> {
        let mut t = self.tables.lock().await;
        let s = t
            .sources
            .get_mut(&id)
            .ok_or_else(|| anyhow!("source {id} not found"))?;
        s.status = status;
        if status == SourceStatus::Active {
            s.health.consecutive_failures = 0;
        }
        Ok(())
    }

    async fn record_crawl_outcome(&self, id: i64, outcome: CrawlOutcome) -> Result<SourceStatus> {
        let mut t = self.tables.lock().await;
        let s = t
            .sources
            .get_mut(&id)
            .ok_or_else(|| anyhow!("source {id} not found"))?;
        s.apply_crawl_outcome(outcome.success, outcome.duration_ms, outcome.error);
        Ok(s.status)
    }

    async fn set_feed_validators(
        &self,
        id: i64,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        let s = t
            .sources
            .get_mut(&id)
            .ok_or_else(|| anyhow!("source {id} not found"))?;
        if let Some(feed) = s.feed.as_mut() {
            feed.last_etag = etag;
            feed.last_modified = last_modified;
        }
        Ok(())
    }

    async fn active_keywords_for(&self, owner: Owner) -> Result<Vec<WatchKeyword>> {
        let t = self.tables.lock().await;
        let mut out: Vec<WatchKeyword> = t
            .keywords
            .values()
            .filter(|k| k.active)
            .filter(|k| match owner {
                Owner::System => true,
                Owner::User(uid) => k.user_id == uid,
            })
            .cloned()
            .collect();
        out.sort_by_key(|k| k.id);
        Ok(out)
    }

    async fn upsert_watch_match(&self, m: WatchMatch) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.matches.insert((m.article_id, m.keyword_id), m);
        Ok(())
    }

    async fn watch_matches_for(&self, article_id: i64) -> Result<Vec<WatchMatch>> {
        let t = self.tables.lock().await;
        let mut out: Vec<WatchMatch> = t
            .matches
            .values()
            .filter(|m| m.article_id == article_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.keyword_id);
        Ok(out)
    }

    async fn create_job(&self, source_id: i64, trigger: TriggerReason) -> Result<CrawlJob> {
        let mut t = self.tables.lock().await;
        let id = self.next_id();
        let job = CrawlJob {
            id,
            source_id,
            status: JobStatus::Pending,
            triggered_by: trigger,
            items_found: 0,
            items_inserted: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        };
        t.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn job_running(&self, id: i64) -> Result<()> {
        let mut t = self.tables.lock().await;
        let j = t
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        j.status = JobStatus::Running;
        j.started_at = Utc::now();
        Ok(())
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        items_found: u32,
        items_inserted: u32,
        error: Option<String>,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        let j = t
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        let now = Utc::now();
        j.status = status;
        j.items_found = items_found;
        j.items_inserted = items_inserted;
        j.error = error;
        j.finished_at = Some(now);
        j.duration_ms = Some(
            now.signed_duration_since(j.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        Ok(())
    }

    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut t = self.tables.lock().await;
        let before = t.jobs.len();
        t.jobs
            .retain(|_, j| j.finished_at.map(|f| f >= cutoff).unwrap_or(true));
        Ok(before - t.jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;

    fn selector_source(name: &str) -> Source {
        Source {
            id: 0,
            name: name.into(),
            url: format!("https://{name}.example"),
            kind: SourceKind::Selector,
            owner: Owner::System,
            refresh_interval_secs: 300,
            selectors: None,
            feed: None,
            status: SourceStatus::Active,
            health: Default::default(),
        }
    }

    fn item(url: &str, content: &str) -> ExtractedArticle {
        ExtractedArticle {
            title: "Title".into(),
            url: url.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn same_source_url_inserts_once() {
        let store = MemoryStore::new();
        let sid = store.add_source(selector_source("a")).await;
        let first = store
            .insert_article(sid, item("https://a.example/p/1", "body"))
            .await
            .unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        let second = store
            .insert_article(sid, item("https://a.example/p/1", "body"))
            .await
            .unwrap();
        assert!(matches!(second, InsertOutcome::Duplicate));
        assert_eq!(store.article_count().await, 1);
    }

    #[tokio::test]
    async fn link_to_group_refreshes_representative_on_longer_content() {
        let store = MemoryStore::new();
        let sid_a = store.add_source(selector_source("a")).await;
        let sid_b = store.add_source(selector_source("b")).await;
        let InsertOutcome::Inserted(short) = store
            .insert_article(sid_a, item("https://a.example/1", "short"))
            .await
            .unwrap()
        else {
            panic!("insert failed")
        };
        let InsertOutcome::Inserted(long) = store
            .insert_article(sid_b, item("https://b.example/1", "a much longer body text"))
            .await
            .unwrap()
        else {
            panic!("insert failed")
        };

        let group = store.create_group(&short).await.unwrap();
        store.link_to_group(short.id, group.id, 1.0).await.unwrap();
        store.link_to_group(long.id, group.id, 0.85).await.unwrap();

        let g = store.group(group.id).await.unwrap().unwrap();
        assert_eq!(g.member_count, 2);
        assert_eq!(g.content, "a much longer body text");
    }

    #[tokio::test]
    async fn keyword_scoping_by_owner() {
        let store = MemoryStore::new();
        for (uid, term, active) in [(1, "van", true), (2, "ankara", true), (1, "izmir", false)] {
            store
                .add_keyword(WatchKeyword {
                    id: 0,
                    user_id: uid,
                    term: term.into(),
                    description: None,
                    active,
                    color: None,
                })
                .await;
        }
        let all = store.active_keywords_for(Owner::System).await.unwrap();
        assert_eq!(all.len(), 2);
        let mine = store.active_keywords_for(Owner::User(1)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].term, "van");
    }
}
