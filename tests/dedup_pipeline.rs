// tests/dedup_pipeline.rs
//! End-to-end behavior of the layered dedup engine against the in-memory
//! store: prefilter gating, judge thresholds, early exit, verdict caching,
//! exact-title backfill and the judge-failure circuit breaker.

use std::sync::Arc;

use newswatch::cache::MemoryCache;
use newswatch::config::DedupConfig;
use newswatch::dedup::DedupEngine;
use newswatch::judge::{MockJudge, StoryVerdict};
use newswatch::model::{
    Article, ExtractedArticle, Owner, Source, SourceKind, SourceStatus,
};
use newswatch::store::{InsertOutcome, MemoryStore, Store};

fn source(name: &str) -> Source {
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

fn item(url: &str, title: &str, content: &str) -> ExtractedArticle {
    ExtractedArticle {
        title: title.into(),
        url: url.into(),
        content: content.into(),
        ..Default::default()
    }
}

fn test_cfg() -> DedupConfig {
    DedupConfig {
        judge_delay_ms: 0, // keep tests fast
        ..Default::default()
    }
}

async fn insert(store: &MemoryStore, source_id: i64, it: ExtractedArticle) -> Article {
    match store.insert_article(source_id, it).await.unwrap() {
        InsertOutcome::Inserted(a) => a,
        InsertOutcome::Duplicate => panic!("unexpected duplicate"),
    }
}

fn engine(store: &Arc<MemoryStore>, judge: &Arc<MockJudge>) -> DedupEngine {
    DedupEngine::new(
        store.clone(),
        Arc::new(MemoryCache::new()),
        judge.clone(),
        test_cfg(),
    )
}

#[tokio::test]
async fn disjoint_titles_never_reach_the_judge() {
    let store = Arc::new(MemoryStore::new());
    let sid_a = store.add_source(source("a")).await;
    let sid_b = store.add_source(source("b")).await;
    let judge = Arc::new(MockJudge::same_story_always(1.0));
    let dedup = engine(&store, &judge);

    insert(&store, sid_a, item("https://a.example/1", "Borsa güne yükselişle başladı", "x")).await;
    let fresh = insert(
        &store,
        sid_b,
        item("https://b.example/1", "Hava durumu fırtına uyarısı", "y"),
    )
    .await;

    let group = dedup.process_new(&fresh).await.unwrap();
    assert!(group.is_none());
    assert_eq!(judge.story_calls(), 0, "prefilter must gate the judge");
}

#[tokio::test]
async fn similarity_just_below_threshold_does_not_group() {
    let store = Arc::new(MemoryStore::new());
    let sid_a = store.add_source(source("a")).await;
    let sid_b = store.add_source(source("b")).await;
    let judge = Arc::new(MockJudge::same_story_always(0.79));
    let dedup = engine(&store, &judge);

    insert(&store, sid_a, item("https://a.example/1", "İstanbul'da deprem paniği", "kısa")).await;
    let fresh = insert(
        &store,
        sid_b,
        item("https://b.example/1", "İstanbul deprem ile sarsıldı", "daha uzun içerik"),
    )
    .await;

    assert!(dedup.process_new(&fresh).await.unwrap().is_none());
    assert_eq!(store.group_count().await, 0);
    assert_eq!(judge.story_calls(), 1);
}

#[tokio::test]
async fn similarity_at_threshold_groups_and_backlinks_the_match() {
    let store = Arc::new(MemoryStore::new());
    let sid_a = store.add_source(source("a")).await;
    let sid_b = store.add_source(source("b")).await;
    let judge = Arc::new(MockJudge::same_story_always(0.80));
    let dedup = engine(&store, &judge);

    let matched = insert(
        &store,
        sid_a,
        item("https://a.example/1", "İstanbul'da deprem paniği", "uzun içerik metni burada"),
    )
    .await;
    let fresh = insert(
        &store,
        sid_b,
        item("https://b.example/1", "İstanbul deprem ile sarsıldı", "kısa"),
    )
    .await;

    let group_id = dedup.process_new(&fresh).await.unwrap().expect("grouped");

    let matched = store.article(matched.id).await.unwrap().unwrap();
    let fresh = store.article(fresh.id).await.unwrap().unwrap();
    assert_eq!(matched.group_id, Some(group_id));
    assert_eq!(fresh.group_id, Some(group_id));
    // the pre-existing article is retroactively linked with similarity 1.0
    assert_eq!(matched.group_similarity, Some(1.0));
    assert_eq!(fresh.group_similarity, Some(0.80));

    // representative comes from the longer-content member
    let group = store.group(group_id).await.unwrap().unwrap();
    assert_eq!(group.content, "uzun içerik metni burada");
    assert_eq!(group.member_count, 2);
}

#[tokio::test]
async fn evaluation_stops_early_on_good_enough_match() {
    let store = Arc::new(MemoryStore::new());
    let sid_a = store.add_source(source("a")).await;
    let sid_b = store.add_source(source("b")).await;
    let sid_c = store.add_source(source("c")).await;
    let judge = Arc::new(MockJudge::scripted(vec![StoryVerdict {
        is_same_news: true,
        similarity: 0.95,
        reason: "same event".into(),
    }]));
    let dedup = engine(&store, &judge);

    // identical title sorts first in the lexical ranking
    insert(&store, sid_a, item("https://a.example/1", "Seçim sonuçları açıklandı", "aa")).await;
    insert(
        &store,
        sid_b,
        item("https://b.example/1", "Seçim sonuçları merakla bekleniyordu", "bb"),
    )
    .await;
    let fresh = insert(
        &store,
        sid_c,
        item("https://c.example/1", "Seçim sonuçları açıklandı", "cc"),
    )
    .await;

    assert!(dedup.process_new(&fresh).await.unwrap().is_some());
    assert_eq!(judge.story_calls(), 1, "0.95 verdict must stop the pass");
}

#[tokio::test]
async fn verdicts_are_cached_by_title_pair() {
    let store = Arc::new(MemoryStore::new());
    let sid_a = store.add_source(source("a")).await;
    let sid_b = store.add_source(source("b")).await;
    let judge = Arc::new(MockJudge::same_story_always(0.5));
    let dedup = engine(&store, &judge);

    insert(&store, sid_a, item("https://a.example/1", "Merkez bankası faiz kararı", "x")).await;
    let fresh = insert(
        &store,
        sid_b,
        item("https://b.example/1", "Merkez bankasından faiz açıklaması", "y"),
    )
    .await;

    assert!(dedup.process_new(&fresh).await.unwrap().is_none());
    assert_eq!(judge.story_calls(), 1);

    // same pair again: served from the 24h verdict cache
    assert!(dedup.process_new(&fresh).await.unwrap().is_none());
    assert_eq!(judge.story_calls(), 1);
}

#[tokio::test]
async fn backfill_groups_equal_titles_without_semantic_calls() {
    let store = Arc::new(MemoryStore::new());
    let sid_a = store.add_source(source("a")).await;
    let sid_b = store.add_source(source("b")).await;
    let judge = Arc::new(MockJudge::same_story_always(1.0));
    let dedup = engine(&store, &judge);

    let a = insert(&store, sid_a, item("https://a.example/1", "Deprem oldu", "içerik a")).await;
    let b = insert(
        &store,
        sid_b,
        item("https://b.example/1", "deprem  oldu", "daha uzun içerik b"),
    )
    .await;

    let report = dedup.backfill(vec![a.clone(), b.clone()]).await.unwrap();
    assert_eq!(report.exact_grouped, 2);
    assert_eq!(judge.story_calls(), 0, "exact pass must be free");

    let a = store.article(a.id).await.unwrap().unwrap();
    let b = store.article(b.id).await.unwrap().unwrap();
    assert_eq!(a.group_id, b.group_id);
    assert!(a.group_id.is_some());
    assert_eq!(a.group_similarity, Some(1.0));
    assert_eq!(b.group_similarity, Some(1.0));
}

#[tokio::test]
async fn backfill_stops_after_consecutive_judge_failures() {
    let store = Arc::new(MemoryStore::new());
    let judge = Arc::new(MockJudge::rate_limited());
    let dedup = engine(&store, &judge);

    let mut articles = Vec::new();
    for i in 0..7 {
        let sid = store.add_source(source(&format!("s{i}"))).await;
        let a = insert(
            &store,
            sid,
            item(
                &format!("https://s{i}.example/1"),
                &format!("İstanbul depreminde hasar büyük {i}"),
                "içerik",
            ),
        )
        .await;
        articles.push(a);
    }

    let report = dedup.backfill(articles).await.unwrap();
    assert!(report.aborted_by_breaker);
    assert_eq!(report.fuzzy_grouped, 0);
    assert_eq!(store.group_count().await, 0);
}
