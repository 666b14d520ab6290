// src/judge.rs
//! Semantic judge: an LLM-backed collaborator returning structured
//! same-story and relevance verdicts. The pipeline must keep working when
//! the judge is unavailable (hash-only / lexical-only mode), so every
//! caller treats judge errors as "no verdict", never as a job failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::JudgeConfig;

/// Verdict for "do these two articles report the same event?".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryVerdict {
    pub is_same_news: bool,
    pub similarity: f64,
    pub reason: String,
}

/// Verdict for "is this article contextually relevant to this keyword?".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelevanceVerdict {
    pub is_relevant: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Fields recovered by the LLM fallback for partial selector articles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveredFields {
    pub title: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Error)]
pub enum JudgeError {
    /// Provider rate limit / quota; the only class worth local retry.
    #[error("judge rate limited")]
    RateLimited,
    #[error("judge unavailable: {0}")]
    Unavailable(String),
    #[error("judge returned malformed output: {0}")]
    Malformed(String),
}

impl JudgeError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, JudgeError::RateLimited)
    }
}

/// One article side of a same-story comparison.
#[derive(Debug, Clone)]
pub struct StorySide<'a> {
    pub title: &'a str,
    pub content: &'a str,
}

#[async_trait]
pub trait SemanticJudge: Send + Sync {
    async fn same_story(
        &self,
        a: StorySide<'_>,
        b: StorySide<'_>,
    ) -> Result<StoryVerdict, JudgeError>;

    async fn relevance(
        &self,
        term: &str,
        description: Option<&str>,
        title: &str,
        summary: &str,
        content: &str,
    ) -> Result<RelevanceVerdict, JudgeError>;

    /// Recover article fields from markdown-reduced page text.
    async fn extract_fields(&self, markdown: &str) -> Result<RecoveredFields, JudgeError>;

    /// Whether real verdicts can be produced at all. `false` puts the
    /// pipeline into lexical-only mode without wasting calls.
    fn available(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &'static str;
}

pub type SharedJudge = Arc<dyn SemanticJudge>;

/// Build a judge from config. Unknown or disabled providers yield the
/// disabled judge, never an error.
pub fn build_judge(cfg: &JudgeConfig) -> SharedJudge {
    if !cfg.enabled {
        return Arc::new(DisabledJudge);
    }
    match cfg.provider.as_deref() {
        Some("openai") => {
            let key = match cfg.api_key.as_deref() {
                Some("ENV") | None => std::env::var("OPENAI_API_KEY").unwrap_or_default(),
                Some(k) => k.to_string(),
            };
            Arc::new(OpenAiJudge::new(key, cfg.model.as_deref()))
        }
        _ => Arc::new(DisabledJudge),
    }
}

/// Collapse whitespace and cap length; verdicts carry short rationales,
/// not prose. Unicode is preserved (titles are frequently non-ASCII).
pub fn sanitize_reason(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(200));
    let mut prev_space = false;
    for ch in input.chars() {
        let c = if ch.is_whitespace() { ' ' } else { ch };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.chars().count() >= 200 {
            break;
        }
    }
    out.trim().to_string()
}

// ------------------------------------------------------------
// OpenAI-compatible provider
// ------------------------------------------------------------

pub struct OpenAiJudge {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiJudge {
    pub fn new(api_key: String, model_override: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("newswatch/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key,
            model: model_override.unwrap_or("gpt-4o-mini").to_string(),
        }
    }

    async fn chat_json(&self, system: &str, user: &str) -> Result<serde_json::Value, JudgeError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            response_format: serde_json::Value,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system,
                },
                Msg {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.1,
            response_format: serde_json::json!({"type": "json_object"}),
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| JudgeError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(JudgeError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let lowered = body.to_ascii_lowercase();
            if lowered.contains("rate limit") || lowered.contains("quota") {
                return Err(JudgeError::RateLimited);
            }
            return Err(JudgeError::Unavailable(format!("http {status}")));
        }
        let body: Resp = resp
            .json()
            .await
            .map_err(|e| JudgeError::Malformed(e.to_string()))?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        serde_json::from_str(content).map_err(|e| JudgeError::Malformed(e.to_string()))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[async_trait]
impl SemanticJudge for OpenAiJudge {
    async fn same_story(
        &self,
        a: StorySide<'_>,
        b: StorySide<'_>,
    ) -> Result<StoryVerdict, JudgeError> {
        let system = "You compare two news articles and decide whether they report the \
                      same real-world event. Respond with a JSON object: \
                      {\"isSameNews\": bool, \"similarity\": number 0-1, \"reason\": short string}.";
        let user = format!(
            "Article 1 title: {}\nArticle 1 lead: {}\n\nArticle 2 title: {}\nArticle 2 lead: {}",
            a.title,
            truncate_chars(a.content, 400),
            b.title,
            truncate_chars(b.content, 400),
        );
        let v = self.chat_json(system, &user).await?;
        let is_same = v
            .get("isSameNews")
            .and_then(|x| x.as_bool())
            .ok_or_else(|| JudgeError::Malformed("missing isSameNews".into()))?;
        let similarity = v
            .get("similarity")
            .and_then(|x| x.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let reason = sanitize_reason(v.get("reason").and_then(|x| x.as_str()).unwrap_or(""));
        Ok(StoryVerdict {
            is_same_news: is_same,
            similarity,
            reason,
        })
    }

    async fn relevance(
        &self,
        term: &str,
        description: Option<&str>,
        title: &str,
        summary: &str,
        content: &str,
    ) -> Result<RelevanceVerdict, JudgeError> {
        let system = "You decide whether a news article is contextually about a watch topic. \
                      A topic term appearing only as a substring of an unrelated word does NOT \
                      count. Respond with a JSON object: \
                      {\"isRelevant\": bool, \"confidence\": number 0-1, \"reason\": short string}.";
        let hint = description
            .map(|d| format!(" (hint: {d})"))
            .unwrap_or_default();
        let user = format!(
            "Topic: {term}{hint}\n\nTitle: {title}\nSummary: {summary}\nContent: {}",
            truncate_chars(content, 600),
        );
        let v = self.chat_json(system, &user).await?;
        let is_relevant = v
            .get("isRelevant")
            .and_then(|x| x.as_bool())
            .ok_or_else(|| JudgeError::Malformed("missing isRelevant".into()))?;
        let confidence = v
            .get("confidence")
            .and_then(|x| x.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let reason = sanitize_reason(v.get("reason").and_then(|x| x.as_str()).unwrap_or(""));
        Ok(RelevanceVerdict {
            is_relevant,
            confidence,
            reason,
        })
    }

    async fn extract_fields(&self, markdown: &str) -> Result<RecoveredFields, JudgeError> {
        let system = "Extract news article fields from the page text. Respond with a JSON \
                      object: {\"title\": string|null, \"content\": string|null, \
                      \"summary\": string|null}. Do not invent text that is not present.";
        let user = truncate_chars(markdown, 6000);
        let v = self.chat_json(system, &user).await?;
        Ok(RecoveredFields {
            title: v
                .get("title")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
            content: v
                .get("content")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
            summary: v
                .get("summary")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
        })
    }

    fn available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

// ------------------------------------------------------------
// Disabled judge
// ------------------------------------------------------------

/// Used when no provider is configured; keeps the pipeline in
/// lexical-only mode.
pub struct DisabledJudge;

#[async_trait]
impl SemanticJudge for DisabledJudge {
    async fn same_story(
        &self,
        _a: StorySide<'_>,
        _b: StorySide<'_>,
    ) -> Result<StoryVerdict, JudgeError> {
        Err(JudgeError::Unavailable("judge disabled".into()))
    }

    async fn relevance(
        &self,
        _term: &str,
        _description: Option<&str>,
        _title: &str,
        _summary: &str,
        _content: &str,
    ) -> Result<RelevanceVerdict, JudgeError> {
        Err(JudgeError::Unavailable("judge disabled".into()))
    }

    async fn extract_fields(&self, _markdown: &str) -> Result<RecoveredFields, JudgeError> {
        Err(JudgeError::Unavailable("judge disabled".into()))
    }

    fn available(&self) -> bool {
        false
    }

    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

// ------------------------------------------------------------
// Scripted judge for tests
// ------------------------------------------------------------

/// Deterministic judge for tests: pops scripted same-story verdicts in
/// order (repeating the last one when the script runs dry) and counts
/// every call so tests can assert how many semantic calls were spent.
pub struct MockJudge {
    story_script: Mutex<Vec<StoryVerdict>>,
    relevance_verdict: RelevanceVerdict,
    story_calls: AtomicUsize,
    relevance_calls: AtomicUsize,
    fail_with_rate_limit: bool,
}

impl MockJudge {
    pub fn same_story_always(similarity: f64) -> Self {
        Self::scripted(vec![StoryVerdict {
            is_same_news: similarity >= 0.5,
            similarity,
            reason: "scripted".into(),
        }])
    }

    pub fn scripted(mut verdicts: Vec<StoryVerdict>) -> Self {
        verdicts.reverse(); // pop() yields them in the given order
        Self {
            story_script: Mutex::new(verdicts),
            relevance_verdict: RelevanceVerdict {
                is_relevant: false,
                confidence: 0.0,
                reason: "scripted".into(),
            },
            story_calls: AtomicUsize::new(0),
            relevance_calls: AtomicUsize::new(0),
            fail_with_rate_limit: false,
        }
    }

    pub fn with_relevance(mut self, is_relevant: bool, confidence: f64) -> Self {
        self.relevance_verdict = RelevanceVerdict {
            is_relevant,
            confidence,
            reason: "scripted".into(),
        };
        self
    }

    pub fn rate_limited() -> Self {
        let mut m = Self::scripted(vec![]);
        m.fail_with_rate_limit = true;
        m
    }

    pub fn story_calls(&self) -> usize {
        self.story_calls.load(Ordering::SeqCst)
    }

    pub fn relevance_calls(&self) -> usize {
        self.relevance_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticJudge for MockJudge {
    async fn same_story(
        &self,
        _a: StorySide<'_>,
        _b: StorySide<'_>,
    ) -> Result<StoryVerdict, JudgeError> {
        self.story_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_rate_limit {
            return Err(JudgeError::RateLimited);
        }
        let mut script = self.story_script.lock().await;
        match script.len() {
            0 => Err(JudgeError::Unavailable("script exhausted".into())),
            1 => Ok(script[0].clone()),
            _ => Ok(script.pop().expect("non-empty")),
        }
    }

    async fn relevance(
        &self,
        _term: &str,
        _description: Option<&str>,
        _title: &str,
        _summary: &str,
        _content: &str,
    ) -> Result<RelevanceVerdict, JudgeError> {
        self.relevance_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_rate_limit {
            return Err(JudgeError::RateLimited);
        }
        Ok(self.relevance_verdict.clone())
    }

    async fn extract_fields(&self, _markdown: &str) -> Result<RecoveredFields, JudgeError> {
        Err(JudgeError::Unavailable("not scripted".into()))
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_whitespace_and_caps() {
        let s = sanitize_reason("  aynı   olay,\n farklı kaynak  ");
        assert_eq!(s, "aynı olay, farklı kaynak");
        let long = "x".repeat(500);
        assert_eq!(sanitize_reason(&long).chars().count(), 200);
    }

    #[tokio::test]
    async fn mock_pops_script_in_order_and_counts() {
        let judge = MockJudge::scripted(vec![
            StoryVerdict {
                is_same_news: true,
                similarity: 0.95,
                reason: "a".into(),
            },
            StoryVerdict {
                is_same_news: false,
                similarity: 0.2,
                reason: "b".into(),
            },
        ]);
        let side = StorySide {
            title: "t",
            content: "c",
        };
        let v1 = judge.same_story(side.clone(), side.clone()).await.unwrap();
        assert!((v1.similarity - 0.95).abs() < 1e-9);
        let v2 = judge.same_story(side.clone(), side.clone()).await.unwrap();
        assert!((v2.similarity - 0.2).abs() < 1e-9);
        // script drained to its last entry; it repeats
        let v3 = judge.same_story(side.clone(), side).await.unwrap();
        assert!((v3.similarity - 0.2).abs() < 1e-9);
        assert_eq!(judge.story_calls(), 3);
    }

    #[test]
    fn disabled_judge_reports_unavailable() {
        assert!(!DisabledJudge.available());
    }
}
