//! Blog-or-not judgments over a [`SiteSummary`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{JudgeBackend, JudgeConfig};
use crate::features::{looks_like_blog, SiteSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_blog: bool,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judgment unavailable: {0}")]
    Unavailable(String),
    #[error("malformed judgment: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait BlogJudge: Send + Sync {
    fn name(&self) -> &str;
    async fn judge(&self, summary: &SiteSummary) -> Result<Verdict, JudgeError>;
}

/// Offline judge: weighted page features, no network.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureJudge;

#[async_trait]
impl BlogJudge for FeatureJudge {
    fn name(&self) -> &str {
        "features"
    }

    async fn judge(&self, summary: &SiteSummary) -> Result<Verdict, JudgeError> {
        Ok(Verdict {
            is_blog: looks_like_blog(summary),
            name: None,
        })
    }
}

const SYSTEM_PROMPT: &str = "You classify websites. Decide whether the described site is a \
personal or independent blog run by an individual (not a company site, news portal, forum, \
shop, directory or aggregator). Answer with a single JSON object and nothing else: \
{\"is_blog\": true|false, \"name\": \"<site name or null>\"}.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Judge backed by an OpenAI-compatible chat completion endpoint.
pub struct LlmJudge {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl LlmJudge {
    pub fn new(config: &JudgeConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("BLOGLINK_JUDGE_API_KEY is required for the llm judge")?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building judge http client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            timeout: config.timeout,
        })
    }

    fn headers(&self) -> Result<HeaderMap, JudgeError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| JudgeError::Unavailable(format!("invalid api key header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn complete(&self, summary: &SiteSummary) -> Result<String, JudgeError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: summary.to_prompt(),
                },
            ],
            temperature: 0.0,
        };

        debug!(model = %self.model, url = %summary.url, "judge request");
        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| JudgeError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(JudgeError::Unavailable(format!("judge api error ({status}): {body}")));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| JudgeError::Malformed(format!("response body: {e}")))?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| JudgeError::Malformed("no choices in response".to_string()))
    }
}

#[async_trait]
impl BlogJudge for LlmJudge {
    fn name(&self) -> &str {
        "llm"
    }

    async fn judge(&self, summary: &SiteSummary) -> Result<Verdict, JudgeError> {
        let content = tokio::time::timeout(self.timeout, self.complete(summary))
            .await
            .map_err(|_| JudgeError::Unavailable(format!("timed out after {:?}", self.timeout)))??;
        parse_verdict(&content)
    }
}

/// Read a verdict out of model output, tolerating code fences and chatter
/// around the JSON object.
pub fn parse_verdict(content: &str) -> Result<Verdict, JudgeError> {
    let trimmed = content.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &trimmed[s..=e],
        _ => {
            return Err(JudgeError::Malformed(format!(
                "no json object in `{}`",
                trimmed.chars().take(80).collect::<String>()
            )))
        }
    };
    let mut verdict: Verdict =
        serde_json::from_str(json).map_err(|e| JudgeError::Malformed(e.to_string()))?;
    verdict.name = verdict
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && !n.eq_ignore_ascii_case("null"));
    Ok(verdict)
}

/// The configured judge; the llm backend without an api key degrades to features.
pub fn judge_from_config(config: &JudgeConfig) -> anyhow::Result<Box<dyn BlogJudge>> {
    match config.backend {
        JudgeBackend::Llm if config.api_key.is_some() => Ok(Box::new(LlmJudge::new(config)?)),
        JudgeBackend::Llm => {
            tracing::warn!("llm judge selected without BLOGLINK_JUDGE_API_KEY; using feature judge");
            Ok(Box::new(FeatureJudge))
        }
        JudgeBackend::Features => Ok(Box::new(FeatureJudge)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_verdict() {
        let v = parse_verdict(r#"{"is_blog": true, "name": "Tiny Notes"}"#).unwrap();
        assert!(v.is_blog);
        assert_eq!(v.name.as_deref(), Some("Tiny Notes"));
    }

    #[test]
    fn fenced_verdict_with_null_name() {
        let v = parse_verdict("```json\n{\"is_blog\": false, \"name\": null}\n```").unwrap();
        assert_eq!(
            v,
            Verdict {
                is_blog: false,
                name: None
            }
        );
    }

    #[test]
    fn blank_and_literal_null_names_are_dropped() {
        let v = parse_verdict(r#"Sure! {"is_blog": true, "name": "  null "}"#).unwrap();
        assert_eq!(v.name, None);
        let v = parse_verdict(r#"{"is_blog": true}"#).unwrap();
        assert_eq!(v.name, None);
    }

    #[test]
    fn prose_without_json_is_malformed() {
        assert!(matches!(parse_verdict("yes, it is a blog"), Err(JudgeError::Malformed(_))));
        assert!(matches!(parse_verdict(r#"{"blog": "maybe"}"#), Err(JudgeError::Malformed(_))));
    }

    #[tokio::test]
    async fn feature_judge_never_fails() {
        let verdict = FeatureJudge.judge(&SiteSummary::default()).await.unwrap();
        assert!(!verdict.is_blog);
    }

    #[test]
    fn llm_backend_without_key_degrades() {
        let config = JudgeConfig {
            backend: JudgeBackend::Llm,
            base_url: "http://localhost:1".into(),
            api_key: None,
            model: "m".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(judge_from_config(&config).unwrap().name(), "features");
        let with_key = JudgeConfig {
            api_key: Some("k".into()),
            ..config
        };
        assert_eq!(judge_from_config(&with_key).unwrap().name(), "llm");
    }
}
