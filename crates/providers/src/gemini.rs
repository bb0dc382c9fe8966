//! Gemini adapter implementing the key-rotating `call()` contract (C2, §4.2).
//!
//! Auth is passed per-request as a `key=` query parameter — never stored as
//! process-global state — so that concurrent callers never see another
//! caller's credential leak into their request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use swarm_domain::error::{Error, Result};
use swarm_domain::state::Usage;

use crate::rotator::KeyRotator;
use crate::traits::{Complexity, LlmClient};
use crate::util::{from_reqwest, redact_url_key};

const MAX_OUTPUT_TOKENS: u32 = 8192;
const SAFETY_BLOCKED_TEXT: &str = "[Blocked by Safety Filters]";

pub struct GeminiClient {
    base_url: String,
    rotator: Arc<KeyRotator>,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, rotator: Arc<KeyRotator>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rotator,
            http,
        })
    }

    fn generate_url(&self, model: &str, key: &str) -> String {
        format!("{}/models/{model}:generateContent?key={key}", self.base_url)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn call(
        &self,
        model: &str,
        contents: Value,
        system_instruction: Option<&str>,
        complexity: Complexity,
        max_retries: Option<u32>,
    ) -> Result<(String, Usage)> {
        let max_retries = max_retries
            .unwrap_or_else(|| 2 * self.rotator.len() as u32)
            .max(1);
        let mut last_error = String::from("no attempt completed");

        for attempt in 1..=max_retries {
            let key = self.rotator.next_key().to_string();
            let url = self.generate_url(model, &key);

            let mut body = serde_json::json!({
                "contents": contents,
                "generationConfig": {
                    "temperature": complexity.temperature(),
                    "maxOutputTokens": MAX_OUTPUT_TOKENS,
                },
            });
            if let Some(system_instruction) = system_instruction {
                body["systemInstruction"] = serde_json::json!({
                    "parts": [{"text": system_instruction}],
                });
            }

            tracing::debug!(
                attempt,
                model,
                url = %redact_url_key(&url),
                "gemini call attempt"
            );

            let resp = match self.http.post(&url).json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(Duration::from_secs(attempt.min(5) as u64)).await;
                    continue;
                }
            };
            let status = resp.status();

            if status.as_u16() == 429 {
                last_error = "HTTP 429: quota exceeded".into();
                tracing::warn!(attempt, key_tail = %tail(&key), "rate limited, rotating key");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            if status.is_server_error() {
                last_error = format!("HTTP {}", status.as_u16());
                tracing::warn!(attempt, status = status.as_u16(), "transient provider error");
                tokio::time::sleep(Duration::from_secs(attempt.min(5) as u64)).await;
                continue;
            }

            let text = resp.text().await.map_err(from_reqwest)?;

            if !status.is_success() {
                last_error = format!("HTTP {}: {text}", status.as_u16());
                tokio::time::sleep(Duration::from_secs(attempt.min(5) as u64)).await;
                continue;
            }

            let parsed: Value = serde_json::from_str(&text).map_err(Error::Json)?;

            if let Some(result) = parse_success(&parsed) {
                return Ok(result);
            }
            if let Some(reason) = safety_block_reason(&parsed) {
                tracing::warn!(reason = %reason, "response blocked by safety filters");
                return Ok((SAFETY_BLOCKED_TEXT.to_string(), Usage::default()));
            }
            last_error = "malformed response: no candidates".into();
        }

        Err(Error::AllKeysExhausted {
            key_count: self.rotator.len(),
            last_error,
        })
    }
}

fn parse_success(body: &Value) -> Option<(String, Usage)> {
    let candidate = body.get("candidates")?.as_array()?.first()?;
    let parts = candidate.get("content")?.get("parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    let usage = body
        .get("usageMetadata")
        .and_then(parse_usage)
        .unwrap_or_default();
    Some((text, usage))
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("promptTokenCount")?.as_u64()? as u32;
    let completion = v
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let total = v
        .get("totalTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or((prompt + completion) as u64) as u32;
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

fn safety_block_reason(body: &Value) -> Option<String> {
    body.get("promptFeedback")?
        .get("blockReason")?
        .as_str()
        .map(str::to_string)
}

fn tail(key: &str) -> String {
    key.chars().rev().take(4).collect::<String>().chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_candidate_text_and_usage() {
        let body = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}, {"text": " there"}]}}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15},
        });
        let (text, usage) = parse_success(&body).unwrap();
        assert_eq!(text, "hi there");
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn missing_candidates_returns_none() {
        let body = serde_json::json!({"promptFeedback": {"blockReason": "SAFETY"}});
        assert!(parse_success(&body).is_none());
        assert_eq!(safety_block_reason(&body).unwrap(), "SAFETY");
    }

    #[test]
    fn complexity_maps_to_temperature() {
        assert_eq!(Complexity::Complex.temperature(), 0.2);
        assert_eq!(Complexity::Simple.temperature(), 0.1);
    }
}
