//! LLM reasoner clients.
//!
//! Two collaborators behind one trait: a fast generalist used for intraday
//! scoring, and a slower reasoning model used for the scenario veto and
//! post-trade lessons. Failures are always non-fatal for callers; they fall
//! back to conservative defaults.

use crate::models::Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const FAST_TIMEOUT_SECS: u64 = 30;
const REASONING_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ReasonerReply {
    pub reasoning: String,
    pub answer: String,
    pub raw: String,
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Fast generalist completion. 30 s budget.
    async fn chat(&self, system: &str, prompt: &str) -> Result<String>;

    /// Reasoning-model completion with split thinking/answer. 60 s budget.
    async fn reason(&self, system: &str, prompt: &str) -> Result<ReasonerReply>;
}

pub struct HttpReasoner {
    fast_client: reqwest::Client,
    reasoning_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    fast_model: String,
    reasoning_model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning_content: String,
}

impl HttpReasoner {
    pub fn new(config: &Config) -> Result<Self> {
        let fast_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FAST_TIMEOUT_SECS))
            .build()
            .context("build fast llm client")?;
        let reasoning_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REASONING_TIMEOUT_SECS))
            .build()
            .context("build reasoning llm client")?;

        Ok(Self {
            fast_client,
            reasoning_client,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            fast_model: config.llm_fast_model.clone(),
            reasoning_model: config.llm_reasoning_model.clone(),
        })
    }

    async fn complete(
        &self,
        client: &reqwest::Client,
        model: &str,
        system: &str,
        prompt: &str,
        temperature: f64,
    ) -> Result<ChatMessage> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("LLM_API_KEY not configured"))?;

        let body = serde_json::json!({
            "model": model,
            "temperature": temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });

        let resp = client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("llm request")?
            .error_for_status()
            .context("llm status")?;

        let mut completion: ChatCompletion = resp.json().await.context("llm body")?;
        if completion.choices.is_empty() {
            return Err(anyhow!("llm returned no choices"));
        }
        Ok(completion.choices.remove(0).message)
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn chat(&self, system: &str, prompt: &str) -> Result<String> {
        let message = self
            .complete(&self.fast_client, &self.fast_model, system, prompt, 0.3)
            .await?;
        debug!(chars = message.content.len(), "fast llm reply");
        Ok(message.content)
    }

    async fn reason(&self, system: &str, prompt: &str) -> Result<ReasonerReply> {
        let message = self
            .complete(
                &self.reasoning_client,
                &self.reasoning_model,
                system,
                prompt,
                0.3,
            )
            .await?;
        let raw = if message.reasoning_content.is_empty() {
            message.content.clone()
        } else {
            format!("{}\n\n{}", message.reasoning_content, message.content)
        };
        debug!(
            reasoning_chars = message.reasoning_content.len(),
            answer_chars = message.content.len(),
            "reasoning llm reply"
        );
        Ok(ReasonerReply {
            reasoning: message.reasoning_content,
            answer: message.content,
            raw,
        })
    }
}

/// Pull the first JSON object out of a model reply that may be wrapped in
/// prose or a code fence. Returns None when nothing parseable is found.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &text[start..=end];
    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }

    // The widest slice failed; walk matching braces from the first '{'.
    let bytes = candidate.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return serde_json::from_str(&candidate[..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}
