//! LLM-backed clustering capability
//!
//! Sends a feedback batch to Claude and asks for a ranked set of issue
//! groups as JSON. The reply text is returned untouched; parsing and strict
//! validation happen in `clustering::schema`.

use crate::clustering::{ClusterItem, ClusteringCapability};
use crate::config::LlmSettings;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, info};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Configuration for LLM service
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Anthropic API key
    pub api_key: String,

    /// Model to use (default: claude-3-5-haiku-20241022)
    pub model: String,

    /// Max tokens for responses
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::from_settings(&LlmSettings::default())
    }
}

impl LlmConfig {
    /// Build from file settings, taking the key from `ANTHROPIC_API_KEY`
    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self {
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }
}

/// Clustering capability backed by the Anthropic Messages API
pub struct LlmService {
    config: LlmConfig,
    client: reqwest::Client,
}

/// Anthropic API message format
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// Anthropic API response format
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    text: String,
}

const SYSTEM_PROMPT: &str = "You are a product quality analyst. You group user feedback \
into the representative issues behind it and reply with JSON only.";

impl LlmService {
    /// Create a new LLM service with custom config
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(EngineError::Config("ANTHROPIC_API_KEY not set".to_string()));
        }

        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    /// Create with default config
    pub fn with_default() -> Result<Self> {
        Self::new(LlmConfig::default())
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Make an API call to Claude
    async fn call_api(&self, prompt: &str) -> Result<String> {
        debug!("Calling Anthropic API ({} prompt chars)", prompt.len());

        let request = AnthropicRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::ExternalCapability(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EngineError::ExternalCapability(format!(
                "API request failed with status {}: {}",
                status, error_text
            )));
        }

        let api_response: AnthropicResponse = response.json().await.map_err(|e| {
            EngineError::ExternalCapability(format!("Failed to parse response: {}", e))
        })?;

        api_response
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| EngineError::ExternalCapability("Empty response from API".to_string()))
    }
}

/// Render the clustering prompt for a batch
pub fn build_prompt(items: &[ClusterItem], min_group_size: usize) -> Result<String> {
    let batch = serde_json::to_string_pretty(items)?;

    Ok(format!(
        r#"Below are {count} user feedback records as a JSON array. Each has an "id",
a one-line "summary", an optional "rootCause", a text "snippet", a "category"
and a "riskLevel".

{batch}

Group the records into 5 to 15 representative issues. Each group should
contain at least {min} records and describe one underlying problem. Rank
groups by importance (1 = most important), considering both how many users
are affected and how severe the risk is.

Reply with a single JSON object and nothing else, in exactly this shape:
{{
  "clusters": [
    {{
      "rank": 1,
      "title": "short issue title",
      "count": 12,
      "percentage": 34.5,
      "reviewIds": [101, 102],
      "rootCauseSummary": "what is going wrong and why",
      "actionSuggestion": "what the team should do",
      "sampleQuotes": ["up to three short verbatim quotes"]
    }}
  ],
  "uncategorized": 3
}}

Rules:
- reviewIds must only contain ids from the input.
- Each id belongs to at most one group.
- sampleQuotes holds at most 3 entries.
- "uncategorized" is the number of input records you did not place in any group.
"#,
        count = items.len(),
        batch = batch,
        min = min_group_size
    ))
}

#[async_trait]
impl ClusteringCapability for LlmService {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn cluster(&self, items: &[ClusterItem], min_group_size: usize) -> Result<String> {
        let prompt = build_prompt(items, min_group_size)?;
        let reply = self.call_api(&prompt).await?;
        info!(
            "Clustering reply received for {} items ({} chars)",
            items.len(),
            reply.len()
        );
        Ok(reply)
    }
}
