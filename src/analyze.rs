use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_TEMPLATE: &str = include_str!("../prompts/analysis.md");
const PLACEHOLDER: &str = "{{ PRODUCT_CONTENT }}";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("failed to read prompt template {path}: {source}")]
    Template {
        path: String,
        source: std::io::Error,
    },
    #[error("prompt template has no {{{{ PRODUCT_CONTENT }}}} placeholder")]
    NoPlaceholder,
    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Prompt with a single `{{ PRODUCT_CONTENT }}` slot.
#[derive(Debug, Clone)]
pub struct PromptTemplate(String);

impl Default for PromptTemplate {
    fn default() -> Self {
        PromptTemplate(DEFAULT_TEMPLATE.to_string())
    }
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Result<Self, AnalyzeError> {
        let text = text.into();
        if !text.contains(PLACEHOLDER) {
            return Err(AnalyzeError::NoPlaceholder);
        }
        Ok(PromptTemplate(text))
    }

    pub fn from_file(path: &Path) -> Result<Self, AnalyzeError> {
        let text = std::fs::read_to_string(path).map_err(|source| AnalyzeError::Template {
            path: path.display().to_string(),
            source,
        })?;
        Self::new(text)
    }

    pub fn render(&self, content: &str) -> String {
        self.0.replacen(PLACEHOLDER, content, 1)
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Scraped content beyond this many characters is dropped before prompting.
    pub max_content_chars: usize,
    pub timeout: Duration,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        AnalyzerOptions {
            api_key: String::new(),
            model: "gemini-3-flash-preview".to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
            max_content_chars: 100_000,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub content: Option<String>,
    pub error: Option<String>,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Single call, no retry. Failures are carried in the result.
    async fn analyze(&self, content: &str) -> AnalysisResult;
}

pub struct GeminiAnalyzer {
    http: reqwest::Client,
    opts: AnalyzerOptions,
    template: PromptTemplate,
}

impl GeminiAnalyzer {
    pub fn new(opts: AnalyzerOptions, template: PromptTemplate) -> Result<Self, AnalyzeError> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .build()
            .map_err(AnalyzeError::Client)?;
        Ok(GeminiAnalyzer {
            http,
            opts,
            template,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.opts.base_url.trim_end_matches('/'),
            self.opts.model
        )
    }

    async fn generate(&self, content: &str) -> Result<String, AnalyzeError> {
        let content = truncate_chars(content, self.opts.max_content_chars);
        let prompt = self.template.render(content);
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.opts.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzeError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| AnalyzeError::Decode(e.to_string()))?;
        Ok(value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl Analyzer for GeminiAnalyzer {
    async fn analyze(&self, content: &str) -> AnalysisResult {
        let (content, error) = match self.generate(content).await {
            Ok(text) => {
                info!("Analysis via {} ({} chars)", self.opts.model, text.chars().count());
                (Some(text), None)
            }
            Err(e) => {
                warn!("Analysis via {} failed: {}", self.opts.model, e);
                (None, Some(e.to_string()))
            }
        };
        AnalysisResult {
            content,
            error,
            model: self.opts.model.clone(),
            timestamp: Utc::now(),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
