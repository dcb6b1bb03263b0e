use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::analyze::AnalyzerOptions;
use crate::auth::OAuthConfig;
use crate::batch::BatchOptions;
use crate::scrape::{ApiVersion, ScrapeOptions, MAX_ATTEMPTS};
use crate::sheets::SheetTarget;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Everything read from the environment, once, at startup.
///
/// Keys are the lowercased environment variable names, so `OLOSTEP_API_KEY`
/// lands in `olostep_api_key`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub olostep_api_key: Option<String>,
    #[serde(default = "default_api_version")]
    pub olostep_api_version: String,
    pub gemini_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub gemini_model: String,

    pub google_sheets_client_id: Option<String>,
    pub google_sheets_client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub google_sheets_redirect_uri: String,
    pub google_sheets_id_default: Option<String>,
    #[serde(default = "default_sheet_name")]
    pub google_sheet_name_default: String,

    #[serde(default = "default_domain")]
    pub scan_domain: String,
    #[serde(default = "default_chunk_size")]
    pub scan_chunk_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub scan_attempts: u32,
    #[serde(default = "default_auto_fallback")]
    pub scan_auto_fallback: bool,
    #[serde(default = "default_max_content_chars")]
    pub scan_max_content_chars: usize,
    pub scan_prompt_path: Option<PathBuf>,
    #[serde(default = "default_token_path")]
    pub scan_token_path: PathBuf,
    #[serde(default = "default_db_path")]
    pub scan_db_path: PathBuf,
}

fn default_api_version() -> String {
    "v1".into()
}
fn default_model() -> String {
    "gemini-3-flash-preview".into()
}
fn default_redirect_uri() -> String {
    "http://localhost:8080".into()
}
fn default_sheet_name() -> String {
    "Sheet1".into()
}
fn default_domain() -> String {
    "amazon.com".into()
}
fn default_chunk_size() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_attempts() -> u32 {
    3
}
fn default_auto_fallback() -> bool {
    true
}
fn default_max_content_chars() -> usize {
    100_000
}
fn default_token_path() -> PathBuf {
    PathBuf::from(".google-tokens.json")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/scan.sqlite")
}

impl Settings {
    /// Load `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let settings = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }

    pub fn scrape_options(&self) -> Result<ScrapeOptions, ConfigError> {
        let api_key = require(&self.olostep_api_key, "OLOSTEP_API_KEY")?;
        let api_version: ApiVersion =
            self.olostep_api_version
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    key: "OLOSTEP_API_VERSION",
                    value: self.olostep_api_version.clone(),
                })?;
        Ok(ScrapeOptions {
            api_key,
            api_version,
            domain: self.scan_domain.clone(),
            timeout: Duration::from_secs(self.scan_timeout_secs),
            attempts: self.scan_attempts.clamp(1, MAX_ATTEMPTS),
            auto_fallback: self.scan_auto_fallback,
            ..ScrapeOptions::default()
        })
    }

    pub fn analyzer_options(&self) -> Result<AnalyzerOptions, ConfigError> {
        let api_key = require(&self.gemini_api_key, "GEMINI_API_KEY")?;
        Ok(AnalyzerOptions {
            api_key,
            model: self.gemini_model.clone(),
            max_content_chars: self.scan_max_content_chars,
            timeout: Duration::from_secs(self.scan_timeout_secs),
            ..AnalyzerOptions::default()
        })
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            chunk_size: self.scan_chunk_size.max(1),
        }
    }

    pub fn oauth_config(&self) -> Result<OAuthConfig, ConfigError> {
        Ok(OAuthConfig {
            client_id: require(&self.google_sheets_client_id, "GOOGLE_SHEETS_CLIENT_ID")?,
            client_secret: require(
                &self.google_sheets_client_secret,
                "GOOGLE_SHEETS_CLIENT_SECRET",
            )?,
            redirect_uri: self.google_sheets_redirect_uri.clone(),
            ..OAuthConfig::default()
        })
    }

    pub fn default_sheet(&self) -> SheetTarget {
        SheetTarget {
            spreadsheet_id: self.google_sheets_id_default.clone(),
            sheet_name: self.google_sheet_name_default.clone(),
        }
    }
}

fn require(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(key))
}
