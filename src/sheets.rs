use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::auth::{AuthError, TokenProvider};

const SHEETS_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

static SHEET_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)sheet\s*id\s*[:：]\s*([A-Za-z0-9_-]+)").unwrap());
static SHEET_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"docs\.google\.com/spreadsheets/d/([A-Za-z0-9_-]+)").unwrap());
static SHEET_NAME_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"表格["“”](.+?)["“”]"#,
        r"表格\s*[:：]\s*(.+)",
        r"(?i)sheet\s*name\s*[:：]\s*(.+)",
        r#"(?i)\btab\s*["“](.+?)["”]"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("no spreadsheet id; set GOOGLE_SHEETS_ID_DEFAULT or pass --sheet")]
    NoSpreadsheet,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("sheets API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("sheets request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid sheets URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("sheets base URL cannot take path segments")]
    BadBase,
}

/// Destination: a spreadsheet and a tab inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTarget {
    pub spreadsheet_id: Option<String>,
    pub sheet_name: String,
}

impl SheetTarget {
    /// Read a destination out of free text: `Sheet ID: <id>`, a spreadsheet URL,
    /// or a quoted tab name. Anything not given comes from `default`.
    pub fn parse(input: &str, default: &SheetTarget) -> SheetTarget {
        let input = input.trim();
        if let Some(caps) = SHEET_ID_RE
            .captures(input)
            .or_else(|| SHEET_URL_RE.captures(input))
        {
            return SheetTarget {
                spreadsheet_id: Some(caps[1].to_string()),
                sheet_name: default.sheet_name.clone(),
            };
        }
        if let Some(name) = SHEET_NAME_RES
            .iter()
            .find_map(|re| re.captures(input))
            .map(|caps| caps[1].trim().to_string())
            .filter(|n| !n.is_empty())
        {
            return SheetTarget {
                spreadsheet_id: default.spreadsheet_id.clone(),
                sheet_name: name,
            };
        }
        default.clone()
    }

    /// A1 range on this tab, quoting the tab name when it isn't a bare word.
    fn range(&self, cells: &str) -> String {
        let plain = self
            .sheet_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if plain {
            format!("{}!{}", self.sheet_name, cells)
        } else {
            format!("'{}'!{}", self.sheet_name.replace('\'', "''"), cells)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WriteMode {
    /// Add rows after the last filled row.
    Append,
    /// Overwrite from A1.
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub updated_range: Option<String>,
    pub updated_rows: u64,
    pub wrote_header: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    updated_range: Option<String>,
    updated_rows: Option<u64>,
}

#[derive(Deserialize)]
struct AppendResponse {
    updates: Option<UpdateResponse>,
}

#[derive(Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

pub struct SheetsWriter<T> {
    http: reqwest::Client,
    tokens: T,
    base_url: String,
}

impl<T: TokenProvider> SheetsWriter<T> {
    pub fn new(tokens: T) -> Self {
        Self::with_base_url(tokens, SHEETS_BASE_URL)
    }

    pub fn with_base_url(tokens: T, base_url: impl Into<String>) -> Self {
        SheetsWriter {
            http: reqwest::Client::new(),
            tokens,
            base_url: base_url.into(),
        }
    }

    /// Write `rows` under `header`. The header goes in only when the tab's
    /// first row is empty (append) or always at A1 (update).
    pub async fn write(
        &self,
        target: &SheetTarget,
        header: &[&str],
        rows: &[Vec<String>],
        mode: WriteMode,
    ) -> Result<WriteSummary, SheetsError> {
        let spreadsheet_id = target
            .spreadsheet_id
            .as_deref()
            .ok_or(SheetsError::NoSpreadsheet)?;
        let token = self.tokens.valid_token().await?;

        let wrote_header = match mode {
            WriteMode::Update => true,
            WriteMode::Append => !self.has_header(&token, spreadsheet_id, target).await?,
        };

        let mut values: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
        if wrote_header {
            values.push(header.iter().map(|h| h.to_string()).collect());
        }
        values.extend(rows.iter().cloned());
        let body = json!({ "values": values });

        let summary = match mode {
            WriteMode::Append => {
                let mut url = self.values_url(spreadsheet_id, &format!("{}:append", target.range("A1")))?;
                url.query_pairs_mut()
                    .append_pair("valueInputOption", "USER_ENTERED")
                    .append_pair("insertDataOption", "INSERT_ROWS");
                let response = self.http.post(url).bearer_auth(&token).json(&body).send().await?;
                let parsed: AppendResponse = check(response).await?.json().await?;
                parsed.updates
            }
            WriteMode::Update => {
                let mut url = self.values_url(spreadsheet_id, &target.range("A1"))?;
                url.query_pairs_mut()
                    .append_pair("valueInputOption", "USER_ENTERED");
                let response = self.http.put(url).bearer_auth(&token).json(&body).send().await?;
                let parsed: UpdateResponse = check(response).await?.json().await?;
                Some(parsed)
            }
        };

        let summary = WriteSummary {
            updated_range: summary.as_ref().and_then(|s| s.updated_range.clone()),
            updated_rows: summary.and_then(|s| s.updated_rows).unwrap_or(0),
            wrote_header,
        };
        info!(
            "Wrote {} rows to spreadsheet {} ({})",
            summary.updated_rows,
            spreadsheet_id,
            summary.updated_range.as_deref().unwrap_or("-")
        );
        Ok(summary)
    }

    async fn has_header(
        &self,
        token: &str,
        spreadsheet_id: &str,
        target: &SheetTarget,
    ) -> Result<bool, SheetsError> {
        let url = self.values_url(spreadsheet_id, &target.range("1:1"))?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let parsed: ValuesResponse = check(response).await?.json().await?;
        Ok(parsed
            .values
            .iter()
            .flatten()
            .any(|v| !matches!(v, Value::Null) && v.as_str() != Some("")))
    }

    fn values_url(&self, spreadsheet_id: &str, range: &str) -> Result<Url, SheetsError> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| SheetsError::BadBase)?
            .pop_if_empty()
            .push(spreadsheet_id)
            .push("values")
            .push(range);
        Ok(url)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, SheetsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SheetsError::Status {
        status: status.as_u16(),
        body,
    })
}
