//! Google Sheets v4 REST client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use super::auth::{provider_from_config, TokenProvider};
use super::{A1Range, RemoteMirror, TargetInfo};
use crate::config::AuthConfig;
use crate::error::{MirrorError, RemoteErrorKind, Result};
use crate::types::CellValue;

const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SpreadsheetResponse {
    #[serde(rename = "spreadsheetId")]
    spreadsheet_id: String,
    #[serde(default)]
    properties: Option<SpreadsheetProperties>,
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetProperties {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Sheets API client
pub struct SheetsClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl SheetsClient {
    /// Client against the public API using the configured credentials
    pub fn from_auth(auth: &AuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let tokens = provider_from_config(auth, http.clone())?;
        Self::new(http, DEFAULT_BASE_URL, tokens)
    }

    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| MirrorError::Config(format!("invalid Sheets base URL: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            tokens,
        })
    }

    /// `{base}/{target}/{segments...}`
    fn url(&self, target_id: &str, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| MirrorError::Config("Sheets base URL cannot be a base".into()))?;
            path.pop_if_empty().push(target_id);
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.access_token().await?;
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            MirrorError::remote(RemoteErrorKind::Transient, format!("request failed: {}", e))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(MirrorError::remote(classify_status(status, &text), text))
    }
}

/// Map an HTTP failure onto a remote error kind
fn classify_status(status: StatusCode, body: &str) -> RemoteErrorKind {
    match status.as_u16() {
        401 => RemoteErrorKind::Auth,
        403 if body.contains("RATE_LIMIT_EXCEEDED") || body.contains("rateLimitExceeded") => {
            RemoteErrorKind::Throttled
        }
        403 => RemoteErrorKind::Permission,
        404 => RemoteErrorKind::NotFound,
        409 => RemoteErrorKind::AlreadyExists,
        400 if body.contains("already exists") => RemoteErrorKind::AlreadyExists,
        429 => RemoteErrorKind::Throttled,
        408 | 500..=599 => RemoteErrorKind::Transient,
        _ => RemoteErrorKind::InvalidRequest,
    }
}

#[async_trait]
impl RemoteMirror for SheetsClient {
    async fn get_target(&self, target_id: &str) -> Result<TargetInfo> {
        let mut url = self.url(target_id, &[])?;
        url.query_pairs_mut()
            .append_pair("fields", "spreadsheetId,properties.title,sheets.properties.title");

        let response = self.send(Method::GET, url, None).await?;
        let body: SpreadsheetResponse = response.json().await?;
        Ok(TargetInfo {
            target_id: body.spreadsheet_id,
            title: body.properties.and_then(|p| p.title),
            sheets: body.sheets.into_iter().map(|s| s.properties.title).collect(),
        })
    }

    async fn create_sheet(&self, target_id: &str, name: &str) -> Result<()> {
        let url = self.url(&format!("{}:batchUpdate", target_id), &[])?;
        let body = json!({
            "requests": [{ "addSheet": { "properties": { "title": name } } }]
        });
        self.send(Method::POST, url, Some(body)).await?;
        Ok(())
    }

    async fn clear_range(&self, target_id: &str, sheet: &str, range: A1Range) -> Result<()> {
        let segment = format!("{}:clear", range.qualified(sheet));
        let url = self.url(target_id, &["values", &segment])?;
        self.send(Method::POST, url, Some(json!({}))).await?;
        Ok(())
    }

    async fn write_range(
        &self,
        target_id: &str,
        sheet: &str,
        range: A1Range,
        rows: &[Vec<CellValue>],
    ) -> Result<()> {
        let a1 = range.qualified(sheet);
        let mut url = self.url(target_id, &["values", &a1])?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let body = json!({
            "range": a1,
            "majorDimension": "ROWS",
            "values": rows,
        });
        self.send(Method::PUT, url, Some(body)).await?;
        Ok(())
    }
}
