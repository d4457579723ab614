//! Cursor-paginated REST source
//!
//! Reads each configured stream from `GET {base_url}/{path}` where the API
//! answers `{"results": [...], "next": "<cursor>" | null}` and accepts the
//! cursor back as the `cursor` query parameter. The stored state of a stream
//! is `{"cursor": <next>}`; a `null` cursor means the stream was read to the
//! end and the next run starts over.

use async_trait::async_trait;
use connsync_common::{Result, SyncError};
use connsync_engine::connector::{Passthrough, PassthroughRequest, PassthroughResponse};
use connsync_engine::source::{Page, PageStream, Source, SourceContext, SyncMode};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Kind name used in pipeline configuration
pub const KIND: &str = "rest_cursor";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_id_field() -> String {
    "id".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Settings of one stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamSettings {
    pub name: String,
    /// Fields requested through the `fields` query parameter
    #[serde(default)]
    pub fields: Vec<String>,
    /// Path below the base URL; defaults to `crm/{plural(name)}`
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

impl StreamSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            path: None,
            id_field: default_id_field(),
        }
    }

    pub fn path(&self) -> String {
        match &self.path {
            Some(path) => path.trim_start_matches('/').to_string(),
            None => format!("crm/{}", pluralize(&self.name)),
        }
    }
}

/// A stream given either by name or as a full table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StreamEntry {
    Name(String),
    Full(StreamSettings),
}

fn deserialize_streams<'de, D>(deserializer: D) -> std::result::Result<Vec<StreamSettings>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries = Vec::<StreamEntry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            StreamEntry::Name(name) => StreamSettings::new(name),
            StreamEntry::Full(settings) => settings,
        })
        .collect())
}

/// Connector settings
#[derive(Debug, Clone, Deserialize)]
pub struct RestCursorSettings {
    pub base_url: String,
    /// Sent with every request, e.g. API token and tenant headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Streams in the order they are read
    #[serde(deserialize_with = "deserialize_streams")]
    pub streams: Vec<StreamSettings>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CursorPage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    next: Option<String>,
}

/// Source reading cursor-paginated REST collections
pub struct RestCursorSource {
    settings: RestCursorSettings,
    client: reqwest::Client,
}

impl RestCursorSource {
    pub fn new(settings: RestCursorSettings) -> Result<Self> {
        if settings.streams.is_empty() {
            return Err(SyncError::config("rest_cursor source needs at least one stream"));
        }
        reqwest::Url::parse(&settings.base_url).map_err(|e| {
            SyncError::config(format!("invalid base_url '{}': {}", settings.base_url, e))
        })?;

        let client = reqwest::Client::builder()
            .default_headers(header_map(&settings.headers)?)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| SyncError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { settings, client })
    }

    /// Build from the untyped `settings` value of a pipeline
    pub fn from_value(settings: Value) -> Result<Self> {
        let settings: RestCursorSettings = serde_json::from_value(settings)
            .map_err(|e| SyncError::config(format!("invalid rest_cursor settings: {}", e)))?;
        Self::new(settings)
    }

    pub fn settings(&self) -> &RestCursorSettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn fetch_page(&self, stream: &StreamSettings, cursor: Option<&str>) -> Result<CursorPage> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        if !stream.fields.is_empty() {
            query.push(("fields", stream.fields.join(",")));
        }

        let url = self.url(&stream.path());
        debug!(stream = %stream.name, url = %url, cursor = ?cursor, "Fetching page");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &url, &body));
        }

        response
            .json::<CursorPage>()
            .await
            .map_err(|e| SyncError::transient(format!("invalid page from {}: {}", url, e)))
    }
}

/// 401/403 and other client errors are configuration problems; rate limits
/// and server errors are worth retrying.
fn status_error(status: StatusCode, url: &str, body: &str) -> SyncError {
    let message = format!("GET {} returned {}: {}", url, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        SyncError::transient(message)
    } else {
        SyncError::config(message)
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SyncError::config(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SyncError::config(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Resume cursor of `stream`; a missing, null or empty cursor starts over
fn stored_cursor(ctx: &SourceContext, stream: &str) -> Option<String> {
    ctx.cursor(stream)
        .and_then(|state| state.get("cursor"))
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string)
}

impl Source for RestCursorSource {
    fn name(&self) -> &str {
        KIND
    }

    fn sync_mode(&self) -> SyncMode {
        SyncMode::Incremental
    }

    fn sync(&self, ctx: SourceContext) -> PageStream<'_> {
        Box::pin(async_stream::try_stream! {
            for stream in &self.settings.streams {
                let mut cursor = stored_cursor(&ctx, &stream.name);
                info!(stream = %stream.name, resume = cursor.is_some(), "Reading stream");

                loop {
                    let body = self.fetch_page(stream, cursor.as_deref()).await?;

                    let mut page = Page::new();
                    for record in body.results {
                        page.push_record(&stream.name, &stream.id_field, record);
                    }
                    page.set_state(stream.name.clone(), json!({ "cursor": body.next }));
                    yield page;

                    match body.next {
                        Some(next) if !next.is_empty() => cursor = Some(next),
                        _ => break,
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Passthrough for RestCursorSource {
    async fn passthrough(&self, request: PassthroughRequest) -> Result<PassthroughResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| SyncError::config(format!("invalid HTTP method '{}'", request.method)))?;
        let url = self.url(&request.path);

        let mut builder = self
            .client
            .request(method, &url)
            .query(&request.query)
            .headers(header_map(&request.headers)?);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("{} {} failed: {}", request.method, url, e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| SyncError::transient(format!("failed to read response body: {}", e)))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(PassthroughResponse {
            status,
            headers,
            body,
        })
    }
}

/// English plural of a collection name: "company" -> "companies",
/// "deal" -> "deals", "address" -> "addresses".
pub fn pluralize(word: &str) -> String {
    const SIBILANT: [&str; 5] = ["s", "ch", "sh", "x", "z"];

    if SIBILANT.iter().any(|suffix| word.ends_with(suffix)) {
        return format!("{}es", word);
    }

    if let Some(stem) = word.strip_suffix('y') {
        let after_vowel = stem
            .chars()
            .last()
            .is_some_and(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'));
        if !after_vowel {
            return format!("{}ies", stem);
        }
    }

    format!("{}s", word)
}
