//! Connector capabilities besides source and destination sync

use async_trait::async_trait;
use connsync_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Raw request forwarded verbatim to a connector's upstream API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassthroughRequest {
    /// HTTP method, e.g. "GET"
    pub method: String,
    /// Path relative to the connector's base URL
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl PassthroughRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Upstream response; non-2xx statuses are returned, not raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, or the raw text as a JSON string when it is not JSON
    pub body: Value,
}

/// Connectors that can proxy arbitrary calls to the system they wrap
#[async_trait]
pub trait Passthrough: Send + Sync {
    async fn passthrough(&self, request: PassthroughRequest) -> Result<PassthroughResponse>;
}
