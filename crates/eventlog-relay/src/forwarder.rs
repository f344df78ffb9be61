// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of records to the ingestion endpoint.
//!
//! ```text
//!   Record ──► RawEvent {Timestamp, Level, MessageTemplate, Properties}
//!                 │
//!                 v
//!   POST {url}/api/events/raw   (X-Seq-ApiKey when configured)
//! ```
//!
//! A send is a single attempt; callers log failures and move on.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error};

use crate::entry::{Record, TagValue};
use crate::errors::TransportError;

const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-seq-apikey");
const RAW_EVENTS_PATH: &str = "/api/events/raw";

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn send(&self, record: &Record) -> Result<(), TransportError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RawEvent<'a> {
    timestamp: String,
    level: String,
    message_template: &'a str,
    properties: &'a BTreeMap<String, TagValue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RawEvents<'a> {
    events: [RawEvent<'a>; 1],
}

impl<'a> RawEvents<'a> {
    fn single(record: &'a Record) -> Self {
        Self {
            events: [RawEvent {
                timestamp: record.timestamp.to_rfc3339(),
                level: record.level.to_string(),
                message_template: &record.message_template,
                properties: &record.tags,
            }],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeqForwarderConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

/// Forwards each record as a one-element raw events batch.
#[derive(Debug, Clone)]
pub struct SeqForwarder {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
}

impl SeqForwarder {
    #[must_use]
    pub fn new(config: &SeqForwarderConfig) -> Self {
        let endpoint = format!("{}{RAW_EVENTS_PATH}", config.url.trim_end_matches('/'));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            match HeaderValue::from_str(api_key) {
                Ok(value) => {
                    headers.insert(API_KEY_HEADER, value);
                }
                Err(e) => error!("Ignoring API key that is not a valid header value: {e}"),
            }
        }
        Self {
            client: get_client(config),
            endpoint,
            headers,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Builds the HTTP client, falling back to a direct connection when the
/// proxy setting cannot be used.
fn get_client(config: &SeqForwarderConfig) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to parse proxy configuration: {e}, falling back to direct connection");
            build_client(config, false).unwrap_or_else(|inner| {
                error!("Failed to build HTTP client without proxy: {inner}, using reqwest defaults");
                reqwest::Client::new()
            })
        }
    }
}

fn build_client(
    config: &SeqForwarderConfig,
    allow_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));
    if allow_proxy {
        if let Some(proxy) = config.https_proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
    }
    builder.build()
}

#[async_trait]
impl Forwarder for SeqForwarder {
    async fn send(&self, record: &Record) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&RawEvents::single(record))
            .map_err(|e| TransportError::Payload(e.to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!("Forwarded record to {} ({status})", self.endpoint);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Keeps forwarded records in memory; used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryForwarder {
    records: Mutex<Vec<Record>>,
    failing: AtomicBool,
}

impl MemoryForwarder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following send fail with a network error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn records(&self) -> Vec<Record> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Record>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Forwarder for MemoryForwarder {
    async fn send(&self, record: &Record) -> Result<(), TransportError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(TransportError::Network("forwarder is failing".to_string()));
        }
        self.lock().push(record.clone());
        Ok(())
    }
}
