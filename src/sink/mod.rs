// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search index sink.
//!
//! [`SearchSink`] is the write side of the pipeline: make sure the index
//! exists, then upsert documents by id. Upserts are idempotent, so
//! re-delivering a page after a crash only rewrites the same documents.
//!
//! # Elasticsearch
//!
//! [`ElasticsearchSink`] talks to the REST API directly:
//!
//! | Call | Request |
//! |------|---------|
//! | existence check | `HEAD /<index>` |
//! | creation | `PUT /<index>` with `index_schema.json` |
//! | upsert | `POST /_bulk` (NDJSON, `index` actions) |
//!
//! Every request is retried individually on transport errors, 429 and 5xx.
//! Item-level bulk failures are not retried; they lower the written count,
//! which keeps the caller's watermark where it was.

use crate::config::SinkConfig;
use crate::document::FilmWorkDocument;
use crate::error::{Result, SyncError};
use crate::resilience::{retry, RetryConfig};
use crate::BoxFuture;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

const INDEX_SCHEMA: &str = include_str!("index_schema.json");

/// Item failures logged per bulk response.
const MAX_LOGGED_FAILURES: usize = 5;

/// Destination for denormalized documents.
pub trait SearchSink: Send + Sync + 'static {
    /// Create the index with its fixed schema unless it already exists.
    fn ensure_index(&self) -> BoxFuture<'_, ()>;

    /// Upsert `docs` in chunks of `chunk_size`; returns how many were written.
    fn write_batch<'a>(
        &'a self,
        docs: &'a [FilmWorkDocument],
        chunk_size: usize,
    ) -> BoxFuture<'a, usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bulk helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// NDJSON body for a `_bulk` request: one `index` action per document.
pub fn bulk_body(index: &str, docs: &[FilmWorkDocument]) -> Result<String> {
    let mut body = String::new();
    for doc in docs {
        let action = json!({ "index": { "_index": index, "_id": doc.id } });
        let _ = writeln!(body, "{}", action);
        let _ = writeln!(body, "{}", serde_json::to_string(doc)?);
    }
    Ok(body)
}

/// A failed bulk item.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkFailure {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

/// Per-item outcome of one `_bulk` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub written: usize,
    pub failures: Vec<BulkFailure>,
}

/// Count items with a 2xx status.
pub fn parse_bulk_response(response: &Value) -> Result<BulkOutcome> {
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Decode("bulk response has no items array".to_string()))?;

    let mut outcome = BulkOutcome::default();
    for item in items {
        // Each item is keyed by its action ("index", "create", ...).
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
        if (200..300).contains(&status) {
            outcome.written += 1;
        } else {
            outcome.failures.push(BulkFailure {
                id: result
                    .get("_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status,
                reason: result
                    .pointer("/error/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
    }
    Ok(outcome)
}

/// Whether a failed index creation means another writer created it first.
pub fn index_already_exists(status: u16, body: &str) -> bool {
    status == 400
        && serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.pointer("/error/type").and_then(Value::as_str).map(str::to_owned))
            .is_some_and(|t| t == "resource_already_exists_exception")
}

// ═══════════════════════════════════════════════════════════════════════════════
// ElasticsearchSink
// ═══════════════════════════════════════════════════════════════════════════════

/// Elasticsearch REST sink.
pub struct ElasticsearchSink {
    client: reqwest::Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
    retry: RetryConfig,
}

impl ElasticsearchSink {
    pub fn new(config: &SinkConfig, retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|e| SyncError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            retry,
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, format!("{}/{}", self.base_url, path));
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_ref()),
            None => req,
        }
    }

    async fn index_exists(&self) -> Result<bool> {
        let resp = self
            .request(reqwest::Method::HEAD, &self.index)
            .send()
            .await
            .map_err(|e| SyncError::sink_transport("index_exists", e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(SyncError::sink_status("index_exists", s.as_u16(), s.to_string())),
        }
    }

    async fn create_index(&self, schema: &Value) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, &self.index)
            .json(schema)
            .send()
            .await
            .map_err(|e| SyncError::sink_transport("create_index", e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            info!(index = %self.index, "Index created");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if index_already_exists(status.as_u16(), &body) {
            debug!(index = %self.index, "Index created concurrently");
            return Ok(());
        }
        Err(SyncError::sink_status("create_index", status.as_u16(), body))
    }

    async fn bulk(&self, docs: &[FilmWorkDocument]) -> Result<BulkOutcome> {
        let body = bulk_body(&self.index, docs)?;

        let resp = self
            .request(reqwest::Method::POST, "_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::sink_transport("bulk", e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::sink_status("bulk", status.as_u16(), text));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| SyncError::sink_transport("bulk", e.to_string()))?;
        parse_bulk_response(&json)
    }
}

impl SearchSink for ElasticsearchSink {
    fn ensure_index(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let schema: Value = serde_json::from_str(INDEX_SCHEMA)
                .map_err(|e| SyncError::Internal(format!("Bad index schema: {}", e)))?;

            if retry("index_exists", &self.retry, || self.index_exists()).await? {
                debug!(index = %self.index, "Index already exists");
                return Ok(());
            }
            retry("create_index", &self.retry, || self.create_index(&schema)).await
        })
    }

    fn write_batch<'a>(
        &'a self,
        docs: &'a [FilmWorkDocument],
        chunk_size: usize,
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut written = 0;
            for chunk in docs.chunks(chunk_size.max(1)) {
                let outcome = retry("bulk", &self.retry, || self.bulk(chunk)).await?;

                for failure in outcome.failures.iter().take(MAX_LOGGED_FAILURES) {
                    warn!(
                        index = %self.index,
                        id = %failure.id,
                        status = failure.status,
                        reason = %failure.reason,
                        "Document rejected"
                    );
                }
                written += outcome.written;
            }
            debug!(index = %self.index, submitted = docs.len(), written, "Bulk write complete");
            Ok(written)
        })
    }
}
