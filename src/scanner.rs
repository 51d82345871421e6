// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-stream scanning.
//!
//! A scan opens one ordered query for at most `chunk_size` rows of a tracked
//! entity that sort strictly after the entity's watermark, and pulls it
//! `fetch_size` rows at a time. Each page carries the token of its last row,
//! which is what the coordinator persists once everything derived from the
//! page has been written.
//!
//! ```text
//! watermark ──► [ r1 r2 r3 | r4 r5 r6 | r7 ]   (chunk_size = 7, fetch_size = 3)
//!                 page 0     page 1     page 2
//!                 ckpt=r3    ckpt=r6    ckpt=r7
//! ```
//!
//! Only one page is held in memory; the next is not pulled until the caller
//! asks for it. A retryable error mid-scan reopens the query after the last
//! page handed out, which starts a new [snapshot](ChangePages::snapshot).
//! A saturated scan (`chunk_size` rows read) means more backlog may remain;
//! it is picked up by the next sweep from the advanced watermark.

use crate::config::TrackedEntity;
use crate::error::Result;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::source::{ChangeRecord, SourceDatabase};
use crate::watermark::WatermarkToken;
use crate::RowStream;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A page of changed ids plus the checkpoint covering them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    pub ids: Vec<Uuid>,
    /// Token of the last row in the page.
    pub checkpoint: WatermarkToken,
}

impl ChangePage {
    /// Build a page from rows in scan order. `None` for no rows.
    pub fn from_records(records: &[ChangeRecord]) -> Option<Self> {
        let last = records.last()?;
        Some(Self {
            ids: records.iter().map(|r| r.id).collect(),
            checkpoint: last.token(),
        })
    }
}

/// Runs bounded change scans against the source.
pub struct ChangeScanner<D: SourceDatabase> {
    source: Arc<D>,
    fetch_size: usize,
    chunk_size: usize,
    retry: RetryConfig,
}

impl<D: SourceDatabase> ChangeScanner<D> {
    pub fn new(source: Arc<D>, fetch_size: usize, chunk_size: usize, retry: RetryConfig) -> Self {
        Self {
            source,
            fetch_size: fetch_size.max(1),
            chunk_size,
            retry,
        }
    }

    /// Start a scan of `entity` for rows after `after`.
    ///
    /// No query runs until the first [`ChangePages::next_page`].
    pub fn pages<'a>(&'a self, entity: &'a TrackedEntity, after: WatermarkToken) -> ChangePages<'a, D> {
        ChangePages {
            scanner: self,
            entity,
            after,
            rows: None,
            read: 0,
            snapshot: 0,
            done: self.chunk_size == 0,
        }
    }
}

/// One streamed change scan, consumed page by page.
pub struct ChangePages<'a, D: SourceDatabase> {
    scanner: &'a ChangeScanner<D>,
    entity: &'a TrackedEntity,
    /// Checkpoint of the last page handed out.
    after: WatermarkToken,
    rows: Option<RowStream<'a, ChangeRecord>>,
    read: usize,
    snapshot: usize,
    done: bool,
}

impl<'a, D: SourceDatabase> ChangePages<'a, D> {
    /// Pull the next page, or `None` once the scan is drained or capped.
    ///
    /// Retryable errors back off and reopen the scan after the last page
    /// handed out; rows of a half-read page are read again.
    pub async fn next_page(&mut self) -> Result<Option<ChangePage>> {
        let mut attempt: usize = 0;
        loop {
            match self.pull_page().await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt + 1 < self.scanner.retry.max_attempts => {
                    self.rows = None;
                    attempt += 1;
                    let delay = self.scanner.retry.delay_for_attempt(attempt);
                    warn!(
                        entity = %self.entity.name,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Change scan failed, reopening"
                    );
                    metrics::record_retry("scan_changes");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.rows = None;
                    return Err(e);
                }
            }
        }
    }

    async fn pull_page(&mut self) -> Result<Option<ChangePage>> {
        if self.done {
            return Ok(None);
        }

        let remaining = self.scanner.chunk_size.saturating_sub(self.read);
        if self.rows.is_none() {
            self.snapshot += 1;
        }
        let (scanner, entity, after) = (self.scanner, self.entity, self.after);
        let rows = self
            .rows
            .get_or_insert_with(|| scanner.source.scan_changes(entity, after, remaining));

        let want = self.scanner.fetch_size.min(remaining);
        let mut records = Vec::with_capacity(want);
        let mut drained = false;
        while records.len() < want {
            match rows.try_next().await? {
                Some(record) => records.push(record),
                None => {
                    drained = true;
                    break;
                }
            }
        }

        self.read += records.len();
        metrics::record_rows_scanned(&self.entity.name, records.len());
        if drained || self.read >= self.scanner.chunk_size {
            self.done = true;
            self.rows = None;
        }

        let Some(page) = ChangePage::from_records(&records) else {
            return Ok(None);
        };
        self.after = page.checkpoint;

        debug!(
            entity = %self.entity.name,
            ids = page.ids.len(),
            rows = self.read,
            checkpoint = %page.checkpoint,
            "Change page read"
        );
        Ok(Some(page))
    }

    /// Whether no further page will be pulled.
    pub fn is_exhausted(&self) -> bool {
        self.done
    }

    /// Rows handed out so far.
    pub fn row_count(&self) -> usize {
        self.read
    }

    /// Whether the row cap was hit.
    pub fn is_saturated(&self) -> bool {
        self.read >= self.scanner.chunk_size
    }

    /// Number of times the scan query was opened. Pages with the same value
    /// come from the same statement snapshot.
    pub fn snapshot(&self) -> usize {
        self.snapshot
    }
}
