// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Aggregate enrichment: project, normalize, load.

use crate::document::FilmWorkDocument;
use crate::error::Result;
use crate::resilience::{retry, RetryConfig};
use crate::sink::SearchSink;
use crate::source::SourceDatabase;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Outcome of loading a set of aggregate ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Ids handed to enrichment.
    pub submitted: usize,
    /// Documents the sink reported written.
    pub written: usize,
}

impl LoadReport {
    /// Whether every submitted id made it into the index.
    pub fn is_complete(&self) -> bool {
        self.written >= self.submitted
    }
}

impl std::ops::AddAssign for LoadReport {
    fn add_assign(&mut self, other: Self) {
        self.submitted += other.submitted;
        self.written += other.written;
    }
}

/// Materializes documents for aggregate ids and hands them to the sink.
pub struct Enricher<D: SourceDatabase, K: SearchSink> {
    source: Arc<D>,
    sink: Arc<K>,
    fetch_size: usize,
    bulk_chunk_size: usize,
    retry: RetryConfig,
}

impl<D: SourceDatabase, K: SearchSink> Enricher<D, K> {
    pub fn new(
        source: Arc<D>,
        sink: Arc<K>,
        fetch_size: usize,
        bulk_chunk_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            source,
            sink,
            fetch_size,
            bulk_chunk_size,
            retry,
        }
    }

    /// Project, normalize and write documents for `ids`.
    ///
    /// Ids are processed `fetch_size` at a time. An id whose row has vanished
    /// from the source counts as submitted but not written.
    pub async fn enrich_and_load(&self, ids: &[Uuid]) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for chunk in ids.chunks(self.fetch_size.max(1)) {
            let rows = retry("project", &self.retry, || self.source.project(chunk)).await?;
            let docs: Vec<FilmWorkDocument> = rows.into_iter().map(FilmWorkDocument::from).collect();

            let written = if docs.is_empty() {
                0
            } else {
                self.sink.write_batch(&docs, self.bulk_chunk_size).await?
            };

            debug!(ids = chunk.len(), projected = docs.len(), written, "Enriched chunk");
            report += LoadReport {
                submitted: chunk.len(),
                written,
            };
        }

        Ok(report)
    }
}
