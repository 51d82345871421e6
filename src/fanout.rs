// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dependency fan-out: leaf changes to affected film works.
//!
//! A changed person or genre invalidates every film work that references it.
//! For the aggregate entity itself the mapping is the identity.
//!
//! Leaf fan-out is bounded by `chunk_size` per query. [`FanOutBatches`]
//! continues with keyset pagination on the film work id until a short batch
//! comes back, so a popular person linked to thousands of films is never
//! truncated.

use crate::config::TrackedEntity;
use crate::error::Result;
use crate::metrics;
use crate::resilience::{retry, RetryConfig};
use crate::source::SourceDatabase;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Maps changed ids of a tracked entity to affected aggregate ids.
pub struct DependencyResolver<D: SourceDatabase> {
    source: Arc<D>,
    chunk_size: usize,
    retry: RetryConfig,
}

impl<D: SourceDatabase> DependencyResolver<D> {
    pub fn new(source: Arc<D>, chunk_size: usize, retry: RetryConfig) -> Self {
        Self {
            source,
            chunk_size,
            retry,
        }
    }

    /// One bounded batch of aggregate ids affected by `ids`, continuing
    /// after `after`.
    ///
    /// Empty input returns empty without touching the source.
    pub async fn resolve(
        &self,
        entity: &TrackedEntity,
        ids: &[Uuid],
        after: Option<Uuid>,
    ) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if entity.is_aggregate() {
            return Ok(ids.to_vec());
        }

        retry("fan_out", &self.retry, || {
            self.source.fan_out(entity, ids, after, self.chunk_size)
        })
        .await
    }

    /// Iterate every batch of affected aggregate ids.
    pub fn batches<'a>(&'a self, entity: &'a TrackedEntity, ids: &'a [Uuid]) -> FanOutBatches<'a, D> {
        FanOutBatches {
            resolver: self,
            entity,
            ids,
            after: None,
            done: ids.is_empty(),
            total: 0,
        }
    }

    /// All affected aggregate ids, drained across batches.
    pub async fn resolve_all(&self, entity: &TrackedEntity, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut all = Vec::new();
        let mut batches = self.batches(entity, ids);
        while let Some(batch) = batches.next_batch().await? {
            all.extend(batch);
        }
        Ok(all)
    }
}

/// Keyset-paginated fan-out over one page of leaf ids.
pub struct FanOutBatches<'a, D: SourceDatabase> {
    resolver: &'a DependencyResolver<D>,
    entity: &'a TrackedEntity,
    ids: &'a [Uuid],
    after: Option<Uuid>,
    done: bool,
    total: usize,
}

impl<'a, D: SourceDatabase> FanOutBatches<'a, D> {
    /// Next non-empty batch, or `None` once drained.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Uuid>>> {
        if self.done {
            return Ok(None);
        }

        if self.entity.is_aggregate() {
            self.done = true;
            self.total = self.ids.len();
            return Ok(Some(self.ids.to_vec()));
        }

        let batch = self.resolver.resolve(self.entity, self.ids, self.after).await?;
        if batch.len() < self.resolver.chunk_size {
            self.done = true;
        }
        if batch.is_empty() {
            self.finish();
            return Ok(None);
        }

        self.after = batch.last().copied();
        self.total += batch.len();
        debug!(
            entity = %self.entity.name,
            leaf_ids = self.ids.len(),
            batch = batch.len(),
            total = self.total,
            "Fan-out batch resolved"
        );
        if self.done {
            self.finish();
        }
        Ok(Some(batch))
    }

    /// Aggregate ids yielded so far.
    pub fn total(&self) -> usize {
        self.total
    }

    fn finish(&self) {
        metrics::record_fan_out(&self.entity.name, self.total);
    }
}
