// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recording `SearchSink` for testing.
//!
//! Stores documents by id (so repeated writes are upserts) and counts every
//! write. Individual ids can be rejected to simulate item-level bulk failures.

use search_sync_engine::{BoxFuture, FilmWorkDocument, SearchSink, SyncError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct MockSink {
    docs: RwLock<HashMap<Uuid, FilmWorkDocument>>,
    rejected: RwLock<HashSet<Uuid>>,
    /// Every accepted document write, duplicates included.
    writes: AtomicUsize,
    batches: AtomicUsize,
    index_ensured: AtomicBool,
    fail_ensure: AtomicBool,
    unavailable: AtomicBool,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            rejected: RwLock::new(HashSet::new()),
            writes: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
            index_ensured: AtomicBool::new(false),
            fail_ensure: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Reject writes of this id (item-level failure).
    pub async fn reject(&self, id: Uuid) {
        self.rejected.write().await.insert(id);
    }

    pub async fn accept_all(&self) {
        self.rejected.write().await.clear();
    }

    /// Make `ensure_index` fail with a non-retryable error.
    pub fn fail_ensure(&self) {
        self.fail_ensure.store(true, Ordering::SeqCst);
    }

    /// Make every bulk write fail with a non-retryable 400.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn get(&self, id: &Uuid) -> Option<FilmWorkDocument> {
        self.docs.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.docs.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn index_ensured(&self) -> bool {
        self.index_ensured.load(Ordering::SeqCst)
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchSink for MockSink {
    fn ensure_index(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_ensure.load(Ordering::SeqCst) {
                return Err(SyncError::sink_status("create_index", 400, "mapper_parsing_exception"));
            }
            self.index_ensured.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn write_batch<'a>(
        &'a self,
        docs: &'a [FilmWorkDocument],
        chunk_size: usize,
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(SyncError::sink_status("bulk", 400, "illegal_argument_exception"));
            }

            let rejected = self.rejected.read().await.clone();
            let mut stored = self.docs.write().await;
            let mut written = 0;

            for chunk in docs.chunks(chunk_size.max(1)) {
                self.batches.fetch_add(1, Ordering::SeqCst);
                for doc in chunk {
                    if rejected.contains(&doc.id) {
                        continue;
                    }
                    stored.insert(doc.id, doc.clone());
                    self.writes.fetch_add(1, Ordering::SeqCst);
                    written += 1;
                }
            }
            Ok(written)
        })
    }
}
