// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Change scans via [`crate::scanner::ChangeScanner`]
//! - Dependency fan-out via [`crate::fanout::DependencyResolver`]
//! - Enrichment and loading via [`crate::enrich::Enricher`]
//! - Watermark persistence via [`crate::watermark::WatermarkStore`]
//!
//! # Sweep
//!
//! One sweep visits every tracked entity in config order. For each entity:
//!
//! ```text
//! load watermark ─► for each page (≤ fetch_size rows, ≤ chunk_size in total):
//!                      fan out ─► skip ids already written ─► enrich ─► bulk write
//!                      all written? ─► persist page checkpoint
//!                      otherwise   ─► stop, keep watermark
//! ```
//!
//! A failure in one entity is logged and recorded in the [`SweepReport`];
//! the remaining entities still run. Nothing is retried across pages within
//! a sweep: a held page is re-scanned from the last persisted checkpoint on
//! the next sweep, and the idempotent upsert absorbs the re-delivery.

mod types;

pub use types::{EngineState, EntityReport, HoldReason, SweepReport};

use crate::config::{SyncConfig, TrackedEntity};
use crate::enrich::{Enricher, LoadReport};
use crate::error::{Result, SyncError};
use crate::fanout::DependencyResolver;
use crate::metrics;
use crate::scanner::ChangeScanner;
use crate::sink::SearchSink;
use crate::source::SourceDatabase;
use crate::watermark::WatermarkStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// The incremental sync engine.
///
/// Owns one logical worker: entities are swept strictly in sequence and
/// pages strictly in order, so at most one watermark is in flight.
pub struct SyncEngine<D: SourceDatabase, K: SearchSink> {
    config: SyncConfig,
    sink: Arc<K>,
    scanner: ChangeScanner<D>,
    resolver: DependencyResolver<D>,
    enricher: Enricher<D, K>,
    watermarks: WatermarkStore,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
}

impl<D: SourceDatabase, K: SearchSink> SyncEngine<D, K> {
    /// Create an engine over a source, a sink and a watermark store.
    ///
    /// The engine starts in `Created` state.
    pub fn new(config: SyncConfig, source: Arc<D>, sink: Arc<K>, watermarks: WatermarkStore) -> Self {
        let settings = &config.settings;
        let scanner = ChangeScanner::new(
            Arc::clone(&source),
            settings.fetch_size,
            settings.chunk_size,
            settings.retry.clone(),
        );
        let resolver =
            DependencyResolver::new(Arc::clone(&source), settings.chunk_size, settings.retry.clone());
        let enricher = Enricher::new(
            source,
            Arc::clone(&sink),
            settings.fetch_size,
            config.sink.bulk_chunk_size,
            settings.retry.clone(),
        );
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        Self {
            config,
            sink,
            scanner,
            resolver,
            enricher,
            watermarks,
            state_tx,
            state_rx,
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Watermark store (diagnostics and tests).
    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Ensure the index, then sweep until `shutdown` flips to `true`.
    ///
    /// Returns an error only if the index cannot be ensured; sweep errors
    /// are logged and retried on the next sweep.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(SyncError::Internal(format!(
                "run() called in state {}",
                self.state()
            )));
        }

        info!(
            index = %self.config.sink.index,
            tracked = self.config.tracked.len(),
            fetch_size = self.config.settings.fetch_size,
            chunk_size = self.config.settings.chunk_size,
            "Starting sync engine"
        );

        if let Err(e) = self.sink.ensure_index().await {
            error!(error = %e, "Cannot ensure search index");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        self.set_state(EngineState::Running);
        let interval = self.config.settings.sweep_interval_duration();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.sweep_until(&shutdown).await;
            if report.is_clean() {
                debug!(
                    rows = report.rows_scanned(),
                    written = report.documents_written(),
                    "Sweep clean"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    // A dropped sender also means stop.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutting down sync engine");
        self.set_state(EngineState::ShuttingDown);
        self.set_state(EngineState::Stopped);
        info!("Sync engine stopped");
        Ok(())
    }

    /// Run one sweep over every tracked entity.
    pub async fn sweep(&self) -> SweepReport {
        let (_tx, rx) = watch::channel(false);
        self.sweep_until(&rx).await
    }

    async fn sweep_until(&self, shutdown: &watch::Receiver<bool>) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        async {
            for entity in &self.config.tracked {
                if *shutdown.borrow() {
                    break;
                }

                let span = info_span!("sync_entity", entity = %entity.name);
                match self.sync_entity(entity, shutdown).instrument(span).await {
                    Ok(entity_report) => report.entities.push(entity_report),
                    Err(e) => {
                        error!(entity = %entity.name, error = %e, "Entity sync failed, watermark unchanged");
                        metrics::record_error(&entity.name, error_label(&e));
                        report.failed.push((entity.name.clone(), e.to_string()));
                    }
                }
            }
        }
        .instrument(info_span!("sweep"))
        .await;

        report.duration = started.elapsed();
        metrics::record_sweep(report.duration, report.documents_written());
        info!(
            rows = report.rows_scanned(),
            written = report.documents_written(),
            failed = report.failed.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Sweep finished"
        );
        report
    }

    /// Sync one tracked entity: fetch and commit page by page.
    pub async fn sync_entity(
        &self,
        entity: &TrackedEntity,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<EntityReport> {
        let mut report = EntityReport::new(&entity.name);
        let mut watermark = self.watermarks.load_token(&entity.name).await?;
        let mut pages = self.scanner.pages(entity, watermark);

        // Every page of one snapshot reflects state from before the first
        // projection, so an aggregate written this call is current for it.
        let mut delivered: HashSet<Uuid> = HashSet::new();
        let mut snapshot = 0;

        loop {
            if !pages.is_exhausted() && pages.row_count() > 0 && *shutdown.borrow() {
                report.held = Some(HoldReason::Shutdown);
                metrics::record_watermark_held(&entity.name, HoldReason::Shutdown.as_str());
                break;
            }
            let Some(page) = pages.next_page().await? else {
                break;
            };
            if pages.snapshot() != snapshot {
                delivered.clear();
                snapshot = pages.snapshot();
            }

            let page_started = Instant::now();
            let mut load = LoadReport::default();
            let mut fresh_ids = Vec::new();
            let mut batches = self.resolver.batches(entity, &page.ids);
            while let Some(batch) = batches.next_batch().await? {
                let fresh: Vec<Uuid> = batch.into_iter().filter(|id| !delivered.contains(id)).collect();
                if fresh.is_empty() {
                    continue;
                }
                load += self.enricher.enrich_and_load(&fresh).await?;
                fresh_ids.extend(fresh);
            }

            report.aggregates += batches.total();
            report.load += load;
            metrics::record_page_load(&entity.name, load.submitted, load.written, page_started.elapsed());

            if !load.is_complete() {
                warn!(
                    submitted = load.submitted,
                    written = load.written,
                    watermark = %watermark,
                    "Partial write, holding watermark"
                );
                report.held = Some(HoldReason::PartialWrite);
                metrics::record_watermark_held(&entity.name, HoldReason::PartialWrite.as_str());
                break;
            }
            let skipped = batches.total() - fresh_ids.len();
            delivered.extend(fresh_ids);

            if let Err(e) = self.watermarks.store_token(&entity.name, &page.checkpoint).await {
                warn!(error = %e, "Watermark not persisted, page will be re-delivered");
                report.held = Some(HoldReason::PersistFailed);
                metrics::record_watermark_held(&entity.name, HoldReason::PersistFailed.as_str());
                break;
            }

            watermark = page.checkpoint;
            report.pages_committed += 1;
            report.watermark = Some(watermark);
            metrics::record_watermark_advance(&entity.name, watermark.modified.timestamp());
            debug!(
                ids = page.ids.len(),
                written = load.written,
                already_written = skipped,
                watermark = %watermark,
                "Page committed"
            );
        }

        report.rows_scanned = pages.row_count();
        report.saturated = pages.is_saturated();
        if report.rows_scanned == 0 {
            debug!(watermark = %watermark, "No changes");
            return Ok(report);
        }

        info!(
            rows = report.rows_scanned,
            aggregates = report.aggregates,
            written = report.load.written,
            pages = report.pages_committed,
            saturated = report.saturated,
            "Entity synced"
        );
        Ok(report)
    }
}

fn error_label(e: &SyncError) -> &'static str {
    match e {
        SyncError::Source { .. } => "source",
        SyncError::Sink { .. } => "sink",
        SyncError::WatermarkStore(_) => "watermark",
        SyncError::Config(_) => "config",
        SyncError::UnknownQuery(_) => "unknown_query",
        SyncError::Decode(_) => "decode",
        SyncError::Shutdown => "shutdown",
        SyncError::Internal(_) => "internal",
    }
}
