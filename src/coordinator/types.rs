//! Engine state and sweep reports.
//!
//! # State Transitions
//!
//! ```text
//!           run()
//! Created ─────────→ Running ──── shutdown signal ───→ ShuttingDown ───→ Stopped
//!                       │
//!                       │ (index cannot be ensured)
//!                       ↓
//!                    Failed
//! ```
//!
//! A sweep never moves the engine to `Failed`: per-entity errors are
//! reported in [`SweepReport::failed`] and retried next sweep.

use crate::enrich::LoadReport;
use crate::watermark::WatermarkToken;
use std::time::Duration;

/// State of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`run()`](super::SyncEngine::run) to begin syncing.
    Created,

    /// Sweeping tracked entities in a loop.
    Running,

    /// Shutdown requested; the current page finishes, no new page starts.
    ShuttingDown,

    /// Loop exited cleanly.
    Stopped,

    /// Startup failed (index could not be ensured).
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why a tracked entity's watermark stopped short of the scanned rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// The sink wrote fewer documents than were submitted.
    PartialWrite,
    /// The watermark file could not be updated.
    PersistFailed,
    /// Shutdown was requested between pages.
    Shutdown,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldReason::PartialWrite => "partial_write",
            HoldReason::PersistFailed => "persist_failed",
            HoldReason::Shutdown => "shutdown",
        }
    }
}

/// What one sweep did for one tracked entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityReport {
    pub entity: String,
    /// Rows returned by the change scan.
    pub rows_scanned: usize,
    /// Pages whose checkpoint was persisted.
    pub pages_committed: usize,
    /// Aggregate ids the scanned rows fanned out to.
    pub aggregates: usize,
    pub load: LoadReport,
    /// Last persisted watermark, if it advanced this sweep.
    pub watermark: Option<WatermarkToken>,
    /// Scan hit the row cap; more backlog may remain.
    pub saturated: bool,
    /// Set when pages were left uncommitted.
    pub held: Option<HoldReason>,
}

impl EntityReport {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            ..Default::default()
        }
    }
}

/// What one sweep did across all tracked entities.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub entities: Vec<EntityReport>,
    /// `(entity, error)` for entities whose sync returned an error.
    pub failed: Vec<(String, String)>,
    pub duration: Duration,
}

impl SweepReport {
    /// Documents written across all entities.
    pub fn documents_written(&self) -> usize {
        self.entities.iter().map(|e| e.load.written).sum()
    }

    /// Rows scanned across all entities.
    pub fn rows_scanned(&self) -> usize {
        self.entities.iter().map(|e| e.rows_scanned).sum()
    }

    /// No errors and no held watermarks.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.entities.iter().all(|e| e.held.is_none())
    }

    /// Report for a named entity.
    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity == name)
    }
}
