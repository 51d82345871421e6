// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Watermark persistence for change streams.
//!
//! Stores the last checkpointed modification token for each tracked entity
//! as one JSON object on disk (`{"person": "...", "genre": "..."}`). A missing
//! file is equivalent to an empty mapping.
//!
//! # Write Semantics
//!
//! Every [`WatermarkStore::set()`] is a read-modify-write of the whole map:
//! unrelated keys are preserved, and the new file is written to a sibling
//! temp file and renamed over the old one. If the write fails, the durable
//! file still holds the previous value and the attempted value is dropped.
//!
//! # Absent vs. Empty
//!
//! [`WatermarkStore::get()`] returns `None` only for a key that was never
//! written. A key explicitly set to `""` or to the sentinel comes back as
//! that string, so first-run initialization can tell "never ran" from
//! "ran and found nothing".
//!
//! # Token Format
//!
//! ```text
//! 2021-06-16T20:14:09.221855+00:00                                        (timestamp only)
//! 2021-06-16T20:14:09.221855+00:00|3d825f60-9fff-4dfe-b294-1a45fa1e115d   (timestamp + tie-break id)
//! ```
//!
//! The legacy `YYYY-MM-DD HH:MM:SS[.ffffff]` form is accepted and read as UTC.

use crate::error::{Result, SyncError};
use crate::BoxFuture;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Token for a key that was never written: the birth of cinema, old enough
/// to select every row on first run.
pub const DAWN_OF_CINEMA: &str = "1895-12-28 00:00:00";

// ═══════════════════════════════════════════════════════════════════════════════
// WatermarkToken
// ═══════════════════════════════════════════════════════════════════════════════

/// Position in a change stream: the `(updated_at, id)` of the last row
/// whose derived documents were durably written.
///
/// Ordering is lexicographic on `(modified, last_id)` with `None` lowest,
/// matching the row comparison used by the scan query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatermarkToken {
    pub modified: DateTime<Utc>,
    pub last_id: Option<Uuid>,
}

impl WatermarkToken {
    /// Token for a row.
    pub fn at(modified: DateTime<Utc>, id: Uuid) -> Self {
        Self {
            modified,
            last_id: Some(id),
        }
    }

    /// The first-run sentinel.
    pub fn dawn() -> Self {
        // The constant is valid; the fallback is unreachable.
        DAWN_OF_CINEMA.parse().unwrap_or(Self {
            modified: DateTime::<Utc>::MIN_UTC,
            last_id: None,
        })
    }

    /// Id used as the scan tie-breaker (nil sorts before every real id).
    pub fn tie_break_id(&self) -> Uuid {
        self.last_id.unwrap_or(Uuid::nil())
    }
}

impl fmt::Display for WatermarkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.modified.to_rfc3339_opts(SecondsFormat::Micros, false);
        match self.last_id {
            Some(id) => write!(f, "{}|{}", ts, id),
            None => write!(f, "{}", ts),
        }
    }
}

impl FromStr for WatermarkToken {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (ts, id) = match s.split_once('|') {
            Some((ts, id)) => (ts.trim(), Some(id.trim())),
            None => (s.trim(), None),
        };

        let modified = parse_timestamp(ts).ok_or_else(|| {
            SyncError::WatermarkStore(format!("Unparseable watermark timestamp: {:?}", s))
        })?;

        let last_id = match id {
            Some(id) => Some(Uuid::parse_str(id).map_err(|e| {
                SyncError::WatermarkStore(format!("Unparseable watermark id {:?}: {}", id, e))
            })?),
            None => None,
        };

        Ok(Self { modified, last_id })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Postgres text output, e.g. "2021-06-16 20:14:09.221855+00"
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage backends
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the watermark map lives.
pub trait StateStorage: Send + Sync + 'static {
    /// Read the full map. A store that was never written returns an empty map.
    fn load(&self) -> BoxFuture<'_, HashMap<String, String>>;

    /// Replace the full map. On error the previous durable state must survive.
    fn save<'a>(&'a self, state: &'a HashMap<String, String>) -> BoxFuture<'a, ()>;
}

impl<S: StateStorage> StateStorage for Arc<S> {
    fn load(&self) -> BoxFuture<'_, HashMap<String, String>> {
        (**self).load()
    }

    fn save<'a>(&'a self, state: &'a HashMap<String, String>) -> BoxFuture<'a, ()> {
        (**self).save(state)
    }
}

/// Single JSON file, replaced atomically via temp file + rename.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "watermarks.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStorage for JsonFileStorage {
    fn load(&self) -> BoxFuture<'_, HashMap<String, String>> {
        Box::pin(async move {
            let text = match tokio::fs::read_to_string(&self.path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
                Err(e) => {
                    return Err(SyncError::WatermarkStore(format!(
                        "Cannot read {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            };

            if text.trim().is_empty() {
                return Ok(HashMap::new());
            }

            serde_json::from_str(&text).map_err(|e| {
                SyncError::WatermarkStore(format!("Corrupt state file {}: {}", self.path.display(), e))
            })
        })
    }

    fn save<'a>(&'a self, state: &'a HashMap<String, String>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let io_err = |e: std::io::Error| {
                SyncError::WatermarkStore(format!("Cannot write {}: {}", self.path.display(), e))
            };

            let body = serde_json::to_vec_pretty(state)
                .map_err(|e| SyncError::WatermarkStore(e.to_string()))?;

            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }

            let tmp = self.temp_path();
            let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
            file.write_all(&body).await.map_err(io_err)?;
            file.sync_all().await.map_err(io_err)?;
            drop(file);

            tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
            Ok(())
        })
    }
}

/// In-process backend (tests, dry runs). Saves can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: StdMutex<HashMap<String, String>>,
    fail_saves: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn snapshot(&self) -> HashMap<String, String> {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StateStorage for MemoryStorage {
    fn load(&self) -> BoxFuture<'_, HashMap<String, String>> {
        let state = self.snapshot();
        Box::pin(async move { Ok(state) })
    }

    fn save<'a>(&'a self, state: &'a HashMap<String, String>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(SyncError::WatermarkStore("Simulated save failure".to_string()));
            }
            let mut guard = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = state.clone();
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WatermarkStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Named watermark persistence over a [`StateStorage`] backend.
pub struct WatermarkStore {
    storage: Box<dyn StateStorage>,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl WatermarkStore {
    /// Create a store over any backend.
    pub fn new(storage: impl StateStorage) -> Self {
        Self {
            storage: Box::new(storage),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store backed by a JSON file.
    pub fn open_file(path: impl AsRef<Path>) -> Self {
        info!(path = %path.as_ref().display(), "Using watermark file");
        Self::new(JsonFileStorage::new(path))
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    /// Get the persisted token for a key.
    ///
    /// Returns `None` if the key was never written.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.storage.load().await?;
        Ok(state.get(key).cloned())
    }

    /// Persist a token for a key, preserving all other keys.
    ///
    /// On failure the previously durable value remains authoritative.
    pub async fn set(&self, key: &str, token: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut state = self.storage.load().await?;
        let previous = state.insert(key.to_string(), token.to_string());

        match self.storage.save(&state).await {
            Ok(()) => {
                debug!(key, token, previous = ?previous, "Watermark persisted");
                Ok(())
            }
            Err(e) => {
                warn!(
                    key,
                    attempted = token,
                    kept = ?previous,
                    error = %e,
                    "Failed to persist watermark, previous value stays authoritative"
                );
                Err(e)
            }
        }
    }

    /// Get the token for a key, writing `default` first if it is absent.
    pub async fn get_or_init(&self, key: &str, default: &str) -> Result<String> {
        if let Some(token) = self.get(key).await? {
            return Ok(token);
        }
        info!(key, default, "Watermark not found, initializing");
        self.set(key, default).await?;
        Ok(default.to_string())
    }

    /// Parsed token for a key (initialized to [`DAWN_OF_CINEMA`] if absent).
    ///
    /// A stored empty string stays as it is but loads as the dawn token.
    pub async fn load_token(&self, key: &str) -> Result<WatermarkToken> {
        let stored = self.get_or_init(key, DAWN_OF_CINEMA).await?;
        if stored.trim().is_empty() {
            debug!(key, "Empty watermark, scanning from the beginning");
            return Ok(WatermarkToken::dawn());
        }
        stored.parse()
    }

    /// Persist a parsed token.
    pub async fn store_token(&self, key: &str, token: &WatermarkToken) -> Result<()> {
        self.set(key, &token.to_string()).await
    }

    /// All persisted watermarks (for diagnostics).
    pub async fn all(&self) -> Result<HashMap<String, String>> {
        self.storage.load().await
    }
}
