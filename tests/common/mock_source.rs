// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory `SourceDatabase` for testing.
//!
//! Models the `content` schema: film works, persons, genres and the two link
//! tables. Every row carries an `updated_at`; scans, fan-out and projection
//! follow the same ordering and bounds as the Postgres queries.
//!
//! Failures can be injected per operation, either transient (retryable) or
//! permanent.

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use search_sync_engine::source::{ChangeRecord, SourceDatabase};
use search_sync_engine::{
    BoxFuture, FilmWorkRow, PersonRole, RowStream, SyncError, TrackedEntity, WatermarkToken,
};
use sqlx::types::Json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Fixed base so timestamps in tests are readable offsets.
pub fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 6, 16, 0, 0, 0).unwrap() + Duration::seconds(seconds)
}

#[derive(Default)]
struct Catalogue {
    /// table -> id -> updated_at
    modified: HashMap<String, HashMap<Uuid, DateTime<Utc>>>,
    films: HashMap<Uuid, (String, Option<f64>)>,
    persons: HashMap<Uuid, String>,
    genres: HashMap<Uuid, String>,
    /// (person, film, role)
    person_links: Vec<(Uuid, Uuid, String)>,
    /// (genre, film)
    genre_links: Vec<(Uuid, Uuid)>,
}

/// Which operation a failure is injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Scan,
    FanOut,
    Project,
}

/// In-memory movie catalogue.
pub struct MockSource {
    catalogue: RwLock<Catalogue>,
    /// Remaining transient failures per operation.
    transient: RwLock<HashMap<Op, usize>>,
    /// Entity names whose operations fail permanently.
    broken: RwLock<HashSet<(Op, String)>>,
    /// Rows the next scan yields before failing.
    interrupt: RwLock<Option<usize>>,
    scan_calls: AtomicUsize,
    fan_out_calls: AtomicUsize,
    project_calls: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            catalogue: RwLock::new(Catalogue::default()),
            transient: RwLock::new(HashMap::new()),
            broken: RwLock::new(HashSet::new()),
            interrupt: RwLock::new(None),
            scan_calls: AtomicUsize::new(0),
            fan_out_calls: AtomicUsize::new(0),
            project_calls: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Catalogue setup
    // =========================================================================

    pub async fn add_film(&self, title: &str, at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let mut c = self.catalogue.write().await;
        c.films.insert(id, (title.to_string(), Some(7.0)));
        c.modified.entry("film_work".into()).or_default().insert(id, at);
        id
    }

    /// Add a film with a chosen id (for deterministic ordering).
    pub async fn add_film_with_id(&self, id: Uuid, title: &str, at: DateTime<Utc>) {
        let mut c = self.catalogue.write().await;
        c.films.insert(id, (title.to_string(), None));
        c.modified.entry("film_work".into()).or_default().insert(id, at);
    }

    pub async fn add_person(&self, name: &str, at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let mut c = self.catalogue.write().await;
        c.persons.insert(id, name.to_string());
        c.modified.entry("person".into()).or_default().insert(id, at);
        id
    }

    pub async fn add_genre(&self, name: &str, at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let mut c = self.catalogue.write().await;
        c.genres.insert(id, name.to_string());
        c.modified.entry("genre".into()).or_default().insert(id, at);
        id
    }

    pub async fn credit(&self, person: Uuid, film: Uuid, role: &str) {
        let mut c = self.catalogue.write().await;
        c.person_links.push((person, film, role.to_string()));
    }

    pub async fn tag(&self, genre: Uuid, film: Uuid) {
        let mut c = self.catalogue.write().await;
        c.genre_links.push((genre, film));
    }

    /// Bump `updated_at` of a row.
    pub async fn touch(&self, table: &str, id: Uuid, at: DateTime<Utc>) {
        let mut c = self.catalogue.write().await;
        c.modified.entry(table.to_string()).or_default().insert(id, at);
    }

    /// Rename a film (and bump its `updated_at`).
    pub async fn retitle(&self, film: Uuid, title: &str, at: DateTime<Utc>) {
        let mut c = self.catalogue.write().await;
        if let Some(entry) = c.films.get_mut(&film) {
            entry.0 = title.to_string();
        }
        c.modified.entry("film_work".into()).or_default().insert(film, at);
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Fail the next `n` calls of `op` with a retryable error.
    pub async fn fail_transiently(&self, op: Op, n: usize) {
        self.transient.write().await.insert(op, n);
    }

    /// Fail the next scan with a retryable error after it yields `rows` rows.
    pub async fn interrupt_scan_after(&self, rows: usize) {
        *self.interrupt.write().await = Some(rows);
    }

    /// Fail every call of `op` for `entity` with a non-retryable error.
    pub async fn break_entity(&self, op: Op, entity: &str) {
        self.broken.write().await.insert((op, entity.to_string()));
    }

    pub async fn repair_entity(&self, op: Op, entity: &str) {
        self.broken.write().await.remove(&(op, entity.to_string()));
    }

    async fn check(&self, op: Op, entity: &str) -> search_sync_engine::Result<()> {
        let operation = match op {
            Op::Scan => "scan_changes",
            Op::FanOut => "fan_out",
            Op::Project => "project",
        };

        if self.broken.read().await.contains(&(op, entity.to_string())) {
            return Err(SyncError::source(
                operation,
                sqlx::Error::ColumnNotFound(format!("{}_broken", entity)),
            ));
        }

        let mut transient = self.transient.write().await;
        if let Some(remaining) = transient.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::source(operation, sqlx::Error::PoolTimedOut));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Call counters
    // =========================================================================

    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn fan_out_calls(&self) -> usize {
        self.fan_out_calls.load(Ordering::SeqCst)
    }

    pub fn project_calls(&self) -> usize {
        self.project_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceDatabase for MockSource {
    fn scan_changes<'a>(
        &'a self,
        entity: &'a TrackedEntity,
        after: WatermarkToken,
        limit: usize,
    ) -> RowStream<'a, ChangeRecord> {
        // The result set is fixed when the stream is first polled.
        let snapshot = async move {
            self.scan_calls.fetch_add(1, Ordering::SeqCst);
            self.check(Op::Scan, &entity.name).await?;

            let c = self.catalogue.read().await;
            let floor = (after.modified, after.tie_break_id());
            let mut rows: Vec<ChangeRecord> = c
                .modified
                .get(&entity.table)
                .map(|t| {
                    t.iter()
                        .map(|(id, at)| ChangeRecord { id: *id, modified: *at })
                        .filter(|r| (r.modified, r.id) > floor)
                        .collect()
                })
                .unwrap_or_default();

            rows.sort_by_key(|r| (r.modified, r.id));
            rows.truncate(limit);
            let mut items: Vec<search_sync_engine::Result<ChangeRecord>> =
                rows.into_iter().map(Ok).collect();
            if let Some(n) = self.interrupt.write().await.take() {
                items.truncate(n);
                items.push(Err(SyncError::source("scan_changes", sqlx::Error::PoolTimedOut)));
            }
            Ok::<_, SyncError>(stream::iter(items))
        };
        stream::once(snapshot).try_flatten().boxed()
    }

    fn fan_out<'a>(
        &'a self,
        entity: &'a TrackedEntity,
        ids: &'a [Uuid],
        after: Option<Uuid>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Uuid>> {
        Box::pin(async move {
            self.fan_out_calls.fetch_add(1, Ordering::SeqCst);
            let link = entity.link.as_ref().ok_or_else(|| {
                SyncError::UnknownQuery(format!("fan-out for aggregate {}", entity.name))
            })?;
            self.check(Op::FanOut, &entity.name).await?;

            let c = self.catalogue.read().await;
            let wanted: HashSet<&Uuid> = ids.iter().collect();
            let films: BTreeSet<Uuid> = match link.table.as_str() {
                "person_film_work" => c
                    .person_links
                    .iter()
                    .filter(|(p, _, _)| wanted.contains(p))
                    .map(|(_, f, _)| *f)
                    .collect(),
                "genre_film_work" => c
                    .genre_links
                    .iter()
                    .filter(|(g, _)| wanted.contains(g))
                    .map(|(_, f)| *f)
                    .collect(),
                other => return Err(SyncError::UnknownQuery(format!("link table {}", other))),
            };

            let floor = after.unwrap_or(Uuid::nil());
            Ok(films.into_iter().filter(|f| *f > floor).take(limit).collect())
        })
    }

    fn project<'a>(&'a self, ids: &'a [Uuid]) -> BoxFuture<'a, Vec<FilmWorkRow>> {
        Box::pin(async move {
            self.project_calls.fetch_add(1, Ordering::SeqCst);
            self.check(Op::Project, "film_work").await?;

            let c = self.catalogue.read().await;
            let mut rows: Vec<FilmWorkRow> = ids
                .iter()
                .filter_map(|id| {
                    let (title, rating) = c.films.get(id)?;
                    let persons: Vec<PersonRole> = c
                        .person_links
                        .iter()
                        .filter(|(_, f, _)| f == id)
                        .filter_map(|(p, _, role)| {
                            Some(PersonRole {
                                role: role.clone(),
                                id: *p,
                                name: c.persons.get(p)?.clone(),
                            })
                        })
                        .collect();
                    let genres: Vec<String> = c
                        .genre_links
                        .iter()
                        .filter(|(_, f)| f == id)
                        .filter_map(|(g, _)| c.genres.get(g).cloned())
                        .collect();

                    Some(FilmWorkRow {
                        id: *id,
                        title: title.clone(),
                        description: None,
                        rating: *rating,
                        persons: (!persons.is_empty()).then(|| Json(persons)),
                        genres: (!genres.is_empty()).then(|| Json(genres)),
                    })
                })
                .collect();

            rows.sort_by_key(|r| r.id);
            Ok(rows)
        })
    }
}
