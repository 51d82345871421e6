// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source database access.
//!
//! The engine only needs three queries from the source of record, expressed
//! by [`SourceDatabase`]:
//!
//! | Operation | Query shape |
//! |-----------|-------------|
//! | `scan_changes` | ordered, limited range scan over `(updated_at, id)`, streamed |
//! | `fan_out` | distinct film work ids linked to a set of leaf ids |
//! | `project` | one denormalized row per film work id |
//!
//! [`PgSource`] is the Postgres implementation. Table and column names come
//! from validated config; every value is a bound parameter. Retries are the
//! caller's concern (see [`crate::resilience::retry`]), so each call here is
//! exactly one query.
//!
//! The change scan is a stream: rows arrive as the caller pulls them, and all
//! of them come from the one statement snapshot taken when it started.

use crate::config::{SourceConfig, TrackedEntity};
use crate::document::FilmWorkRow;
use crate::error::{Result, SyncError};
use crate::resilience::{retry, RetryConfig};
use crate::watermark::WatermarkToken;
use crate::{BoxFuture, RowStream};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// A row seen by a change scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct ChangeRecord {
    pub id: Uuid,
    #[sqlx(rename = "updated_at")]
    pub modified: DateTime<Utc>,
}

impl ChangeRecord {
    /// Token that checkpoints this row.
    pub fn token(&self) -> WatermarkToken {
        WatermarkToken::at(self.modified, self.id)
    }
}

/// Queries the engine runs against the source of record.
pub trait SourceDatabase: Send + Sync + 'static {
    /// Up to `limit` rows of `entity` strictly after `after`, ascending.
    ///
    /// The query runs when the stream is first polled; dropping the stream
    /// abandons it.
    fn scan_changes<'a>(
        &'a self,
        entity: &'a TrackedEntity,
        after: WatermarkToken,
        limit: usize,
    ) -> RowStream<'a, ChangeRecord>;

    /// Up to `limit` distinct film work ids (ascending, `> after`) that
    /// reference any of `ids` through the entity's link table.
    ///
    /// Only defined for leaf entities; an aggregate yields
    /// [`SyncError::UnknownQuery`].
    fn fan_out<'a>(
        &'a self,
        entity: &'a TrackedEntity,
        ids: &'a [Uuid],
        after: Option<Uuid>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Uuid>>;

    /// Denormalized projection rows for the given film work ids.
    fn project<'a>(&'a self, ids: &'a [Uuid]) -> BoxFuture<'a, Vec<FilmWorkRow>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Postgres
// ═══════════════════════════════════════════════════════════════════════════════

/// Postgres-backed [`SourceDatabase`].
#[derive(Debug, Clone)]
pub struct PgSource {
    pool: PgPool,
    schema: String,
    aggregate_table: String,
    /// Scan query per tracked entity name.
    scan_sql: HashMap<String, String>,
    project_sql: String,
}

impl PgSource {
    /// Connect with bounded startup retries.
    ///
    /// Exhausting [`RetryConfig::startup()`] is returned as an error; the
    /// binary treats it as fatal.
    pub async fn connect(config: &SourceConfig, tracked: &[TrackedEntity]) -> Result<Self> {
        let options = config.connect_options()?;
        // An open change scan holds one connection while pages are enriched.
        let max_connections = config.max_connections.max(2);

        info!(
            host = %config.host,
            dbname = %config.dbname,
            schema = %config.schema,
            "Connecting to source database"
        );

        let pool = retry("connect_source", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await
                    .map_err(|e| SyncError::source("connect_source", e))
            }
        })
        .await?;

        info!("Source database connected");
        Ok(Self::from_pool(pool, &config.schema, tracked))
    }

    /// Wrap an existing pool. `schema` and the tracked entities must hold
    /// validated identifiers.
    pub fn from_pool(pool: PgPool, schema: &str, tracked: &[TrackedEntity]) -> Self {
        let aggregate_table = aggregate_table(tracked);
        let project_sql = format!(
            r#"SELECT fw.id, fw.title, fw.description, fw.rating,
                (SELECT json_agg(json_build_object('role', pfw.role, 'id', p.id, 'name', p.full_name)
                                 ORDER BY p.full_name)
                   FROM {s}.person_film_work pfw
                   JOIN {s}.person p ON p.id = pfw.person_id
                  WHERE pfw.film_work_id = fw.id) AS persons,
                (SELECT json_agg(g.name ORDER BY g.name)
                   FROM {s}.genre_film_work gfw
                   JOIN {s}.genre g ON g.id = gfw.genre_id
                  WHERE gfw.film_work_id = fw.id) AS genres
               FROM {s}.{agg} fw
              WHERE fw.id = ANY($1)
              ORDER BY fw.id"#,
            s = schema,
            agg = aggregate_table,
        );

        let scan_sql = tracked
            .iter()
            .map(|entity| (entity.name.clone(), scan_sql(schema, entity)))
            .collect();

        Self {
            pool,
            schema: schema.to_string(),
            aggregate_table: aggregate_table.to_string(),
            scan_sql,
            project_sql,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn fan_out_sql(&self, entity: &TrackedEntity) -> Result<String> {
        let link = entity.link.as_ref().ok_or_else(|| {
            SyncError::UnknownQuery(format!("fan-out for aggregate {}", entity.name))
        })?;
        Ok(format!(
            "SELECT DISTINCT fw.id FROM {s}.{agg} fw \
             LEFT JOIN {s}.{lt} l ON l.film_work_id = fw.id \
             WHERE l.{lc} = ANY($1) AND fw.id > $2 \
             ORDER BY fw.id LIMIT $3",
            s = self.schema,
            agg = self.aggregate_table,
            lt = link.table,
            lc = link.column,
        ))
    }
}

fn scan_sql(schema: &str, entity: &TrackedEntity) -> String {
    format!(
        "SELECT id, updated_at FROM {}.{} \
         WHERE (updated_at, id) > ($1, $2) \
         ORDER BY updated_at, id LIMIT $3",
        schema, entity.table
    )
}

/// Table of the first aggregate entity, `film_work` if none is tracked.
fn aggregate_table(tracked: &[TrackedEntity]) -> &str {
    tracked
        .iter()
        .find(|t| t.is_aggregate())
        .map(|t| t.table.as_str())
        .unwrap_or("film_work")
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl SourceDatabase for PgSource {
    fn scan_changes<'a>(
        &'a self,
        entity: &'a TrackedEntity,
        after: WatermarkToken,
        limit: usize,
    ) -> RowStream<'a, ChangeRecord> {
        let Some(sql) = self.scan_sql.get(&entity.name) else {
            let err = SyncError::UnknownQuery(format!("change scan for {}", entity.name));
            return stream::once(async move { Err(err) }).boxed();
        };

        debug!(entity = %entity.name, after = %after, limit, "Opening change scan");
        sqlx::query_as::<_, ChangeRecord>(sql)
            .bind(after.modified)
            .bind(after.tie_break_id())
            .bind(sql_limit(limit))
            .fetch(&self.pool)
            .map_err(|e| SyncError::source("scan_changes", e))
            .boxed()
    }

    fn fan_out<'a>(
        &'a self,
        entity: &'a TrackedEntity,
        ids: &'a [Uuid],
        after: Option<Uuid>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Uuid>> {
        Box::pin(async move {
            let sql = self.fan_out_sql(entity)?;
            sqlx::query_scalar::<_, Uuid>(&sql)
                .bind(ids)
                .bind(after.unwrap_or(Uuid::nil()))
                .bind(sql_limit(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SyncError::source("fan_out", e))
        })
    }

    fn project<'a>(&'a self, ids: &'a [Uuid]) -> BoxFuture<'a, Vec<FilmWorkRow>> {
        Box::pin(async move {
            sqlx::query_as::<_, FilmWorkRow>(&self.project_sql)
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SyncError::source("project", e))
        })
    }
}
