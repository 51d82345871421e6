//! Configuration for the sync engine.
//!
//! All tunables live in one [`SyncConfig`] enumerated at startup. It can be
//! constructed programmatically or loaded from a TOML file, with endpoints and
//! credentials overridable from the environment.
//!
//! # Quick Start
//!
//! ```rust
//! use search_sync_engine::config::SyncConfig;
//!
//! let config = SyncConfig {
//!     ..SyncConfig::for_testing()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── settings: SyncSettings
//! │   ├── fetch_size: usize        # page size (ids per downstream page)
//! │   ├── chunk_size: usize        # row cap per scan / fan-out batch
//! │   ├── sweep_interval: String   # pause between sweeps ("10s")
//! │   └── retry: RetryConfig       # backoff for every I/O call
//! ├── source: SourceConfig         # Postgres endpoint
//! ├── sink: SinkConfig             # Elasticsearch endpoint + index
//! ├── watermark: WatermarkConfig   # JSON state file
//! └── tracked: Vec<TrackedEntity>  # relations polled for changes
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! [settings]
//! fetch_size = 100
//! chunk_size = 1000
//! sweep_interval = "10s"
//!
//! [source]
//! host = "localhost"
//! dbname = "movies_database"
//! user = "app"
//! password = "secret"
//!
//! [sink]
//! url = "http://localhost:9200"
//! index = "movies"
//!
//! [watermark]
//! path = "/var/lib/search-sync/state.json"
//!
//! [[tracked]]
//! name = "person"
//! table = "person"
//! link = { table = "person_film_work", column = "person_id" }
//! ```

use crate::error::{Result, SyncError};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to [`SyncEngine::new()`](crate::SyncEngine::new).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Page sizes, sweep pause, retry policy.
    #[serde(default)]
    pub settings: SyncSettings,

    /// Postgres source of record.
    #[serde(default)]
    pub source: SourceConfig,

    /// Elasticsearch sink.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Watermark persistence.
    #[serde(default)]
    pub watermark: WatermarkConfig,

    /// Relations polled for changes, scanned in this order every sweep.
    #[serde(default = "default_tracked")]
    pub tracked: Vec<TrackedEntity>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settings: SyncSettings::default(),
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
            watermark: WatermarkConfig::default(),
            tracked: default_tracked(),
        }
    }
}

impl SyncConfig {
    /// Create a minimal config for testing.
    pub fn for_testing() -> Self {
        Self {
            settings: SyncSettings {
                fetch_size: 2,
                chunk_size: 10,
                sweep_interval: "10ms".to_string(),
                retry: RetryConfig::testing(),
            },
            ..Default::default()
        }
    }

    /// Load from a TOML file (missing file = defaults), apply environment
    /// overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| {
                SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
            })?;
            Self::from_toml(&text)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(format!("Invalid config: {}", e)))
    }

    /// Override endpoints and credentials from environment-style variables.
    ///
    /// Takes a lookup function so tests don't have to mutate the process env.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.source.url = Some(url);
        }
        if let Some(v) = lookup("DB_NAME_PG") {
            self.source.dbname = v;
        }
        if let Some(v) = lookup("DB_USER") {
            self.source.user = v;
        }
        if let Some(v) = lookup("DB_PASSWORD") {
            self.source.password = v;
        }
        if let Some(v) = lookup("DB_HOST").or_else(|| lookup("HOST")) {
            self.source.host = v;
        }
        if let Some(port) = lookup("DB_PORT")
            .or_else(|| lookup("PORT"))
            .and_then(|p| p.parse().ok())
        {
            self.source.port = port;
        }
        if let Some(v) = lookup("ES_URL") {
            self.sink.url = v;
        }
        if let Some(v) = lookup("ES_USER") {
            self.sink.username = Some(v);
        }
        if let Some(v) = lookup("ES_PASSWORD") {
            self.sink.password = Some(v);
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.settings.fetch_size == 0 {
            return Err(SyncError::Config("settings.fetch_size must be > 0".into()));
        }
        if self.settings.chunk_size == 0 {
            return Err(SyncError::Config("settings.chunk_size must be > 0".into()));
        }
        self.settings.retry.validate()?;
        if humantime::parse_duration(&self.settings.sweep_interval).is_err() {
            return Err(SyncError::Config(format!(
                "settings.sweep_interval is not a duration: {:?}",
                self.settings.sweep_interval
            )));
        }
        if self.sink.bulk_chunk_size == 0 {
            return Err(SyncError::Config("sink.bulk_chunk_size must be > 0".into()));
        }
        if self.sink.index.is_empty() {
            return Err(SyncError::Config("sink.index must not be empty".into()));
        }
        if self.tracked.is_empty() {
            return Err(SyncError::Config("at least one tracked entity is required".into()));
        }

        validate_identifier("source.schema", &self.source.schema)?;
        let mut seen = std::collections::HashSet::new();
        for entity in &self.tracked {
            if !seen.insert(entity.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "tracked entity {:?} listed twice",
                    entity.name
                )));
            }
            validate_identifier("tracked.name", &entity.name)?;
            validate_identifier("tracked.table", &entity.table)?;
            if let Some(link) = &entity.link {
                validate_identifier("tracked.link.table", &link.table)?;
                validate_identifier("tracked.link.column", &link.column)?;
            }
        }
        Ok(())
    }
}

/// SQL identifiers are spliced into query text, so only plain names pass.
fn validate_identifier(field: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SyncError::Config(format!("{} is not a valid identifier: {:?}", field, value)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Ids handed downstream per page; also the projection query width.
    /// Bounds per-page memory and checkpoint granularity.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// Row cap per change scan and per fan-out batch.
    /// Bounds the backlog drained per sweep.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Pause between sweeps as a duration string (e.g., "10s").
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    /// Backoff applied to every I/O call.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_fetch_size() -> usize {
    100
}

fn default_chunk_size() -> usize {
    1000
}

fn default_sweep_interval() -> String {
    "10s".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_size: 100,
            chunk_size: 1000,
            sweep_interval: "10s".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl SyncSettings {
    /// Parse the sweep_interval string to a Duration.
    pub fn sweep_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.sweep_interval).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: Postgres
// ═══════════════════════════════════════════════════════════════════════════════

/// Postgres connection settings.
///
/// `url` wins over the discrete fields when set.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Schema holding the film_work / person / genre tables.
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "movies_database".to_string()
}

fn default_db_user() -> String {
    "app".to_string()
}

fn default_schema() -> String {
    "content".to_string()
}

fn default_max_connections() -> u32 {
    2
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_db_host(),
            port: default_db_port(),
            dbname: default_dbname(),
            user: default_db_user(),
            password: String::new(),
            schema: default_schema(),
            max_connections: default_max_connections(),
        }
    }
}

// Credentials stay out of logs.
impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("schema", &self.schema)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl SourceConfig {
    /// Build sqlx connect options.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        match &self.url {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| SyncError::Config(format!("Invalid database URL: {}", e))),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .database(&self.dbname)
                .username(&self.user)
                .password(&self.password)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SinkConfig: Elasticsearch
// ═══════════════════════════════════════════════════════════════════════════════

/// Elasticsearch settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_es_url")]
    pub url: String,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Documents per `_bulk` request.
    #[serde(default = "default_bulk_chunk_size")]
    pub bulk_chunk_size: usize,
    /// Per-request timeout as a duration string.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_es_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_index() -> String {
    "movies".to_string()
}

fn default_bulk_chunk_size() -> usize {
    500
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: default_es_url(),
            index: default_index(),
            username: None,
            password: None,
            bulk_chunk_size: default_bulk_chunk_size(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("url", &self.url)
            .field("index", &self.index)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("bulk_chunk_size", &self.bulk_chunk_size)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl SinkConfig {
    /// Parse the request_timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WatermarkConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Watermark persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Path of the JSON state file.
    #[serde(default = "default_watermark_path")]
    pub path: String,
}

fn default_watermark_path() -> String {
    "search_sync_state.json".to_string()
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            path: default_watermark_path(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tracked entities
// ═══════════════════════════════════════════════════════════════════════════════

/// A source relation polled for changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    /// Entity name; also the watermark key.
    pub name: String,
    /// Table inside `source.schema`.
    pub table: String,
    /// How this entity's ids reference film works. `None` = the aggregate itself.
    #[serde(default)]
    pub link: Option<LinkSpec>,
}

/// Link table joining a leaf entity to film works (`<table>.film_work_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub table: String,
    /// Column holding the leaf entity id.
    pub column: String,
}

impl TrackedEntity {
    /// A leaf entity linked to film works through `link_table.link_column`.
    pub fn leaf(name: &str, table: &str, link_table: &str, link_column: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            link: Some(LinkSpec {
                table: link_table.to_string(),
                column: link_column.to_string(),
            }),
        }
    }

    /// The aggregate entity itself (identity fan-out).
    pub fn aggregate(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            link: None,
        }
    }

    /// Whether changes to this entity map 1:1 onto documents.
    pub fn is_aggregate(&self) -> bool {
        self.link.is_none()
    }
}

fn default_tracked() -> Vec<TrackedEntity> {
    vec![
        TrackedEntity::leaf("person", "person", "person_film_work", "person_id"),
        TrackedEntity::leaf("genre", "genre", "genre_film_work", "genre_id"),
        TrackedEntity::aggregate("film_work", "film_work"),
    ]
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
