// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search document model.
//!
//! [`FilmWorkRow`] is what the projection query returns; [`FilmWorkDocument`]
//! is what the search index stores. The conversion between them is total:
//! every list in the document is present (possibly empty), never null.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

/// One person credit on a film work, as aggregated by the projection query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRole {
    pub role: String,
    pub id: Uuid,
    pub name: String,
}

/// Raw projection row: film work columns plus correlated sub-aggregations.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FilmWorkRow {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub rating: Option<f64>,
    /// `NULL` when the film has no credits.
    pub persons: Option<Json<Vec<PersonRole>>>,
    /// `NULL` when the film has no genres.
    pub genres: Option<Json<Vec<String>>>,
}

/// Nested person reference inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: Uuid,
    pub name: String,
}

/// Denormalized film work as indexed. `id` is the upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmWorkDocument {
    pub id: Uuid,
    pub imdb_rating: Option<f64>,
    pub title: String,
    pub description: Option<String>,
    pub genre: Vec<String>,
    pub director: Vec<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
    pub actors: Vec<PersonRef>,
    pub writers: Vec<PersonRef>,
    pub directors: Vec<PersonRef>,
}

impl From<FilmWorkRow> for FilmWorkDocument {
    fn from(row: FilmWorkRow) -> Self {
        let mut actors = Vec::new();
        let mut writers = Vec::new();
        let mut directors = Vec::new();

        for credit in row.persons.map(|Json(p)| p).unwrap_or_default() {
            let person = PersonRef {
                id: credit.id,
                name: credit.name,
            };
            match credit.role.as_str() {
                "actor" => actors.push(person),
                "writer" => writers.push(person),
                "director" => directors.push(person),
                other => debug!(film_work = %row.id, role = other, "Ignoring unknown role"),
            }
        }

        let names = |people: &[PersonRef]| people.iter().map(|p| p.name.clone()).collect();

        Self {
            id: row.id,
            imdb_rating: row.rating,
            title: row.title,
            description: row.description,
            genre: row.genres.map(|Json(g)| g).unwrap_or_default(),
            director: names(&directors),
            actors_names: names(&actors),
            writers_names: names(&writers),
            actors,
            writers,
            directors,
        }
    }
}
