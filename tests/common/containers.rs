// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Postgres and Elasticsearch.

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const PG_USER: &str = "app";
pub const PG_PASSWORD: &str = "secret";
pub const PG_DB: &str = "movies_database";

/// Minimal `content` schema with the columns the engine reads.
pub const CONTENT_SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS content;

CREATE TABLE content.film_work (
    id uuid PRIMARY KEY,
    title text NOT NULL,
    description text,
    rating double precision,
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE content.person (
    id uuid PRIMARY KEY,
    full_name text NOT NULL,
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE content.genre (
    id uuid PRIMARY KEY,
    name text NOT NULL,
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE content.person_film_work (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    film_work_id uuid NOT NULL REFERENCES content.film_work (id) ON DELETE CASCADE,
    person_id uuid NOT NULL REFERENCES content.person (id) ON DELETE CASCADE,
    role text NOT NULL
);

CREATE TABLE content.genre_film_work (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    film_work_id uuid NOT NULL REFERENCES content.film_work (id) ON DELETE CASCADE,
    genre_id uuid NOT NULL REFERENCES content.genre (id) ON DELETE CASCADE
);
"#;

/// Postgres 16 container with the test credentials.
pub fn postgres_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_env_var("POSTGRES_USER", PG_USER)
        .with_env_var("POSTGRES_PASSWORD", PG_PASSWORD)
        .with_env_var("POSTGRES_DB", PG_DB)
        .with_exposed_port(5432)
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ));
    docker.run(image)
}

pub fn postgres_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(5432);
    format!("postgres://{}:{}@127.0.0.1:{}/{}", PG_USER, PG_PASSWORD, port, PG_DB)
}

/// Single-node Elasticsearch 8 with security off.
pub fn elasticsearch_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("docker.elastic.co/elasticsearch/elasticsearch", "8.11.1")
        .with_env_var("discovery.type", "single-node")
        .with_env_var("xpack.security.enabled", "false")
        .with_env_var("ES_JAVA_OPTS", "-Xms512m -Xmx512m")
        .with_exposed_port(9200)
        .with_wait_for(WaitFor::message_on_stdout("started"));
    docker.run(image)
}

pub fn elasticsearch_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(9200);
    format!("http://127.0.0.1:{}", port)
}
