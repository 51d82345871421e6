//! Shared test utilities for engine and integration tests.
//!
//! This module provides:
//! - An in-memory movie catalogue implementing `SourceDatabase`
//! - A recording `SearchSink`
//! - Postgres / Elasticsearch testcontainer setup

#![allow(dead_code)]

pub mod containers;
pub mod mock_sink;
pub mod mock_source;

pub use containers::*;
pub use mock_sink::*;
pub use mock_source::*;
