//! Fuzz target for bulk response parsing.
//!
//! The written count can never exceed the number of items, whatever
//! the cluster sends back.

#![no_main]

use libfuzzer_sys::fuzz_target;
use search_sync_engine::sink::parse_bulk_response;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    if let Ok(outcome) = parse_bulk_response(&value) {
        let items = value["items"].as_array().map_or(0, |a| a.len());
        assert!(outcome.written <= items);
        assert!(outcome.written + outcome.failures.len() <= items);
    }
});
