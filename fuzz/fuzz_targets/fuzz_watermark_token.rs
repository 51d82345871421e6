//! Fuzz target for watermark token parsing.
//!
//! Persisted state files are read back on every sweep; a malformed
//! token must produce an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use search_sync_engine::watermark::WatermarkToken;

fuzz_target!(|data: &str| {
    let Ok(token) = data.parse::<WatermarkToken>() else {
        return;
    };

    // The canonical form is a fixed point (sub-microsecond digits drop once).
    let canonical = token.to_string();
    if let Ok(again) = canonical.parse::<WatermarkToken>() {
        assert_eq!(again.to_string(), canonical);
        assert!(again <= token);
    }
});
