#![no_main]
//! Fuzz target for spawn request parsing
//!
//! Feeds random bytes as JSON lines; parsing must never panic, and anything
//! accepted must pass validation.

use libfuzzer_sys::fuzz_target;

use multiplexer::wire::SpawnRequest;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(request) = SpawnRequest::from_json_line(s) {
            assert!(request.validate().is_ok());
        }
    }
});
