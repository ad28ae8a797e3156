#![no_main]
//! Fuzz target for config TOML parsing
//!
//! Any input must either parse into a config that passes validation or
//! produce an error, never a panic.

use libfuzzer_sys::fuzz_target;

use multiplexer::Config;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = Config::from_toml_str(s) {
            assert!(config.validate().is_ok());
        }
    }
});
