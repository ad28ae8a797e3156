//! Test fixtures for common test scenarios

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use multiplexer::config::{Config, SuspensionConfig, WriteQueueConfig};
use multiplexer::visibility::Region;
use multiplexer::wire::SpawnRequest;

/// Height of the test viewport, in surface units
pub const VIEWPORT_HEIGHT: u32 = 720;

/// Height of each stacked test terminal
pub const TERMINAL_HEIGHT: u32 = 200;

/// Short enough to wait for in a test
pub const TEST_SUSPEND_AFTER_MS: u32 = 20;

/// Spawn request for a scripted session
pub fn request(id: &str) -> SpawnRequest {
    SpawnRequest {
        id: id.into(),
        cwd: PathBuf::from("/"),
        rows: 24,
        cols: 80,
        env: HashMap::new(),
        command: None,
    }
}

/// Region of the `index`th terminal in a column of stacked terminals
pub fn stacked_region(index: usize) -> Region {
    Region::new(index as i64 * TERMINAL_HEIGHT as i64, TERMINAL_HEIGHT)
}

/// A viewport offset that puts every region of `count` stacked terminals off screen
pub fn offscreen_offset(count: usize) -> i64 {
    (count as i64 + 1) * TERMINAL_HEIGHT as i64 + VIEWPORT_HEIGHT as i64
}

/// Defaults with a short suspension delay
pub fn test_config() -> Config {
    Config {
        suspension: SuspensionConfig {
            suspend_after_ms: TEST_SUSPEND_AFTER_MS,
            max_suspended_terminals: 4,
            snapshot_size_limit_bytes: 64 * 1024,
            keep_alive_terminal_ids: BTreeSet::new(),
            replay_chunk_bytes: 256,
        },
        ..Config::default()
    }
}

/// Queue bounds small enough to overflow with a few writes
pub fn small_queue_config() -> WriteQueueConfig {
    WriteQueueConfig {
        max_queue_bytes: 1024,
        target_after_drop: 512,
        low_water_mark: 128,
        max_write_chunk: 64,
        ..WriteQueueConfig::default()
    }
}

/// Shell-ish output of numbered lines
pub fn numbered_lines(start: u32, end: u32) -> String {
    (start..=end).map(|i| format!("line {}\r\n", i)).collect()
}
