//! Test assertions for multiplexer state

use multiplexer::write_queue::QueueStats;

/// Assert that `parts` occur in `text` in the given order
pub fn assert_in_order(text: &str, parts: &[&str]) {
    let mut from = 0;
    for part in parts {
        match text[from..].find(part) {
            Some(pos) => from += pos + part.len(),
            None => panic!("expected {:?} after byte {} in {:?}", part, from, text),
        }
    }
}

/// Assert that every line of `text` appears at most once
pub fn assert_no_duplicate_lines(text: &str) {
    let mut seen = std::collections::HashSet::new();
    for line in text.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty()) {
        assert!(seen.insert(line), "line {:?} delivered more than once in {:?}", line, text);
    }
}

/// Assert that every byte a queue took in is accounted for
///
/// Holds when the sink never under-reports consumption.
pub fn assert_queue_conserves(stats: &QueueStats, reported_bytes: u64) {
    let taken_in = stats.enqueued_bytes + stats.notice_bytes;
    let accounted = reported_bytes + stats.dropped_bytes + stats.queued_bytes as u64;
    assert_eq!(
        taken_in, accounted,
        "enqueued {} + notices {} should equal reported {} + dropped {} + queued {}",
        stats.enqueued_bytes, stats.notice_bytes, reported_bytes, stats.dropped_bytes, stats.queued_bytes
    );
}

/// Assert that the queue respects its byte bound
///
/// Overflow notices are never dropped, so they may sit on top of the bound.
pub fn assert_queue_bounded(stats: &QueueStats, max_queue_bytes: usize) {
    assert!(
        stats.queued_bytes as u64 <= max_queue_bytes as u64 + stats.notice_bytes,
        "queued {} exceeds bound {} (+{} notice bytes)",
        stats.queued_bytes,
        max_queue_bytes,
        stats.notice_bytes
    );
}
