//! Output stream lifecycle tests
//!
//! Streams are driven through the multiplexer's stream manager, without
//! panes, so listeners see exactly what the manager dispatches.

use std::cell::RefCell;
use std::rc::Rc;

use multiplexer::error::StreamError;
use multiplexer::output_stream::{Listener, OutputStreamManager};
use multiplexer::wire::{Frame, TerminalId, TransportKind};
use test_harness::assertions::{assert_in_order, assert_no_duplicate_lines};
use test_harness::fixtures::test_config;
use test_harness::TestMultiplexer;

fn collector() -> (Listener, Rc<RefCell<String>>) {
    let seen = Rc::new(RefCell::new(String::new()));
    let sink = seen.clone();
    let listener: Listener = Rc::new(move |_: &TerminalId, text: &str| -> anyhow::Result<()> {
        sink.borrow_mut().push_str(text);
        Ok(())
    });
    (listener, seen)
}

fn start(tm: &mut TestMultiplexer, id: &TerminalId) -> Result<(), StreamError> {
    let streams = tm.mux.streams().clone();
    let id = id.clone();
    let result = tm
        .harness
        .block_on(async move { streams.ensure_started(&id).await });
    tm.harness.run_until_idle();
    result
}

fn streams(tm: &TestMultiplexer) -> Rc<OutputStreamManager> {
    tm.mux.streams().clone()
}

// ========== Hydration and dedup ==========

#[test]
fn backlog_is_hydrated_once_on_start() {
    for kind in [TransportKind::Standard, TransportKind::Sequenced] {
        let mut tm = TestMultiplexer::new(test_config());
        let (id, script) = tm.spawn("t1");
        tm.emit(&script, "before start\r\n");

        let (listener, seen) = collector();
        streams(&tm).set_transport_kind(&id, kind);
        streams(&tm).add_listener(&id, listener);
        start(&mut tm, &id).unwrap();

        tm.emit(&script, "after start\r\n");

        let text = seen.borrow().clone();
        assert_in_order(&text, &["before start", "after start"]);
        assert_no_duplicate_lines(&text);
        assert_eq!(streams(&tm).transport_kind(&id), Some(kind));
    }
}

#[test]
fn restart_resumes_from_cursor_without_duplicates() {
    for kind in [TransportKind::Standard, TransportKind::Sequenced] {
        let mut tm = TestMultiplexer::new(test_config());
        let (id, script) = tm.spawn("t1");
        let (listener, seen) = collector();
        streams(&tm).set_transport_kind(&id, kind);
        streams(&tm).add_listener(&id, listener);
        start(&mut tm, &id).unwrap();

        tm.emit(&script, "one\r\n");
        tm.emit(&script, "two\r\n");
        let cursor = streams(&tm).seq_cursor(&id);

        let manager = streams(&tm);
        let restart_id = id.clone();
        tm.harness
            .block_on(async move { manager.restart(&restart_id).await })
            .unwrap();
        tm.harness.run_until_idle();
        assert_eq!(streams(&tm).seq_cursor(&id), cursor);

        tm.emit(&script, "three\r\n");
        let text = seen.borrow().clone();
        assert_in_order(&text, &["one", "two", "three"]);
        assert_no_duplicate_lines(&text);
    }
}

#[test]
fn seq_cursor_tracks_host_head() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    start(&mut tm, &id).unwrap();

    tm.emit(&script, "a");
    tm.emit(&script, "b");
    tm.emit(&script, "c");
    assert_eq!(streams(&tm).seq_cursor(&id), tm.host.head_seq(&id));
}

#[test]
fn redelivered_frames_are_dispatched_once() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    for i in 1..=5 {
        tm.emit(&script, &i.to_string());
    }
    assert_eq!(tm.host.head_seq(&id), Some(5));

    // Frame 5 arrives twice on the live channel after hydration reached it
    let stale = Frame {
        seq: 5,
        bytes: b"5".to_vec(),
    };
    tm.layer.replay_on_subscribe(vec![stale.clone(), stale]);

    let (listener, seen) = collector();
    streams(&tm).add_listener(&id, listener);
    start(&mut tm, &id).unwrap();
    tm.emit(&script, "6");

    assert_eq!(*seen.borrow(), "123456");
    assert_eq!(streams(&tm).seq_cursor(&id), Some(6));
    let acked: Vec<u64> = tm.layer.acks().into_iter().map(|(_, seq, _)| seq).collect();
    assert_eq!(acked, vec![6]);
}

// ========== Concurrent starts ==========

#[test]
fn concurrent_starts_share_one_attempt() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, _script) = tm.spawn("t1");
    tm.layer.hold_subscribe();

    let results = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..3 {
        let manager = streams(&tm);
        let id = id.clone();
        let results = results.clone();
        tm.harness.spawn(async move {
            let result = manager.ensure_started(&id).await;
            results.borrow_mut().push(result);
        });
    }
    tm.harness.run_until_idle();
    assert!(streams(&tm).is_starting(&id));
    assert!(results.borrow().is_empty());

    tm.layer.open_subscribe();
    tm.harness.run_until_idle();

    assert_eq!(*results.borrow(), vec![Ok(()), Ok(()), Ok(())]);
    assert_eq!(tm.layer.counts().backfill, 1);
    assert_eq!(tm.layer.counts().subscribe, 1);
    assert!(streams(&tm).is_started(&id));
}

#[test]
fn started_stream_does_not_resubscribe() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, _script) = tm.spawn("t1");
    start(&mut tm, &id).unwrap();
    start(&mut tm, &id).unwrap();

    assert_eq!(tm.layer.counts().subscribe, 1);
}

// ========== Failures ==========

#[test]
fn failed_start_can_be_retried() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    let (listener, seen) = collector();
    streams(&tm).add_listener(&id, listener);
    tm.emit(&script, "kept\r\n");

    tm.layer.fail_backfill(1);
    let err = start(&mut tm, &id).unwrap_err();
    assert!(matches!(err, StreamError::Transport(_)));
    assert!(!streams(&tm).is_started(&id));
    assert!(!streams(&tm).is_starting(&id));

    start(&mut tm, &id).unwrap();
    assert!(streams(&tm).is_started(&id));
    assert_eq!(tm.layer.counts().backfill, 2);
    assert_eq!(seen.borrow().matches("kept").count(), 1);
}

#[test]
fn failed_subscribe_leaves_no_subscription() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, _script) = tm.spawn("t1");

    tm.layer.fail_subscribe(1);
    assert!(start(&mut tm, &id).is_err());
    assert!(!tm.mux.transport(TransportKind::Sequenced).is_subscribed(&id));

    start(&mut tm, &id).unwrap();
    assert!(tm.mux.transport(TransportKind::Sequenced).is_subscribed(&id));
}

#[test]
fn start_of_unknown_terminal_fails() {
    let mut tm = TestMultiplexer::new(test_config());
    let err = start(&mut tm, &TerminalId::new("missing")).unwrap_err();
    assert!(matches!(err, StreamError::Transport(msg) if msg.contains("missing")));
}

#[test]
fn dispose_emits_a_truncated_character() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    let (listener, seen) = collector();
    streams(&tm).add_listener(&id, listener);
    start(&mut tm, &id).unwrap();

    script.emit(&"ok→".as_bytes()[..3]);
    tm.pump();
    assert_eq!(*seen.borrow(), "ok");

    let manager = streams(&tm);
    let dispose_id = id.clone();
    tm.harness
        .block_on(async move { manager.dispose(&dispose_id).await });
    assert_eq!(*seen.borrow(), "ok\u{FFFD}");
}

#[test]
fn dispose_during_start_releases_subscription() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, _script) = tm.spawn("t1");
    tm.layer.hold_subscribe();

    let result = Rc::new(RefCell::new(None));
    {
        let manager = streams(&tm);
        let id = id.clone();
        let result = result.clone();
        tm.harness.spawn(async move {
            *result.borrow_mut() = Some(manager.ensure_started(&id).await);
        });
    }
    tm.harness.run_until_idle();

    let manager = streams(&tm);
    let dispose_id = id.clone();
    tm.harness
        .block_on(async move { manager.dispose(&dispose_id).await });

    tm.layer.open_subscribe();
    tm.harness.run_until_idle();

    assert_eq!(*result.borrow(), Some(Err(StreamError::Disposed(id.clone()))));
    assert!(!streams(&tm).is_started(&id));
    assert!(!tm.mux.transport(TransportKind::Sequenced).is_subscribed(&id));
    assert_eq!(tm.layer.counts().unsubscribe, 1);
}

// ========== Dispatch ==========

#[test]
fn failing_listener_does_not_starve_others() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");

    let failing: Listener = Rc::new(|_: &TerminalId, _: &str| -> anyhow::Result<()> {
        anyhow::bail!("consumer gone")
    });
    let (working, seen) = collector();
    streams(&tm).add_listener(&id, failing);
    streams(&tm).add_listener(&id, working);
    start(&mut tm, &id).unwrap();

    tm.emit(&script, "first\r\n");
    tm.emit(&script, "second\r\n");
    assert_in_order(&seen.borrow(), &["first", "second"]);
}

#[test]
fn removed_listener_gets_nothing_more() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    let (listener, seen) = collector();
    let listener_id = streams(&tm).add_listener(&id, listener);
    start(&mut tm, &id).unwrap();

    tm.emit(&script, "before");
    assert!(streams(&tm).remove_listener(&id, listener_id));
    assert!(!streams(&tm).remove_listener(&id, listener_id));
    tm.emit(&script, "after");

    assert_eq!(*seen.borrow(), "before");
    assert_eq!(streams(&tm).listener_count(&id), 0);
}

#[test]
fn multibyte_character_split_across_frames() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    let (listener, seen) = collector();
    streams(&tm).add_listener(&id, listener);
    start(&mut tm, &id).unwrap();

    let bytes = "→ok".as_bytes();
    script.emit(&bytes[..1]);
    tm.pump();
    assert_eq!(*seen.borrow(), "");
    script.emit(&bytes[1..]);
    tm.pump();

    assert_eq!(*seen.borrow(), "→ok");
}

#[test]
fn invalid_bytes_become_replacement_characters() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    let (listener, seen) = collector();
    streams(&tm).add_listener(&id, listener);
    start(&mut tm, &id).unwrap();

    script.emit(b"a\xffb");
    tm.pump();
    assert_eq!(*seen.borrow(), "a\u{FFFD}b");
}

// ========== Acknowledgement ==========

#[test]
fn sequenced_frames_are_acked_with_their_size() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    start(&mut tm, &id).unwrap();

    tm.emit(&script, "12345");
    tm.emit(&script, "678");

    let acks: Vec<_> = tm.layer.acks().into_iter().map(|(_, _, n)| n).collect();
    assert_eq!(acks, vec![5, 3]);
}

#[test]
fn standard_transport_never_acks() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    streams(&tm).set_transport_kind(&id, TransportKind::Standard);
    start(&mut tm, &id).unwrap();

    tm.emit(&script, "output");
    assert_eq!(tm.layer.counts().ack, 0);
}

#[test]
fn ack_failure_does_not_stop_the_stream() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    let (listener, seen) = collector();
    streams(&tm).add_listener(&id, listener);
    start(&mut tm, &id).unwrap();

    tm.layer.fail_acks(true);
    tm.emit(&script, "still ");
    tm.emit(&script, "flowing");
    assert_eq!(*seen.borrow(), "still flowing");
}
