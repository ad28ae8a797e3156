//! End-to-end flow from scripted processes into render buffers

use std::rc::Rc;

use multiplexer::error::MultiplexerError;
use multiplexer::render::RenderHandle;
use multiplexer::visibility::Visibility;
use multiplexer::wire::{TerminalId, TransportKind};
use test_harness::assertions::{assert_in_order, assert_no_duplicate_lines, assert_queue_conserves};
use test_harness::fixtures::{numbered_lines, request, small_queue_config, stacked_region, test_config};
use test_harness::{RecordingRender, TestMultiplexer};

#[test]
fn output_reaches_the_render_in_order() {
    for kind in [TransportKind::Standard, TransportKind::Sequenced] {
        let mut tm = TestMultiplexer::new(test_config());
        let (_id, script, render) = tm.spawn_and_open("t1", kind, stacked_region(0));

        tm.emit(&script, &numbered_lines(1, 50));
        tm.emit(&script, &numbered_lines(51, 100));

        let text = render.contents();
        assert_in_order(&text, &["line 1\r", "line 50\r", "line 51\r", "line 100\r"]);
        assert_no_duplicate_lines(&text);
    }
}

#[test]
fn burst_within_one_turn_is_coalesced() {
    let mut tm = TestMultiplexer::new(test_config());
    let (_id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    for i in 0..10 {
        script.emit_str(&format!("{} ", i));
    }
    tm.pump();

    assert_eq!(render.contents(), "0 1 2 3 4 5 6 7 8 9 ");
    assert_eq!(render.write_count(), 1);
}

#[test]
fn spawn_terminal_opens_a_pane() {
    let mut tm = TestMultiplexer::new(test_config());
    let render = Rc::new(RecordingRender::new());
    let mux = tm.mux.clone();
    let pane_render = render.clone();
    let handle = tm
        .harness
        .block_on(async move {
            mux.spawn_terminal(request("t1"), TransportKind::Standard, pane_render, stacked_region(0))
                .await
        })
        .unwrap();
    assert_eq!(handle.id.as_str(), "t1");

    let script = tm.spawner.session(&handle.id).unwrap();
    tm.emit(&script, "ready\r\n");
    assert!(render.contents().contains("ready"));
    assert!(tm.mux.is_open(&handle.id));
}

#[test]
fn failed_spawn_opens_nothing() {
    let mut tm = TestMultiplexer::new(test_config());
    tm.spawner.fail_next(1);
    let mux = tm.mux.clone();
    let result = tm.harness.block_on(async move {
        mux.spawn_terminal(
            request("t1"),
            TransportKind::Sequenced,
            Rc::new(RecordingRender::new()),
            stacked_region(0),
        )
        .await
    });

    assert!(matches!(result, Err(MultiplexerError::Transport(_))));
    assert!(!tm.mux.is_open(&TerminalId::new("t1")));
}

#[test]
fn input_and_resize_go_to_the_process() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, _render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    let mux = tm.mux.clone();
    let input_id = id.clone();
    tm.harness
        .block_on(async move {
            mux.write_input(&input_id, "echo hi\r").await?;
            mux.resize(&input_id, 30, 100).await
        })
        .unwrap();

    assert_eq!(script.input_string(), "echo hi\r");
    assert_eq!(script.size(), (100, 30));
}

#[test]
fn input_to_closed_terminal_is_an_error() {
    let mut tm = TestMultiplexer::new(test_config());
    let mux = tm.mux.clone();
    let result = tm
        .harness
        .block_on(async move { mux.write_input(&TerminalId::new("nope"), "x").await });
    assert!(matches!(result, Err(MultiplexerError::NotOpen(_))));
}

#[test]
fn overflow_drops_old_output_and_leaves_a_notice() {
    let mut config = test_config();
    config.write_queue = small_queue_config();
    let mut tm = TestMultiplexer::new(config);
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    // Park output in the queue by suspending with a snapshot
    tm.emit(&script, "start\r\n");
    assert!(tm.mux.suspension().suspend(&id));
    tm.emit(&script, &"x".repeat(3000));
    tm.emit(&script, "tail");

    let stats = tm.mux.queue_stats(&id).unwrap();
    assert!(stats.dropped_bytes > 0);
    assert!(stats.overflow_active);
    assert!(stats.notice_bytes > 0);

    let suspension = tm.mux.suspension().clone();
    let resume_id = id.clone();
    tm.harness
        .block_on(async move { suspension.resume(&resume_id).await });
    tm.harness.run_until_idle();

    let text = render.contents();
    assert_in_order(&text, &["start", "output truncated", "tail"]);
    let reported = tm.mux.drain_reported_bytes(&id).unwrap();
    let stats = tm.mux.queue_stats(&id).unwrap();
    assert_eq!(stats.queued_bytes, 0);
    assert_queue_conserves(&stats, reported);
}

#[test]
fn render_failure_keeps_output_queued() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    render.fail_writes(true);
    tm.emit(&script, "pending");
    assert_eq!(tm.mux.queue_stats(&id).unwrap().queued_bytes, 7);

    render.fail_writes(false);
    tm.mux.flush(&id, multiplexer::write_queue::FlushMode::Immediate);
    assert_eq!(render.contents(), "pending");
}

#[test]
fn reported_bytes_track_render_writes() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, _render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    tm.emit(&script, "12345");
    tm.emit(&script, "678");
    assert_eq!(tm.mux.drain_reported_bytes(&id), Some(8));
    assert_eq!(tm.mux.drain_reported_bytes(&id), Some(0));
}

#[test]
fn reopening_replaces_the_pane() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, first) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));
    tm.emit(&script, "old\r\n");

    let second = Rc::new(RecordingRender::new());
    tm.open(&id, TransportKind::Standard, second.clone(), stacked_region(0))
        .unwrap();
    tm.emit(&script, "new\r\n");

    assert!(!first.contents().contains("new"));
    assert!(second.contents().contains("new"));
    assert_eq!(tm.mux.streams().listener_count(&id), 1);
}

#[test]
fn closing_writes_out_a_truncated_character() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    script.emit(&"done é".as_bytes()[..6]);
    tm.pump();
    assert_eq!(render.contents(), "done ");

    let mux = tm.mux.clone();
    let close_id = id.clone();
    tm.harness
        .block_on(async move { mux.close_terminal(&close_id).await });

    assert_eq!(render.contents(), "done \u{FFFD}");
    assert!(!tm.mux.is_open(&id));
}

#[test]
fn restarted_stream_continues_without_duplicates() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));
    tm.emit(&script, &numbered_lines(1, 20));

    let mux = tm.mux.clone();
    let restart_id = id.clone();
    tm.harness
        .block_on(async move { mux.restart_stream(&restart_id).await })
        .unwrap();
    tm.harness.run_until_idle();
    tm.emit(&script, &numbered_lines(21, 40));

    assert!(tm.mux.streams().is_started(&id));
    assert_eq!(tm.mux.streams().listener_count(&id), 1);
    let text = render.contents();
    assert_in_order(&text, &["line 1\r", "line 20\r", "line 21\r", "line 40\r"]);
    assert_no_duplicate_lines(&text);
}

#[test]
fn kill_closes_the_pane_and_ends_the_process() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, _render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    let mux = tm.mux.clone();
    let kill_id = id.clone();
    tm.harness
        .block_on(async move { mux.kill_terminal(&kill_id).await })
        .unwrap();

    assert!(script.is_terminated());
    assert!(!tm.mux.is_open(&id));
    assert!(tm.host.session_ids().is_empty());
}

#[test]
fn exited_process_keeps_its_output() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Standard, stacked_region(0));

    script.emit_str("last words\r\n");
    script.exit();
    tm.pump();
    tm.pump();

    assert_eq!(tm.host.has_exited(&id), Some(true));
    assert!(render.contents().contains("last words"));
}

#[test]
fn stats_cover_every_pane() {
    let mut tm = TestMultiplexer::new(test_config());
    let (a, script, _) = tm.spawn_and_open("a", TransportKind::Sequenced, stacked_region(0));
    tm.spawn_and_open("b", TransportKind::Standard, stacked_region(10));
    tm.emit(&script, "abc");

    let stats = tm.mux.stats();
    assert_eq!(stats.terminals.len(), 2);
    let first = &stats.terminals[0];
    assert_eq!(first.id, a);
    assert!(first.started);
    assert_eq!(first.transport, TransportKind::Sequenced);
    assert_eq!(first.visibility, Some(Visibility::Visible));
    assert_eq!(first.queue.enqueued_bytes, 3);
    assert_eq!(stats.terminals[1].visibility, Some(Visibility::Hidden));

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["terminals"][1]["transport"], "standard");
}

#[test]
fn dispose_closes_everything() {
    let mut tm = TestMultiplexer::new(test_config());
    let (a, _, render_a) = tm.spawn_and_open("a", TransportKind::Sequenced, stacked_region(0));
    let (b, _, _) = tm.spawn_and_open("b", TransportKind::Standard, stacked_region(1));
    tm.mux.suspension().suspend(&a);

    let mux = tm.mux.clone();
    tm.harness.block_on(async move { mux.dispose().await });

    assert!(tm.mux.terminal_ids().is_empty());
    assert!(!tm.mux.transport(TransportKind::Sequenced).is_subscribed(&a));
    assert!(!tm.mux.transport(TransportKind::Standard).is_subscribed(&b));
    assert_eq!(render_a.clear_count(), 1);
    assert!(render_a.buffer_lines().unwrap().is_empty());
}
