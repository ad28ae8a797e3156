//! Suspension of hidden panes, end to end
//!
//! Panes are stacked 200 units apart in a 720 unit viewport; scrolling far
//! down hides all of them.

use std::rc::Rc;
use std::time::Duration;

use multiplexer::render::RenderHandle;
use multiplexer::wire::TransportKind;
use terminal::RenderBuffer;
use test_harness::assertions::{assert_in_order, assert_no_duplicate_lines};
use test_harness::fixtures::{numbered_lines, offscreen_offset, stacked_region, test_config};
use test_harness::TestMultiplexer;

const SETTLE: Duration = Duration::from_millis(200);

#[test]
fn hidden_pane_is_suspended_after_delay() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));
    tm.emit(&script, &numbered_lines(1, 5));
    assert!(render.contents().contains("line 5"));

    tm.scroll_to(offscreen_offset(1));
    let suspension = tm.mux.suspension().clone();
    let suspended_id = id.clone();
    assert!(tm
        .harness
        .run_until(SETTLE, || suspension.is_suspended(&suspended_id)));
    assert!(tm.mux.suspension().has_snapshot(&id));
    assert_eq!(render.clear_count(), 1);
    assert_eq!(render.contents(), "");
}

#[test]
fn output_while_suspended_waits_and_follows_the_snapshot() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));
    tm.emit(&script, &numbered_lines(1, 3));

    tm.scroll_to(offscreen_offset(1));
    let suspension = tm.mux.suspension().clone();
    let suspended_id = id.clone();
    assert!(tm
        .harness
        .run_until(SETTLE, || suspension.is_suspended(&suspended_id)));

    tm.emit(&script, "while hidden\r\n");
    assert_eq!(render.contents(), "");
    assert!(tm.mux.queue_stats(&id).unwrap().queued_bytes > 0);

    tm.scroll_to(0);
    let resumed_id = id.clone();
    assert!(tm
        .harness
        .run_until(SETTLE, || !suspension.is_suspended(&resumed_id)));
    tm.harness.run_until_idle();

    let text = render.contents();
    assert_in_order(&text, &["line 1", "line 2", "line 3", "while hidden"]);
    assert_no_duplicate_lines(&text);
    assert_eq!(tm.mux.queue_stats(&id).unwrap().queued_bytes, 0);
}

#[test]
fn resume_restores_scroll_position() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));
    tm.emit(&script, &numbered_lines(1, 3));
    render.set_scroll(2);

    assert!(tm.mux.suspension().suspend(&id));
    let suspension = tm.mux.suspension().clone();
    let resume_id = id.clone();
    tm.harness
        .block_on(async move { suspension.resume(&resume_id).await });

    assert_eq!(render.scrolled_to(), vec![2]);
}

#[test]
fn becoming_visible_before_the_delay_cancels_suspension() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, _script, _render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));

    tm.scroll_to(offscreen_offset(1));
    assert!(tm.mux.suspension().has_pending_timer(&id));
    tm.scroll_to(0);
    assert!(!tm.mux.suspension().has_pending_timer(&id));

    tm.harness.run_for(Duration::from_millis(60));
    assert!(!tm.mux.suspension().is_suspended(&id));
}

#[test]
fn keep_alive_pane_is_never_suspended() {
    let mut config = test_config();
    config
        .suspension
        .keep_alive_terminal_ids
        .insert("pinned".to_string());
    let mut tm = TestMultiplexer::new(config);
    let (id, _script, _render) = tm.spawn_and_open("pinned", TransportKind::Sequenced, stacked_region(0));

    tm.scroll_to(offscreen_offset(1));
    tm.harness.run_for(Duration::from_millis(60));
    assert!(!tm.mux.suspension().is_suspended(&id));
}

#[test]
fn snapshot_cap_restores_the_oldest() {
    let mut config = test_config();
    config.suspension.max_suspended_terminals = 2;
    let mut tm = TestMultiplexer::new(config);

    let panes: Vec<_> = (0..3)
        .map(|i| {
            let (id, script, render) =
                tm.spawn_and_open(&format!("t{}", i), TransportKind::Sequenced, stacked_region(i));
            tm.emit(&script, &format!("from t{}\r\n", i));
            (id, render)
        })
        .collect();

    for (id, _) in &panes {
        assert!(tm.mux.suspension().suspend(id));
    }

    let stats = tm.mux.suspension().stats();
    assert_eq!(stats.suspended_with_snapshot, 2);
    assert!(!tm.mux.suspension().is_suspended(&panes[0].0));
    assert!(panes[0].1.contents().contains("from t0"));
    assert!(tm.mux.suspension().has_snapshot(&panes[1].0));
    assert!(tm.mux.suspension().has_snapshot(&panes[2].0));
}

#[test]
fn oversize_snapshot_keeps_the_buffer_live() {
    let mut config = test_config();
    config.suspension.snapshot_size_limit_bytes = 8;
    let mut tm = TestMultiplexer::new(config);
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));
    tm.emit(&script, &numbered_lines(1, 10));

    assert!(tm.mux.suspension().suspend(&id));
    assert!(!tm.mux.suspension().has_snapshot(&id));
    assert_eq!(render.clear_count(), 0);

    tm.emit(&script, "still rendered\r\n");
    assert!(render.contents().contains("still rendered"));
}

#[test]
fn closing_a_suspended_pane_restores_and_flushes() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script, render) = tm.spawn_and_open("t1", TransportKind::Sequenced, stacked_region(0));
    tm.emit(&script, "visible part\r\n");
    tm.mux.suspension().suspend(&id);
    tm.emit(&script, "queued part\r\n");

    tm.close(&id);

    assert_in_order(&render.contents(), &["visible part", "queued part"]);
    assert!(!tm.mux.is_open(&id));
    assert!(!tm.mux.suspension().is_suspended(&id));
}

#[test]
fn snapshot_round_trips_through_a_real_terminal() {
    let mut tm = TestMultiplexer::new(test_config());
    let (id, script) = tm.spawn("t1");
    let buffer = Rc::new(RenderBuffer::new(40, 5).unwrap());
    tm.open(&id, TransportKind::Sequenced, buffer.clone(), stacked_region(0))
        .unwrap();
    tm.emit(&script, &numbered_lines(1, 12));
    let before = buffer.buffer_lines().unwrap();

    assert!(tm.mux.suspension().suspend(&id));
    assert!(buffer.lines().is_empty());

    let suspension = tm.mux.suspension().clone();
    let resume_id = id.clone();
    tm.harness
        .block_on(async move { suspension.resume(&resume_id).await });

    assert_eq!(buffer.buffer_lines().unwrap(), before);
}
