//! Suspension of hidden terminals
//!
//! A terminal that stays hidden for `suspend_after_ms` is suspended: its
//! buffered text is captured into a snapshot and its render buffer cleared.
//! When it becomes visible again the snapshot is replayed and the scroll
//! position restored. The number of terminals holding a snapshot is capped;
//! going over the cap restores the oldest one.
//!
//! Suspension only concerns the rendered view. The output stream keeps
//! running, and output for a suspended terminal waits in its write queue
//! (see `accepts_render_writes`).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::SuspensionConfig;
use crate::decoder::floor_char_boundary;
use crate::render::{RenderHandle, ScrollPosition, TERMINAL_RESET_SEQUENCE};
use crate::runtime::{yield_now, LoopContext, TimerHandle};
use crate::visibility::{Unsubscribe, Visibility, VisibilityTracker};
use crate::wire::TerminalId;

/// Captured text of a suspended terminal
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub text: String,
    pub byte_size: usize,
    pub width: u16,
    pub height: u16,
    pub captured_at: Instant,
}

/// Called after a terminal leaves suspension
pub type ResumedHook = Rc<dyn Fn(&TerminalId)>;

struct TerminalState {
    render: Rc<dyn RenderHandle>,
    visible: bool,
    suspended: bool,
    suspended_at: Option<Instant>,
    /// Position in suspension order, for picking the oldest snapshot
    suspend_order: u64,
    snapshot: Option<Snapshot>,
    scroll_position: Option<ScrollPosition>,
    /// Set while a snapshot is being written back
    restoring: bool,
    timer: Option<TimerHandle>,
    visibility_sub: Option<Unsubscribe>,
}

impl TerminalState {
    fn holds_snapshot(&self) -> bool {
        self.suspended && self.snapshot.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SuspensionStats {
    pub suspended_with_snapshot: usize,
    pub suspended_without_snapshot: usize,
    pub total_snapshot_bytes: usize,
    pub pending_timers: usize,
    pub max_suspended_terminals: u32,
    pub snapshot_size_limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalDebugInfo {
    pub id: TerminalId,
    pub suspended: bool,
    pub has_snapshot: bool,
    pub snapshot_bytes: usize,
    pub suspended_for_ms: Option<u64>,
    pub restoring: bool,
    pub pending_timer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspensionDebugInfo {
    pub stats: SuspensionStats,
    pub terminals: Vec<TerminalDebugInfo>,
}

pub struct SuspensionManager {
    config: SuspensionConfig,
    ctx: LoopContext,
    terminals: RefCell<HashMap<TerminalId, TerminalState>>,
    resumed_hooks: RefCell<Vec<ResumedHook>>,
    next_suspend_order: Cell<u64>,
}

impl SuspensionManager {
    pub fn new(config: SuspensionConfig, ctx: LoopContext) -> Rc<Self> {
        Rc::new(Self {
            config,
            ctx,
            terminals: RefCell::new(HashMap::new()),
            resumed_hooks: RefCell::new(Vec::new()),
            next_suspend_order: Cell::new(0),
        })
    }

    /// Manage `id`, following its visibility on `tracker`
    pub fn register_terminal(
        self: &Rc<Self>,
        id: &TerminalId,
        render: Rc<dyn RenderHandle>,
        tracker: &Rc<VisibilityTracker>,
    ) {
        if self.terminals.borrow().contains_key(id) {
            self.unregister_terminal(id);
        }

        let weak = Rc::downgrade(self);
        let visibility_sub = tracker.on_visibility_change(
            id,
            Rc::new(move |id: &TerminalId, visibility: Visibility| {
                if let Some(this) = weak.upgrade() {
                    this.handle_visibility(id, visibility.is_visible());
                }
            }),
        );

        let visible = tracker.is_visible(id);
        self.terminals.borrow_mut().insert(
            id.clone(),
            TerminalState {
                render,
                visible,
                suspended: false,
                suspended_at: None,
                suspend_order: 0,
                snapshot: None,
                scroll_position: None,
                restoring: false,
                timer: None,
                visibility_sub: Some(visibility_sub),
            },
        );
        tracing::debug!(%id, visible, "terminal registered for suspension");

        if !visible {
            self.handle_visibility(id, false);
        }
    }

    fn handle_visibility(self: &Rc<Self>, id: &TerminalId, visible: bool) {
        let resume = {
            let mut terminals = self.terminals.borrow_mut();
            let Some(state) = terminals.get_mut(id) else {
                return;
            };
            state.visible = visible;

            if visible {
                if let Some(timer) = state.timer.take() {
                    self.ctx.cancel_timer(timer);
                    tracing::trace!(%id, "suspension timer canceled");
                }
                state.suspended
            } else {
                false
            }
        };

        if visible {
            if resume {
                let this = self.clone();
                let id = id.clone();
                self.ctx.spawn(async move { this.resume(&id).await });
            }
        } else {
            self.schedule_suspend(id);
        }
    }

    /// Arm the suspension timer unless it is pointless
    fn schedule_suspend(self: &Rc<Self>, id: &TerminalId) {
        if self.config.keep_alive_terminal_ids.contains(id.as_str()) {
            return;
        }

        let mut terminals = self.terminals.borrow_mut();
        let Some(state) = terminals.get_mut(id) else {
            return;
        };
        if state.timer.is_some() || (state.suspended && !state.restoring) {
            return;
        }

        let weak = Rc::downgrade(self);
        let timer_id = id.clone();
        let after = Duration::from_millis(self.config.suspend_after_ms as u64);
        match self.ctx.timer(after, move || {
            if let Some(this) = weak.upgrade() {
                this.suspend_timer_fired(&timer_id);
            }
        }) {
            Ok(timer) => state.timer = Some(timer),
            Err(e) => tracing::warn!(%id, error = %e, "failed to arm suspension timer"),
        }
    }

    fn suspend_timer_fired(&self, id: &TerminalId) {
        {
            let mut terminals = self.terminals.borrow_mut();
            let Some(state) = terminals.get_mut(id) else {
                return;
            };
            state.timer = None;
            if state.visible {
                return;
            }
        }
        self.suspend(id);
    }

    /// Suspend `id` now
    ///
    /// Returns false if `id` is unknown or already suspended. A snapshot that
    /// is too large or cannot be captured leaves the buffer untouched.
    pub fn suspend(&self, id: &TerminalId) -> bool {
        let render = {
            let terminals = self.terminals.borrow();
            let Some(state) = terminals.get(id) else {
                return false;
            };
            if state.suspended {
                return false;
            }
            state.render.clone()
        };

        let scroll_position = render.scroll_position();
        let (width, height) = render.size();
        let snapshot = match render.buffer_lines() {
            Ok(lines) => {
                let text = lines.join("\r\n");
                let byte_size = text.len();
                if self.config.max_suspended_terminals == 0 {
                    None
                } else if byte_size as u64 > self.config.snapshot_size_limit_bytes {
                    tracing::info!(
                        %id,
                        byte_size,
                        limit = self.config.snapshot_size_limit_bytes,
                        "snapshot over size limit, keeping render buffer"
                    );
                    None
                } else {
                    Some(Snapshot {
                        text,
                        byte_size,
                        width,
                        height,
                        captured_at: Instant::now(),
                    })
                }
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "snapshot capture failed, keeping render buffer");
                None
            }
        };

        let Some(snapshot) = snapshot else {
            self.mark_suspended(id, None, Some(scroll_position));
            return true;
        };

        self.evict_to_cap(id);

        let byte_size = snapshot.byte_size;
        self.mark_suspended(id, Some(snapshot), Some(scroll_position));
        render.clear();
        if let Err(e) = render.write(TERMINAL_RESET_SEQUENCE) {
            tracing::warn!(%id, error = %e, "failed to reset render buffer");
        }

        tracing::info!(%id, byte_size, scroll_y = scroll_position.y, "terminal suspended");
        true
    }

    fn mark_suspended(
        &self,
        id: &TerminalId,
        snapshot: Option<Snapshot>,
        scroll_position: Option<ScrollPosition>,
    ) {
        let mut terminals = self.terminals.borrow_mut();
        if let Some(state) = terminals.get_mut(id) {
            state.suspended = true;
            state.suspended_at = Some(Instant::now());
            state.suspend_order = self.next_suspend_order.get();
            self.next_suspend_order.set(state.suspend_order + 1);
            state.snapshot = snapshot;
            state.scroll_position = scroll_position;
        }
    }

    /// Restore the oldest snapshot holders until there is room for one more
    fn evict_to_cap(&self, incoming: &TerminalId) {
        let cap = self.config.max_suspended_terminals as usize;
        loop {
            let victim = {
                let terminals = self.terminals.borrow();
                let holders = terminals
                    .iter()
                    .filter(|(id, s)| *id != incoming && s.holds_snapshot())
                    .count();
                if holders < cap {
                    return;
                }
                terminals
                    .iter()
                    .filter(|(id, s)| *id != incoming && s.holds_snapshot() && !s.restoring)
                    .min_by_key(|(_, s)| s.suspend_order)
                    .map(|(id, _)| id.clone())
            };

            let Some(victim) = victim else {
                // Everything over the cap is already being restored
                return;
            };
            tracing::debug!(id = %victim, "evicting oldest snapshot");
            self.restore_now(&victim);
        }
    }

    /// Write the snapshot of `id` back synchronously and leave suspension
    fn restore_now(&self, id: &TerminalId) {
        let (render, snapshot, scroll_position) = {
            let mut terminals = self.terminals.borrow_mut();
            let Some(state) = terminals.get_mut(id) else {
                return;
            };
            if !state.suspended || state.restoring {
                return;
            }
            state.restoring = true;
            (
                state.render.clone(),
                state.snapshot.clone(),
                state.scroll_position,
            )
        };

        if let Some(snapshot) = snapshot {
            match render.write(&snapshot.text) {
                Ok(()) => {
                    if let Some(scroll) = scroll_position {
                        render.scroll_to_line(scroll.y);
                    }
                }
                Err(e) => tracing::warn!(%id, error = %e, "snapshot replay failed"),
            }
        }

        self.finish_resume(id);
    }

    /// Leave suspension, replaying the snapshot in slices
    ///
    /// A second call while one is replaying does nothing.
    pub async fn resume(self: &Rc<Self>, id: &TerminalId) {
        let (render, snapshot, scroll_position) = {
            let mut terminals = self.terminals.borrow_mut();
            let Some(state) = terminals.get_mut(id) else {
                return;
            };
            if !state.suspended || state.restoring {
                return;
            }
            state.restoring = true;
            (
                state.render.clone(),
                state.snapshot.clone(),
                state.scroll_position,
            )
        };

        if let Some(snapshot) = snapshot {
            let chunk_bytes = self.config.replay_chunk_bytes.max(1);
            let mut rest = snapshot.text.as_str();
            let mut replayed = true;

            while !rest.is_empty() {
                let mut split = floor_char_boundary(rest, chunk_bytes);
                if split == 0 {
                    split = rest.chars().next().map_or(rest.len(), char::len_utf8);
                }
                let (slice, tail) = rest.split_at(split);
                if let Err(e) = render.write(slice) {
                    tracing::warn!(%id, error = %e, "snapshot replay failed");
                    replayed = false;
                    break;
                }
                rest = tail;
                if !rest.is_empty() {
                    yield_now().await;
                }
            }

            if replayed {
                if let Some(scroll) = scroll_position {
                    render.scroll_to_line(scroll.y);
                }
                tracing::info!(%id, byte_size = snapshot.byte_size, "terminal resumed");
            }
        } else {
            tracing::debug!(%id, "terminal resumed without snapshot");
        }

        self.finish_resume(id);

        let hidden = self
            .terminals
            .borrow()
            .get(id)
            .is_some_and(|s| !s.visible);
        if hidden {
            self.schedule_suspend(id);
        }
    }

    /// Flip state back to not suspended and notify hooks
    fn finish_resume(&self, id: &TerminalId) {
        {
            let mut terminals = self.terminals.borrow_mut();
            let Some(state) = terminals.get_mut(id) else {
                return;
            };
            state.suspended = false;
            state.suspended_at = None;
            state.snapshot = None;
            state.scroll_position = None;
            state.restoring = false;
        }

        let hooks = self.resumed_hooks.borrow().clone();
        for hook in hooks {
            hook(id);
        }
    }

    /// Register `hook` to run whenever a terminal leaves suspension
    pub fn on_resumed(&self, hook: ResumedHook) {
        self.resumed_hooks.borrow_mut().push(hook);
    }

    /// Whether output may be written to the render buffer of `id`
    pub fn accepts_render_writes(&self, id: &TerminalId) -> bool {
        self.terminals
            .borrow()
            .get(id)
            .map_or(true, |s| !s.holds_snapshot())
    }

    pub fn is_suspended(&self, id: &TerminalId) -> bool {
        self.terminals.borrow().get(id).is_some_and(|s| s.suspended)
    }

    pub fn has_snapshot(&self, id: &TerminalId) -> bool {
        self.terminals
            .borrow()
            .get(id)
            .is_some_and(|s| s.snapshot.is_some())
    }

    pub fn has_pending_timer(&self, id: &TerminalId) -> bool {
        self.terminals
            .borrow()
            .get(id)
            .is_some_and(|s| s.timer.is_some())
    }

    /// Stop managing `id`, restoring its snapshot first
    pub fn unregister_terminal(&self, id: &TerminalId) {
        self.restore_now(id);

        let Some(state) = self.terminals.borrow_mut().remove(id) else {
            return;
        };
        if let Some(timer) = state.timer {
            self.ctx.cancel_timer(timer);
        }
        if let Some(sub) = state.visibility_sub {
            sub.unsubscribe();
        }
        tracing::debug!(%id, "terminal unregistered from suspension");
    }

    /// Drop every timer and all state
    pub fn dispose(&self) {
        let terminals: Vec<TerminalState> = self
            .terminals
            .borrow_mut()
            .drain()
            .map(|(_, state)| state)
            .collect();
        for state in terminals {
            if let Some(timer) = state.timer {
                self.ctx.cancel_timer(timer);
            }
            if let Some(sub) = state.visibility_sub {
                sub.unsubscribe();
            }
        }
        self.resumed_hooks.borrow_mut().clear();
    }

    pub fn stats(&self) -> SuspensionStats {
        let terminals = self.terminals.borrow();
        let mut stats = SuspensionStats {
            max_suspended_terminals: self.config.max_suspended_terminals,
            snapshot_size_limit_bytes: self.config.snapshot_size_limit_bytes,
            ..SuspensionStats::default()
        };
        for state in terminals.values() {
            if state.timer.is_some() {
                stats.pending_timers += 1;
            }
            if !state.suspended {
                continue;
            }
            match &state.snapshot {
                Some(snapshot) => {
                    stats.suspended_with_snapshot += 1;
                    stats.total_snapshot_bytes += snapshot.byte_size;
                }
                None => stats.suspended_without_snapshot += 1,
            }
        }
        stats
    }

    pub fn debug_info(&self) -> SuspensionDebugInfo {
        let now = Instant::now();
        let mut terminals: Vec<TerminalDebugInfo> = self
            .terminals
            .borrow()
            .iter()
            .map(|(id, state)| TerminalDebugInfo {
                id: id.clone(),
                suspended: state.suspended,
                has_snapshot: state.snapshot.is_some(),
                snapshot_bytes: state.snapshot.as_ref().map_or(0, |s| s.byte_size),
                suspended_for_ms: state
                    .suspended_at
                    .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                restoring: state.restoring,
                pending_timer: state.timer.is_some(),
            })
            .collect();
        terminals.sort_by(|a, b| a.id.cmp(&b.id));

        SuspensionDebugInfo {
            stats: self.stats(),
            terminals,
        }
    }
}
