//! Visibility tracking for terminal regions
//!
//! Terminals occupy a vertical `Region` of a scrollable surface. The tracker
//! evaluates each region against the current `Viewport` and notifies
//! subscribers when a terminal flips between visible and not visible.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

use serde::Serialize;

use crate::config::VisibilityConfig;
use crate::wire::TerminalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
    /// On screen, but the whole surface is hidden
    Background,
}

impl Visibility {
    pub fn is_visible(self) -> bool {
        self == Visibility::Visible
    }
}

/// Vertical extent of a terminal, in surface coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub top: i64,
    pub height: u32,
}

impl Region {
    pub fn new(top: i64, height: u32) -> Self {
        Self { top, height }
    }

    fn bottom(&self) -> i64 {
        self.top + self.height as i64
    }
}

/// The visible window onto the surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewport {
    pub scroll_offset: i64,
    pub height: u32,
}

impl Viewport {
    pub fn new(scroll_offset: i64, height: u32) -> Self {
        Self {
            scroll_offset,
            height,
        }
    }
}

/// Decides whether a region intersects the viewport enough to count as visible
#[derive(Debug, Clone, Copy)]
pub struct IntersectionObserver {
    threshold: f64,
}

impl IntersectionObserver {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Fraction of `region` inside `viewport`
    pub fn ratio(&self, region: Region, viewport: Viewport) -> f64 {
        if region.height == 0 {
            return 0.0;
        }
        let top = region.top.max(viewport.scroll_offset);
        let bottom = region
            .bottom()
            .min(viewport.scroll_offset + viewport.height as i64);
        let overlap = (bottom - top).max(0);
        overlap as f64 / region.height as f64
    }

    pub fn is_intersecting(&self, region: Region, viewport: Viewport) -> bool {
        let ratio = self.ratio(region, viewport);
        ratio > 0.0 && ratio >= self.threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityState {
    pub visibility: Visibility,
    pub last_visible_at: Option<Instant>,
    /// Number of times the terminal became visible
    pub render_count: u64,
}

pub type VisibilityCallback = Rc<dyn Fn(&TerminalId, Visibility)>;

struct Tracked {
    region: Region,
    state: VisibilityState,
}

struct Subscriber {
    id: u64,
    callback: VisibilityCallback,
}

#[derive(Default)]
struct Inner {
    viewport: Viewport,
    backgrounded: bool,
    terminals: HashMap<TerminalId, Tracked>,
    subscribers: HashMap<TerminalId, Vec<Subscriber>>,
    next_subscriber: u64,
}

/// Registry of terminal regions and their visibility
pub struct VisibilityTracker {
    observer: IntersectionObserver,
    inner: RefCell<Inner>,
}

/// Returned by `on_visibility_change`; detaches the callback
pub struct Unsubscribe {
    tracker: Weak<VisibilityTracker>,
    id: TerminalId,
    subscriber: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(tracker) = self.tracker.upgrade() {
            let mut inner = tracker.inner.borrow_mut();
            if let Some(subs) = inner.subscribers.get_mut(&self.id) {
                subs.retain(|s| s.id != self.subscriber);
                if subs.is_empty() {
                    inner.subscribers.remove(&self.id);
                }
            }
        }
    }
}

impl VisibilityTracker {
    pub fn new(config: &VisibilityConfig, viewport: Viewport) -> Rc<Self> {
        Rc::new(Self {
            observer: IntersectionObserver::new(config.threshold),
            inner: RefCell::new(Inner {
                viewport,
                ..Inner::default()
            }),
        })
    }

    /// Start tracking `id`; it starts hidden and is evaluated immediately
    pub fn register_terminal(&self, id: TerminalId, region: Region) {
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(tracked) = inner.terminals.get_mut(&id) {
                tracked.region = region;
            } else {
                inner.terminals.insert(
                    id.clone(),
                    Tracked {
                        region,
                        state: VisibilityState {
                            visibility: Visibility::Hidden,
                            last_visible_at: None,
                            render_count: 0,
                        },
                    },
                );
            }
        }
        tracing::debug!(%id, top = region.top, height = region.height, "tracking terminal visibility");
        self.evaluate(Some(&id));
    }

    pub fn update_region(&self, id: &TerminalId, region: Region) {
        {
            let mut inner = self.inner.borrow_mut();
            let Some(tracked) = inner.terminals.get_mut(id) else {
                return;
            };
            tracked.region = region;
        }
        self.evaluate(Some(id));
    }

    pub fn update_viewport(&self, viewport: Viewport) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.viewport == viewport {
                return;
            }
            inner.viewport = viewport;
        }
        self.evaluate(None);
    }

    /// Hide or show the whole surface
    pub fn set_backgrounded(&self, backgrounded: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.backgrounded == backgrounded {
                return;
            }
            inner.backgrounded = backgrounded;
        }
        tracing::debug!(backgrounded, "surface visibility changed");
        self.evaluate(None);
    }

    /// Call `callback` on every visibility change of `id`
    pub fn on_visibility_change(
        self: &Rc<Self>,
        id: &TerminalId,
        callback: VisibilityCallback,
    ) -> Unsubscribe {
        let mut inner = self.inner.borrow_mut();
        inner.next_subscriber += 1;
        let subscriber = inner.next_subscriber;
        inner
            .subscribers
            .entry(id.clone())
            .or_default()
            .push(Subscriber {
                id: subscriber,
                callback,
            });

        Unsubscribe {
            tracker: Rc::downgrade(self),
            id: id.clone(),
            subscriber,
        }
    }

    /// Stop tracking `id` and drop its subscribers
    pub fn unregister_terminal(&self, id: &TerminalId) {
        let mut inner = self.inner.borrow_mut();
        inner.terminals.remove(id);
        inner.subscribers.remove(id);
    }

    pub fn dispose(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.terminals.clear();
        inner.subscribers.clear();
    }

    pub fn state(&self, id: &TerminalId) -> Option<VisibilityState> {
        self.inner.borrow().terminals.get(id).map(|t| t.state)
    }

    pub fn is_visible(&self, id: &TerminalId) -> bool {
        self.state(id)
            .is_some_and(|s| s.visibility.is_visible())
    }

    /// Re-evaluate one terminal (or all) and notify on changes
    fn evaluate(&self, only: Option<&TerminalId>) {
        let mut changes: Vec<(TerminalId, Visibility, Vec<VisibilityCallback>)> = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let Inner {
                viewport,
                backgrounded,
                terminals,
                subscribers,
                ..
            } = &mut *inner;

            for (id, tracked) in terminals.iter_mut() {
                if only.is_some_and(|only| only != id) {
                    continue;
                }

                let target = if !self.observer.is_intersecting(tracked.region, *viewport) {
                    Visibility::Hidden
                } else if *backgrounded {
                    Visibility::Background
                } else {
                    Visibility::Visible
                };

                if target == tracked.state.visibility {
                    continue;
                }

                tracked.state.visibility = target;
                if target == Visibility::Visible {
                    tracked.state.render_count += 1;
                    tracked.state.last_visible_at = Some(Instant::now());
                }

                let callbacks = subscribers
                    .get(id)
                    .map(|subs| subs.iter().map(|s| s.callback.clone()).collect())
                    .unwrap_or_default();
                changes.push((id.clone(), target, callbacks));
            }
        }

        for (id, visibility, callbacks) in changes {
            tracing::debug!(%id, ?visibility, "visibility changed");
            for callback in callbacks {
                callback(&id, visibility);
            }
        }
    }
}
