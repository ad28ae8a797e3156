//! Headless driver for the multiplexer
//!
//! `Harness` owns a calloop event loop with a `LoopContext` attached and
//! drives it from the test thread. `TestMultiplexer` wires a `Multiplexer`
//! to a `PtyHost` full of scripted processes, with a `FlakyLayer` in
//! between for fault injection.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use calloop::EventLoop;

use multiplexer::config::Config;
use multiplexer::error::StreamError;
use multiplexer::host::{HostConfig, ProcessLayer, PtyHost};
use multiplexer::render::RenderHandle;
use multiplexer::visibility::{Region, Viewport};
use multiplexer::wire::{TerminalId, TransportKind};
use multiplexer::{LoopContext, Multiplexer};

use crate::fixtures::{request, VIEWPORT_HEIGHT};
use crate::flaky::FlakyLayer;
use crate::recording::RecordingRender;
use crate::scripted::{ScriptHandle, ScriptedSpawner};

/// Dispatches per `run_until_idle`; enough for chains of deferred work
const SETTLE_TURNS: usize = 32;

/// Upper bound for `block_on`
const BLOCK_ON_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    event_loop: EventLoop<'static, ()>,
    ctx: LoopContext,
}

impl Harness {
    pub fn new() -> Self {
        let event_loop = EventLoop::try_new().expect("failed to create event loop");
        let ctx = LoopContext::new(event_loop.handle()).expect("failed to attach executor");
        Self { event_loop, ctx }
    }

    pub fn ctx(&self) -> &LoopContext {
        &self.ctx
    }

    /// One dispatch without waiting
    pub fn turn(&mut self) {
        self.event_loop
            .dispatch(Some(Duration::ZERO), &mut ())
            .expect("dispatch failed");
    }

    /// Dispatch until ready work (not timers) has run its course
    pub fn run_until_idle(&mut self) {
        for _ in 0..SETTLE_TURNS {
            self.turn();
        }
    }

    /// Keep dispatching for `duration`, firing timers as they expire
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            self.event_loop
                .dispatch(Some(remaining.min(Duration::from_millis(2))), &mut ())
                .expect("dispatch failed");
        }
        self.run_until_idle();
    }

    /// Dispatch until `done` holds; false on timeout
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.event_loop
                .dispatch(Some(Duration::from_millis(2)), &mut ())
                .expect("dispatch failed");
        }
    }

    /// Run `fut` on the loop and wait for its output
    pub fn block_on<T: 'static>(&mut self, fut: impl Future<Output = T> + 'static) -> T {
        let slot = Rc::new(RefCell::new(None));
        let result = slot.clone();
        self.ctx.spawn(async move {
            *result.borrow_mut() = Some(fut.await);
        });

        let deadline = Instant::now() + BLOCK_ON_TIMEOUT;
        loop {
            if let Some(value) = slot.borrow_mut().take() {
                return value;
            }
            assert!(Instant::now() < deadline, "future did not complete within {:?}", BLOCK_ON_TIMEOUT);
            self.event_loop
                .dispatch(Some(Duration::from_millis(1)), &mut ())
                .expect("dispatch failed");
        }
    }

    /// Start `fut` on the loop without waiting for it
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        self.ctx.spawn(fut);
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestMultiplexer {
    pub harness: Harness,
    pub spawner: ScriptedSpawner,
    pub host: Rc<PtyHost>,
    pub layer: Rc<FlakyLayer>,
    pub mux: Rc<Multiplexer>,
}

impl TestMultiplexer {
    pub fn new(config: Config) -> Self {
        let harness = Harness::new();
        let spawner = ScriptedSpawner::new();
        let host = PtyHost::new(Box::new(spawner.clone()), HostConfig::from(&config.transport));
        let inner: Rc<dyn ProcessLayer> = host.clone();
        let layer = FlakyLayer::new(inner);
        let mux = Multiplexer::new(
            layer.clone(),
            harness.ctx().clone(),
            config,
            Viewport::new(0, VIEWPORT_HEIGHT),
        );

        Self {
            harness,
            spawner,
            host,
            layer,
            mux,
        }
    }

    /// Spawn a scripted session without opening a pane
    pub fn spawn(&mut self, id: &str) -> (TerminalId, ScriptHandle) {
        let id = TerminalId::new(id);
        let mux = self.mux.clone();
        let req = request(id.as_str());
        self.harness
            .block_on(async move { mux.transport(TransportKind::Standard).spawn(req).await })
            .expect("spawn failed");
        let script = self.spawner.session(&id).expect("spawned session");
        (id, script)
    }

    pub fn open(
        &mut self,
        id: &TerminalId,
        kind: TransportKind,
        render: Rc<dyn RenderHandle>,
        region: Region,
    ) -> Result<(), StreamError> {
        let mux = self.mux.clone();
        let id = id.clone();
        let result = self
            .harness
            .block_on(async move { mux.open_terminal(&id, kind, render, region).await });
        self.harness.run_until_idle();
        result
    }

    /// Spawn a session and route it into a fresh `RecordingRender`
    pub fn spawn_and_open(
        &mut self,
        id: &str,
        kind: TransportKind,
        region: Region,
    ) -> (TerminalId, ScriptHandle, Rc<RecordingRender>) {
        let (id, script) = self.spawn(id);
        let render = Rc::new(RecordingRender::new());
        self.open(&id, kind, render.clone(), region)
            .expect("open failed");
        (id, script, render)
    }

    /// Read pending process output and let it flow to the renders
    pub fn pump(&mut self) -> usize {
        let n = self.host.pump();
        self.harness.run_until_idle();
        n
    }

    pub fn emit(&mut self, script: &ScriptHandle, text: &str) {
        script.emit_str(text);
        self.pump();
    }

    /// Scroll the viewport to `offset`
    pub fn scroll_to(&mut self, offset: i64) {
        self.mux
            .visibility()
            .update_viewport(Viewport::new(offset, VIEWPORT_HEIGHT));
        self.harness.run_until_idle();
    }

    pub fn close(&mut self, id: &TerminalId) {
        let mux = self.mux.clone();
        let id = id.clone();
        self.harness
            .block_on(async move { mux.close_terminal(&id).await });
    }
}
