//! Wiring of streams, write queues, visibility and suspension
//!
//! Each open terminal gets a pane: an output stream listener feeding a
//! write queue, which flushes into the terminal's render buffer. While the
//! suspension manager holds a snapshot for a terminal, the pane's sink
//! rejects writes so output waits in the queue; a resume flushes it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde::Serialize;

use crate::config::Config;
use crate::error::{MultiplexerError, StreamError};
use crate::host::ProcessLayer;
use crate::output_stream::{Listener, OutputStreamManager};
use crate::render::RenderHandle;
use crate::runtime::LoopContext;
use crate::suspension::{SuspensionManager, SuspensionStats};
use crate::transport::{Transport, TransportSet};
use crate::visibility::{Region, Viewport, Visibility, VisibilityTracker};
use crate::wire::{SessionHandle, SpawnRequest, TerminalId, TransportKind};
use crate::write_queue::{
    ChunkReport, FlushMode, FlushOutcome, QueueStats, SharedWriteQueue, SinkError, WriteSink,
};

/// Writes flushed chunks into a render buffer unless it is suspended
struct PaneSink {
    id: TerminalId,
    render: Rc<dyn RenderHandle>,
    suspension: Weak<SuspensionManager>,
}

impl WriteSink for PaneSink {
    fn write_chunk(&self, text: &str, _report: &ChunkReport) -> Result<(), SinkError> {
        if let Some(suspension) = self.suspension.upgrade() {
            if !suspension.accepts_render_writes(&self.id) {
                return Err(SinkError::Rejected);
            }
        }
        self.render.write(text)?;
        Ok(())
    }
}

struct Pane {
    queue: SharedWriteQueue,
    sink: Rc<dyn WriteSink>,
    kind: TransportKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalStats {
    pub id: TerminalId,
    pub transport: TransportKind,
    pub started: bool,
    pub seq_cursor: Option<u64>,
    pub visibility: Option<Visibility>,
    pub suspended: bool,
    pub queue: QueueStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiplexerStats {
    pub terminals: Vec<TerminalStats>,
    pub suspension: SuspensionStats,
}

pub struct Multiplexer {
    ctx: LoopContext,
    config: Config,
    transports: Rc<TransportSet>,
    streams: Rc<OutputStreamManager>,
    visibility: Rc<VisibilityTracker>,
    suspension: Rc<SuspensionManager>,
    panes: RefCell<HashMap<TerminalId, Pane>>,
}

impl Multiplexer {
    pub fn new(
        layer: Rc<dyn ProcessLayer>,
        ctx: LoopContext,
        config: Config,
        viewport: Viewport,
    ) -> Rc<Self> {
        let transports = Rc::new(TransportSet::new(layer, ctx.clone(), &config.transport));
        let streams = OutputStreamManager::new(
            transports.clone(),
            ctx.clone(),
            config.transport.default_kind,
        );
        let visibility = VisibilityTracker::new(&config.visibility, viewport);
        let suspension = SuspensionManager::new(config.suspension.clone(), ctx.clone());

        Rc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            suspension.on_resumed(Rc::new(move |id: &TerminalId| {
                if let Some(this) = weak.upgrade() {
                    this.flush(id, FlushMode::Immediate);
                }
            }));

            Self {
                ctx,
                config,
                transports,
                streams,
                visibility,
                suspension,
                panes: RefCell::new(HashMap::new()),
            }
        })
    }

    /// Spawn a process for `request` and open a pane on it
    pub async fn spawn_terminal(
        self: &Rc<Self>,
        request: SpawnRequest,
        kind: TransportKind,
        render: Rc<dyn RenderHandle>,
        region: Region,
    ) -> Result<SessionHandle, MultiplexerError> {
        let id = request.id.clone();
        let handle = self.transports.get(kind).spawn(request).await?;
        tracing::info!(%id, pid = ?handle.pid, %kind, "terminal spawned");
        self.open_terminal(&id, kind, render, region).await?;
        Ok(handle)
    }

    /// Route the output of `id` into `render`
    ///
    /// The pane stays open if starting the stream fails; `restart_stream`
    /// retries from where it left off.
    pub async fn open_terminal(
        self: &Rc<Self>,
        id: &TerminalId,
        kind: TransportKind,
        render: Rc<dyn RenderHandle>,
        region: Region,
    ) -> Result<(), StreamError> {
        if self.panes.borrow().contains_key(id) {
            tracing::debug!(%id, "terminal already open, reopening");
            self.close_terminal(id).await;
        }

        self.streams.set_transport_kind(id, kind);

        let queue = SharedWriteQueue::new(id.clone(), self.config.write_queue.clone(), self.ctx.clone());
        let sink: Rc<dyn WriteSink> = Rc::new(PaneSink {
            id: id.clone(),
            render: render.clone(),
            suspension: Rc::downgrade(&self.suspension),
        });

        let listener_queue = queue.clone();
        let listener_sink = sink.clone();
        let listener: Listener = Rc::new(move |_: &TerminalId, text: &str| -> anyhow::Result<()> {
            listener_queue.enqueue(text);
            listener_queue.flush_pending(listener_sink.clone(), FlushMode::Coalesced);
            Ok(())
        });
        self.streams.add_listener(id, listener);

        self.visibility.register_terminal(id.clone(), region);
        self.suspension.register_terminal(id, render, &self.visibility);

        self.panes.borrow_mut().insert(
            id.clone(),
            Pane {
                queue,
                sink,
                kind,
            },
        );

        self.streams.ensure_started(id).await
    }

    pub async fn restart_stream(self: &Rc<Self>, id: &TerminalId) -> Result<(), StreamError> {
        self.streams.restart(id).await
    }

    /// Tear down the pane of `id`; the process keeps running
    ///
    /// A suspended terminal gets its snapshot back and pending output is
    /// written out before the pane goes away.
    pub async fn close_terminal(&self, id: &TerminalId) {
        let Some(pane) = self.panes.borrow_mut().remove(id) else {
            return;
        };

        // Disposing hands a held-back partial character to the pane's queue
        self.streams.dispose(id).await;
        self.suspension.unregister_terminal(id);
        self.visibility.unregister_terminal(id);

        while let FlushOutcome::Written { .. } = pane.queue.flush_now(&*pane.sink) {}
        pane.queue.reset();
        tracing::info!(%id, "terminal closed");
    }

    /// Close the pane of `id` and terminate its process
    pub async fn kill_terminal(&self, id: &TerminalId) -> Result<(), MultiplexerError> {
        let kind = self.kind_of(id)?;
        self.close_terminal(id).await;
        self.transports.get(kind).kill(id).await?;
        Ok(())
    }

    pub async fn write_input(&self, id: &TerminalId, data: &str) -> Result<(), MultiplexerError> {
        let kind = self.kind_of(id)?;
        self.transports.get(kind).write(id, data).await?;
        Ok(())
    }

    pub async fn resize(&self, id: &TerminalId, rows: u16, cols: u16) -> Result<(), MultiplexerError> {
        let kind = self.kind_of(id)?;
        self.transports.get(kind).resize(id, rows, cols).await?;
        Ok(())
    }

    fn kind_of(&self, id: &TerminalId) -> Result<TransportKind, MultiplexerError> {
        self.panes
            .borrow()
            .get(id)
            .map(|p| p.kind)
            .ok_or_else(|| MultiplexerError::NotOpen(id.clone()))
    }

    /// Flush the queue of `id`
    pub fn flush(&self, id: &TerminalId, mode: FlushMode) {
        let pane = self
            .panes
            .borrow()
            .get(id)
            .map(|p| (p.queue.clone(), p.sink.clone()));
        if let Some((queue, sink)) = pane {
            queue.flush_pending(sink, mode);
        }
    }

    pub fn queue_stats(&self, id: &TerminalId) -> Option<QueueStats> {
        self.panes.borrow().get(id).map(|p| p.queue.stats())
    }

    /// Bytes the render buffer of `id` consumed since the last call
    pub fn drain_reported_bytes(&self, id: &TerminalId) -> Option<u64> {
        self.panes
            .borrow()
            .get(id)
            .map(|p| p.queue.drain_reported_bytes())
    }

    pub fn is_open(&self, id: &TerminalId) -> bool {
        self.panes.borrow().contains_key(id)
    }

    pub fn terminal_ids(&self) -> Vec<TerminalId> {
        let mut ids: Vec<_> = self.panes.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> MultiplexerStats {
        let terminals = self
            .terminal_ids()
            .into_iter()
            .filter_map(|id| {
                let (kind, queue) = {
                    let panes = self.panes.borrow();
                    let pane = panes.get(&id)?;
                    (pane.kind, pane.queue.stats())
                };
                Some(TerminalStats {
                    transport: kind,
                    started: self.streams.is_started(&id),
                    seq_cursor: self.streams.seq_cursor(&id),
                    visibility: self.visibility.state(&id).map(|s| s.visibility),
                    suspended: self.suspension.is_suspended(&id),
                    queue,
                    id,
                })
            })
            .collect();

        MultiplexerStats {
            terminals,
            suspension: self.suspension.stats(),
        }
    }

    pub fn transport(&self, kind: TransportKind) -> &Transport {
        self.transports.get(kind)
    }

    pub fn streams(&self) -> &Rc<OutputStreamManager> {
        &self.streams
    }

    pub fn visibility(&self) -> &Rc<VisibilityTracker> {
        &self.visibility
    }

    pub fn suspension(&self) -> &Rc<SuspensionManager> {
        &self.suspension
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close every pane and drop all tracking state
    pub async fn dispose(&self) {
        for id in self.terminal_ids() {
            self.close_terminal(&id).await;
        }
        self.suspension.dispose();
        self.visibility.dispose();
    }
}
