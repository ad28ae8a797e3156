//! Per-terminal output streams
//!
//! The stream manager is the only consumer of raw process output. For each
//! terminal it hydrates the backlog, keeps one transport subscription alive,
//! drops frames it has already seen, decodes the rest incrementally and fans
//! the text out to listeners.
//!
//! Concurrent `ensure_started` calls share one in-flight start. A failed
//! start leaves the stream not started so a later call retries from the
//! current cursor.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture, Shared};

use crate::decoder::Utf8Decoder;
use crate::error::StreamError;
use crate::runtime::LoopContext;
use crate::transport::{FrameCallback, Subscription, TransportSet};
use crate::wire::{BackfillRequest, Frame, SubscribeReply, TerminalId, TransportKind};

/// Consumer of decoded output; an error is logged and does not affect other listeners
pub type Listener = Rc<dyn Fn(&TerminalId, &str) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type StartFuture = Shared<LocalBoxFuture<'static, Result<(), StreamError>>>;

struct Stream {
    started: bool,
    starting: Option<StartFuture>,
    seq_cursor: Option<u64>,
    listeners: Vec<(ListenerId, Listener)>,
    decoder: Utf8Decoder,
    subscription: Option<Subscription>,
    kind: TransportKind,
    /// Identifies the current start attempt; frames and completions of older
    /// attempts are ignored
    generation: u64,
    /// Frames that arrived before the start finished
    early_frames: Vec<Frame>,
}

impl Stream {
    fn new(kind: TransportKind) -> Self {
        Self {
            started: false,
            starting: None,
            seq_cursor: None,
            listeners: Vec::new(),
            decoder: Utf8Decoder::new(),
            subscription: None,
            kind,
            generation: 0,
            early_frames: Vec::new(),
        }
    }

    /// Advance the cursor past `seq` and decode `bytes`; `None` for duplicates
    fn accept(&mut self, seq: u64, bytes: &[u8]) -> Option<String> {
        if self.seq_cursor.is_some_and(|cursor| seq <= cursor) {
            return None;
        }
        self.seq_cursor = Some(seq);
        Some(self.decoder.decode(bytes))
    }
}

/// Registry of output streams
pub struct OutputStreamManager {
    transports: Rc<TransportSet>,
    ctx: LoopContext,
    default_kind: TransportKind,
    kind_overrides: RefCell<HashMap<TerminalId, TransportKind>>,
    streams: RefCell<HashMap<TerminalId, Stream>>,
    next_listener: Cell<u64>,
    next_generation: Cell<u64>,
}

impl OutputStreamManager {
    pub fn new(transports: Rc<TransportSet>, ctx: LoopContext, default_kind: TransportKind) -> Rc<Self> {
        Rc::new(Self {
            transports,
            ctx,
            default_kind,
            kind_overrides: RefCell::new(HashMap::new()),
            streams: RefCell::new(HashMap::new()),
            next_listener: Cell::new(0),
            next_generation: Cell::new(0),
        })
    }

    /// Use `kind` for `id` from its next start on
    pub fn set_transport_kind(&self, id: &TerminalId, kind: TransportKind) {
        self.kind_overrides.borrow_mut().insert(id.clone(), kind);
    }

    fn kind_for(&self, id: &TerminalId) -> TransportKind {
        self.kind_overrides
            .borrow()
            .get(id)
            .copied()
            .unwrap_or(self.default_kind)
    }

    /// Start streaming `id` unless it already is
    ///
    /// Callers racing on the same id all await the same start.
    pub async fn ensure_started(self: &Rc<Self>, id: &TerminalId) -> Result<(), StreamError> {
        let start = {
            let mut streams = self.streams.borrow_mut();
            let stream = streams
                .entry(id.clone())
                .or_insert_with(|| Stream::new(self.default_kind));

            if stream.started {
                return Ok(());
            }

            match stream.starting.clone() {
                Some(start) => start,
                None => {
                    let generation = self.next_generation.get() + 1;
                    self.next_generation.set(generation);
                    let kind = self.kind_for(id);
                    stream.generation = generation;
                    stream.kind = kind;

                    let this = self.clone();
                    let id = id.clone();
                    let start = async move { this.start_sequence(id, generation, kind).await }
                        .boxed_local()
                        .shared();
                    stream.starting = Some(start.clone());
                    start
                }
            }
        };

        start.await
    }

    /// Drop the subscription of `id` and start again from its cursor
    pub async fn restart(self: &Rc<Self>, id: &TerminalId) -> Result<(), StreamError> {
        let subscription = {
            let mut streams = self.streams.borrow_mut();
            match streams.get_mut(id) {
                Some(stream) if stream.starting.is_none() => {
                    stream.started = false;
                    stream.subscription.take()
                }
                _ => None,
            }
        };
        if let Some(subscription) = subscription {
            self.transports
                .get(subscription.kind)
                .unsubscribe(&subscription)
                .await;
        }
        self.ensure_started(id).await
    }

    fn is_current(&self, id: &TerminalId, generation: u64) -> bool {
        self.streams
            .borrow()
            .get(id)
            .is_some_and(|s| s.generation == generation)
    }

    fn cursor(&self, id: &TerminalId) -> Option<u64> {
        self.streams.borrow().get(id).and_then(|s| s.seq_cursor)
    }

    async fn start_sequence(
        self: Rc<Self>,
        id: TerminalId,
        generation: u64,
        kind: TransportKind,
    ) -> Result<(), StreamError> {
        let result = self.run_start(&id, generation, kind).await;

        if let Err(e) = &result {
            let mut streams = self.streams.borrow_mut();
            if let Some(stream) = streams.get_mut(&id) {
                if stream.generation == generation {
                    stream.started = false;
                    stream.starting = None;
                    stream.early_frames.clear();
                }
            }
            tracing::warn!(%id, error = %e, "stream start failed");
        }
        result
    }

    async fn run_start(
        self: &Rc<Self>,
        id: &TerminalId,
        generation: u64,
        kind: TransportKind,
    ) -> Result<(), StreamError> {
        let transport = self.transports.get(kind);

        // Hydrate whatever was buffered since the cursor
        let backfill = transport
            .backfill(BackfillRequest {
                id: id.clone(),
                from_seq: self.cursor(id),
            })
            .await?;
        if !self.is_current(id, generation) {
            return Err(StreamError::Disposed(id.clone()));
        }
        if !backfill.data.is_empty() {
            tracing::debug!(%id, from = backfill.start_seq, to = backfill.seq, bytes = backfill.data.len(), "hydrating backlog");
            self.accept_and_dispatch(id, generation, backfill.seq, &backfill.data);
        }

        let weak = Rc::downgrade(self);
        let frame_id = id.clone();
        let on_data: FrameCallback = Box::new(move |frame| {
            if let Some(this) = weak.upgrade() {
                this.handle_frame(&frame_id, generation, frame);
            }
        });

        let (reply, subscription) = transport.subscribe(id, self.cursor(id), on_data).await?;

        // Disposed or superseded while subscribing
        if !self.is_current(id, generation) {
            transport.unsubscribe(&subscription).await;
            return Err(StreamError::Disposed(id.clone()));
        }

        if let SubscribeReply::Snapshot { seq, bytes } = &reply {
            self.accept_and_dispatch(id, generation, *seq, bytes);
        }

        let early_frames = {
            let mut streams = self.streams.borrow_mut();
            let Some(stream) = streams.get_mut(id) else {
                return Err(StreamError::Disposed(id.clone()));
            };
            stream.started = true;
            stream.starting = None;
            stream.subscription = Some(subscription);
            let mut frames = std::mem::take(&mut stream.early_frames);
            frames.sort_by_key(|f| f.seq);
            frames
        };

        tracing::info!(%id, %kind, cursor = ?self.cursor(id), "stream started");
        for frame in early_frames {
            self.handle_frame(id, generation, frame);
        }
        Ok(())
    }

    /// Dedup, decode and dispatch one chunk without acknowledging it
    fn accept_and_dispatch(&self, id: &TerminalId, generation: u64, seq: u64, bytes: &[u8]) {
        let accepted = {
            let mut streams = self.streams.borrow_mut();
            let Some(stream) = streams.get_mut(id) else {
                return;
            };
            if stream.generation != generation {
                return;
            }
            stream
                .accept(seq, bytes)
                .map(|text| (text, stream.listeners.clone()))
        };

        if let Some((text, listeners)) = accepted {
            dispatch(id, &text, &listeners);
        }
    }

    fn handle_frame(self: &Rc<Self>, id: &TerminalId, generation: u64, frame: Frame) {
        let (text, listeners, kind) = {
            let mut streams = self.streams.borrow_mut();
            let Some(stream) = streams.get_mut(id) else {
                return;
            };
            if stream.generation != generation {
                return;
            }
            if !stream.started {
                stream.early_frames.push(frame);
                return;
            }
            let Some(text) = stream.accept(frame.seq, &frame.bytes) else {
                tracing::trace!(%id, seq = frame.seq, "dropping duplicate frame");
                return;
            };
            (text, stream.listeners.clone(), stream.kind)
        };

        dispatch(id, &text, &listeners);

        if kind == TransportKind::Sequenced {
            let this = self.clone();
            let id = id.clone();
            self.ctx.spawn(async move {
                let transport = this.transports.get(kind);
                if let Err(e) = transport.ack(&id, frame.seq, frame.bytes.len()).await {
                    tracing::warn!(%id, seq = frame.seq, error = %e, "ack failed");
                }
            });
        }
    }

    /// Add a listener, creating the stream entry if needed
    pub fn add_listener(&self, id: &TerminalId, listener: Listener) -> ListenerId {
        let listener_id = ListenerId(self.next_listener.get() + 1);
        self.next_listener.set(listener_id.0);

        let kind = self.kind_for(id);
        self.streams
            .borrow_mut()
            .entry(id.clone())
            .or_insert_with(|| Stream::new(kind))
            .listeners
            .push((listener_id, listener));
        listener_id
    }

    pub fn remove_listener(&self, id: &TerminalId, listener: ListenerId) -> bool {
        let mut streams = self.streams.borrow_mut();
        let Some(stream) = streams.get_mut(id) else {
            return false;
        };
        let before = stream.listeners.len();
        stream.listeners.retain(|(lid, _)| *lid != listener);
        stream.listeners.len() != before
    }

    /// Unsubscribe, drop listeners and forget the stream
    ///
    /// An incomplete trailing character is dispatched as U+FFFD first. A
    /// start still in flight releases its subscription when it completes.
    pub async fn dispose(&self, id: &TerminalId) {
        let Some(mut stream) = self.streams.borrow_mut().remove(id) else {
            return;
        };
        dispatch(id, &stream.decoder.flush(), &stream.listeners);
        if let Some(subscription) = stream.subscription {
            self.transports
                .get(subscription.kind)
                .unsubscribe(&subscription)
                .await;
        }
        tracing::debug!(%id, "stream disposed");
    }

    pub fn is_started(&self, id: &TerminalId) -> bool {
        self.streams.borrow().get(id).is_some_and(|s| s.started)
    }

    pub fn is_starting(&self, id: &TerminalId) -> bool {
        self.streams
            .borrow()
            .get(id)
            .is_some_and(|s| s.starting.is_some())
    }

    pub fn seq_cursor(&self, id: &TerminalId) -> Option<u64> {
        self.cursor(id)
    }

    pub fn listener_count(&self, id: &TerminalId) -> usize {
        self.streams
            .borrow()
            .get(id)
            .map_or(0, |s| s.listeners.len())
    }

    /// Transport the current subscription of `id` uses
    pub fn transport_kind(&self, id: &TerminalId) -> Option<TransportKind> {
        self.streams
            .borrow()
            .get(id)
            .and_then(|s| s.subscription.as_ref().map(|sub| sub.kind))
    }
}

fn dispatch(id: &TerminalId, text: &str, listeners: &[(ListenerId, Listener)]) {
    if text.is_empty() {
        return;
    }
    for (listener_id, listener) in listeners {
        if let Err(e) = listener(id, text) {
            tracing::warn!(%id, listener = listener_id.0, error = %e, "output listener failed");
        }
    }
}
