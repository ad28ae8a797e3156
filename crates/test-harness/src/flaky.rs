//! Fault-injecting process layer
//!
//! Wraps another `ProcessLayer`, counts calls, and can fail or hold back
//! backfill and subscribe so tests can interleave operations with a start
//! that is still in flight. It can also push stale frames into a new
//! subscription, the way a redelivering host would.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;
use calloop::channel::{Sender, SyncSender};
use futures::channel::oneshot;

use multiplexer::error::TransportError;
use multiplexer::host::{HostSubscriptionId, ListenerId, ProcessLayer};
use multiplexer::wire::{
    Backfill, BackfillRequest, Frame, PtyEvent, SessionHandle, SpawnRequest, SubscribeReply,
    TerminalId,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub backfill: usize,
    pub subscribe: usize,
    pub unsubscribe: usize,
    pub ack: usize,
}

#[derive(Default)]
struct Gate {
    closed: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Gate {
    fn wait(&mut self) -> Option<oneshot::Receiver<()>> {
        if !self.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        Some(rx)
    }

    fn open(&mut self) {
        self.closed = false;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

pub struct FlakyLayer {
    inner: Rc<dyn ProcessLayer>,
    fail_backfill: Cell<usize>,
    fail_subscribe: Cell<usize>,
    fail_ack: Cell<bool>,
    subscribe_gate: RefCell<Gate>,
    counts: Cell<CallCounts>,
    acks: RefCell<Vec<(TerminalId, u64, usize)>>,
    replay: RefCell<Vec<Frame>>,
}

impl FlakyLayer {
    pub fn new(inner: Rc<dyn ProcessLayer>) -> Rc<Self> {
        Rc::new(Self {
            inner,
            fail_backfill: Cell::new(0),
            fail_subscribe: Cell::new(0),
            fail_ack: Cell::new(false),
            subscribe_gate: RefCell::new(Gate::default()),
            counts: Cell::new(CallCounts::default()),
            acks: RefCell::new(Vec::new()),
            replay: RefCell::new(Vec::new()),
        })
    }

    /// Fail the next `n` backfill calls
    pub fn fail_backfill(&self, n: usize) {
        self.fail_backfill.set(n);
    }

    /// Fail the next `n` subscribe calls
    pub fn fail_subscribe(&self, n: usize) {
        self.fail_subscribe.set(n);
    }

    pub fn fail_acks(&self, fail: bool) {
        self.fail_ack.set(fail);
    }

    /// Park subscribe calls until `open_subscribe`
    pub fn hold_subscribe(&self) {
        self.subscribe_gate.borrow_mut().closed = true;
    }

    pub fn open_subscribe(&self) {
        self.subscribe_gate.borrow_mut().open();
    }

    /// Send `frames` down the channel of the next subscribe, ahead of the host
    pub fn replay_on_subscribe(&self, frames: Vec<Frame>) {
        *self.replay.borrow_mut() = frames;
    }

    pub fn counts(&self) -> CallCounts {
        self.counts.get()
    }

    /// Every ack seen, as (id, seq, bytes)
    pub fn acks(&self) -> Vec<(TerminalId, u64, usize)> {
        self.acks.borrow().clone()
    }

    fn count(&self, f: impl FnOnce(&mut CallCounts)) {
        let mut counts = self.counts.get();
        f(&mut counts);
        self.counts.set(counts);
    }

    fn take_failure(cell: &Cell<usize>) -> bool {
        let n = cell.get();
        if n == 0 {
            return false;
        }
        cell.set(n - 1);
        true
    }
}

#[async_trait(?Send)]
impl ProcessLayer for FlakyLayer {
    async fn spawn(&self, request: SpawnRequest) -> Result<SessionHandle, TransportError> {
        self.inner.spawn(request).await
    }

    async fn write(&self, id: &TerminalId, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write(id, data).await
    }

    async fn resize(&self, id: &TerminalId, rows: u16, cols: u16) -> Result<(), TransportError> {
        self.inner.resize(id, rows, cols).await
    }

    async fn kill(&self, id: &TerminalId) -> Result<(), TransportError> {
        self.inner.kill(id).await
    }

    async fn backfill(&self, request: BackfillRequest) -> Result<Backfill, TransportError> {
        self.count(|c| c.backfill += 1);
        if Self::take_failure(&self.fail_backfill) {
            tracing::debug!(id = %request.id, "injecting backfill failure");
            return Err(TransportError::Unavailable("injected backfill failure".into()));
        }
        self.inner.backfill(request).await
    }

    async fn subscribe(
        &self,
        id: &TerminalId,
        last_seen_seq: Option<u64>,
        frames: SyncSender<Frame>,
    ) -> Result<(SubscribeReply, HostSubscriptionId), TransportError> {
        self.count(|c| c.subscribe += 1);

        let gate = self.subscribe_gate.borrow_mut().wait();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if Self::take_failure(&self.fail_subscribe) {
            tracing::debug!(%id, "injecting subscribe failure");
            return Err(TransportError::Unavailable("injected subscribe failure".into()));
        }

        let replay = std::mem::take(&mut *self.replay.borrow_mut());
        for frame in replay {
            tracing::debug!(%id, seq = frame.seq, "replaying frame");
            if frames.try_send(frame).is_err() {
                break;
            }
        }
        self.inner.subscribe(id, last_seen_seq, frames).await
    }

    async fn unsubscribe(
        &self,
        id: &TerminalId,
        subscription: HostSubscriptionId,
    ) -> Result<(), TransportError> {
        self.count(|c| c.unsubscribe += 1);
        self.inner.unsubscribe(id, subscription).await
    }

    async fn ack(&self, id: &TerminalId, seq: u64, bytes_consumed: usize) -> Result<(), TransportError> {
        self.count(|c| c.ack += 1);
        self.acks
            .borrow_mut()
            .push((id.clone(), seq, bytes_consumed));
        if self.fail_ack.get() {
            tracing::debug!(%id, seq, "injecting ack failure");
            return Err(TransportError::Unavailable("injected ack failure".into()));
        }
        self.inner.ack(id, seq, bytes_consumed).await
    }

    fn add_event_listener(&self, listener: Sender<PtyEvent>) -> ListenerId {
        self.inner.add_event_listener(listener)
    }

    fn remove_event_listener(&self, listener: ListenerId) {
        self.inner.remove_event_listener(listener);
    }
}
