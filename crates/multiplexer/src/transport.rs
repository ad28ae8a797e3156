//! Transports between the output streams and the process layer
//!
//! Two interchangeable protocols, chosen per terminal:
//!
//! - `StandardTransport`: no handshake. A push listener on the process
//!   layer's event broadcast, filtered by terminal id. No flow control.
//! - `SequencedTransport`: explicit subscribe with a resume position, frames
//!   over a bounded ordered channel, per-frame acknowledgement.
//!
//! Both keep at most one active subscription per terminal; subscribing again
//! tears down the previous one first.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use calloop::channel;
use calloop::RegistrationToken;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::host::{HostSubscriptionId, ListenerId, ProcessLayer};
use crate::runtime::LoopContext;
use crate::wire::{
    Backfill, BackfillRequest, Frame, PtyEvent, SessionHandle, SpawnRequest, SubscribeReply,
    TerminalId, TransportKind,
};

/// Receives the frames of a subscription, on the event loop
pub type FrameCallback = Box<dyn FnMut(Frame)>;

/// Handle on an active subscription
///
/// Stale once the terminal is subscribed again; unsubscribing a stale handle
/// does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: TerminalId,
    pub kind: TransportKind,
    generation: u64,
}

enum Binding {
    Host(HostSubscriptionId),
    Listener(ListenerId),
}

struct ActiveSubscription {
    generation: u64,
    token: RegistrationToken,
    binding: Binding,
}

/// State common to both transports
struct Shared {
    layer: Rc<dyn ProcessLayer>,
    ctx: LoopContext,
    active: RefCell<HashMap<TerminalId, ActiveSubscription>>,
    next_generation: Cell<u64>,
}

impl Shared {
    fn new(layer: Rc<dyn ProcessLayer>, ctx: LoopContext) -> Self {
        Self {
            layer,
            ctx,
            active: RefCell::new(HashMap::new()),
            next_generation: Cell::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        let generation = self.next_generation.get() + 1;
        self.next_generation.set(generation);
        generation
    }

    /// Record a new active subscription, detaching one that raced in meanwhile
    fn activate(&self, id: &TerminalId, token: RegistrationToken, binding: Binding) -> u64 {
        let generation = self.next_generation();
        let previous = self.active.borrow_mut().insert(
            id.clone(),
            ActiveSubscription {
                generation,
                token,
                binding,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(%id, "concurrent subscribe, detaching the older one");
            self.detach(id, previous);
        }
        generation
    }

    /// Tear down without waiting for the process layer
    fn detach(&self, id: &TerminalId, active: ActiveSubscription) {
        self.ctx.remove(active.token);
        match active.binding {
            Binding::Listener(listener) => self.layer.remove_event_listener(listener),
            Binding::Host(subscription) => {
                let layer = self.layer.clone();
                let id = id.clone();
                self.ctx.spawn(async move {
                    if let Err(e) = layer.unsubscribe(&id, subscription).await {
                        tracing::warn!(%id, error = %e, "unsubscribe failed");
                    }
                });
            }
        }
    }

    /// Tear down the active subscription of `id`, if any
    ///
    /// Failures are logged and swallowed.
    async fn release(&self, id: &TerminalId) {
        let Some(active) = self.active.borrow_mut().remove(id) else {
            return;
        };

        self.ctx.remove(active.token);
        match active.binding {
            Binding::Listener(listener) => self.layer.remove_event_listener(listener),
            Binding::Host(subscription) => {
                if let Err(e) = self.layer.unsubscribe(id, subscription).await {
                    tracing::warn!(%id, error = %e, "unsubscribe failed");
                }
            }
        }
        tracing::debug!(%id, "subscription released");
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        let current = self
            .active
            .borrow()
            .get(&subscription.id)
            .map(|a| a.generation);
        if current != Some(subscription.generation) {
            tracing::trace!(id = %subscription.id, "ignoring stale unsubscribe");
            return;
        }
        self.release(&subscription.id).await;
    }

    fn is_subscribed(&self, id: &TerminalId) -> bool {
        self.active.borrow().contains_key(id)
    }
}

/// Push transport: broadcast events filtered by id
pub struct StandardTransport {
    shared: Shared,
}

impl StandardTransport {
    pub fn new(layer: Rc<dyn ProcessLayer>, ctx: LoopContext) -> Self {
        Self {
            shared: Shared::new(layer, ctx),
        }
    }

    /// Register a push listener for `id`
    ///
    /// There is no handshake, so the reply only echoes the resume position.
    async fn subscribe(
        &self,
        id: &TerminalId,
        last_seen_seq: Option<u64>,
        mut on_data: FrameCallback,
    ) -> Result<(SubscribeReply, Subscription), TransportError> {
        self.shared.release(id).await;

        let (tx, rx) = channel::channel::<PtyEvent>();
        let target = id.clone();
        let token = self.shared.ctx.insert_channel(rx, move |event| {
            if let PtyEvent::Output { id, frame } = event {
                if id == target {
                    on_data(frame);
                }
            }
        })?;
        let listener = self.shared.layer.add_event_listener(tx);
        let generation = self.shared.activate(id, token, Binding::Listener(listener));

        tracing::debug!(%id, ?last_seen_seq, "standard subscription registered");
        Ok((
            SubscribeReply::DeltaReady {
                seq: last_seen_seq.unwrap_or(0),
            },
            Subscription {
                id: id.clone(),
                kind: TransportKind::Standard,
                generation,
            },
        ))
    }
}

/// Subscribe/ack transport with resumable delivery
pub struct SequencedTransport {
    shared: Shared,
    frame_channel_capacity: usize,
}

impl SequencedTransport {
    pub fn new(layer: Rc<dyn ProcessLayer>, ctx: LoopContext, frame_channel_capacity: usize) -> Self {
        Self {
            shared: Shared::new(layer, ctx),
            frame_channel_capacity: frame_channel_capacity.max(1),
        }
    }

    async fn subscribe(
        &self,
        id: &TerminalId,
        last_seen_seq: Option<u64>,
        on_data: FrameCallback,
    ) -> Result<(SubscribeReply, Subscription), TransportError> {
        self.shared.release(id).await;

        let (tx, rx) = channel::sync_channel::<Frame>(self.frame_channel_capacity);
        let token = self.shared.ctx.insert_channel(rx, on_data)?;

        let (reply, host_subscription) = match self.shared.layer.subscribe(id, last_seen_seq, tx).await {
            Ok(result) => result,
            Err(e) => {
                self.shared.ctx.remove(token);
                return Err(e);
            }
        };
        let generation = self
            .shared
            .activate(id, token, Binding::Host(host_subscription));

        tracing::debug!(%id, ?last_seen_seq, head = reply.seq(), "sequenced subscription registered");
        Ok((
            reply,
            Subscription {
                id: id.clone(),
                kind: TransportKind::Sequenced,
                generation,
            },
        ))
    }
}

/// A transport, selected per terminal
pub enum Transport {
    Standard(StandardTransport),
    Sequenced(SequencedTransport),
}

impl Transport {
    fn shared(&self) -> &Shared {
        match self {
            Transport::Standard(t) => &t.shared,
            Transport::Sequenced(t) => &t.shared,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Standard(_) => TransportKind::Standard,
            Transport::Sequenced(_) => TransportKind::Sequenced,
        }
    }

    pub async fn spawn(&self, request: SpawnRequest) -> Result<SessionHandle, TransportError> {
        self.shared().layer.spawn(request).await
    }

    pub async fn write(&self, id: &TerminalId, data: &str) -> Result<(), TransportError> {
        self.shared().layer.write(id, data.as_bytes()).await
    }

    pub async fn resize(&self, id: &TerminalId, rows: u16, cols: u16) -> Result<(), TransportError> {
        self.shared().layer.resize(id, rows, cols).await
    }

    /// Release the subscription of `id`, then terminate its process
    pub async fn kill(&self, id: &TerminalId) -> Result<(), TransportError> {
        self.shared().release(id).await;
        self.shared().layer.kill(id).await
    }

    /// Subscribe to the output of `id`, replacing any active subscription
    pub async fn subscribe(
        &self,
        id: &TerminalId,
        last_seen_seq: Option<u64>,
        on_data: FrameCallback,
    ) -> Result<(SubscribeReply, Subscription), TransportError> {
        match self {
            Transport::Standard(t) => t.subscribe(id, last_seen_seq, on_data).await,
            Transport::Sequenced(t) => t.subscribe(id, last_seen_seq, on_data).await,
        }
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.shared().unsubscribe(subscription).await;
    }

    /// Return flow-control credit; a no-op on the standard transport
    pub async fn ack(&self, id: &TerminalId, seq: u64, bytes_consumed: usize) -> Result<(), TransportError> {
        match self {
            Transport::Standard(_) => Ok(()),
            Transport::Sequenced(t) => t.shared.layer.ack(id, seq, bytes_consumed).await,
        }
    }

    pub async fn backfill(&self, request: BackfillRequest) -> Result<Backfill, TransportError> {
        self.shared().layer.backfill(request).await
    }

    pub fn is_subscribed(&self, id: &TerminalId) -> bool {
        self.shared().is_subscribed(id)
    }
}

/// Both transports over one process layer
pub struct TransportSet {
    standard: Transport,
    sequenced: Transport,
}

impl TransportSet {
    pub fn new(layer: Rc<dyn ProcessLayer>, ctx: LoopContext, config: &TransportConfig) -> Self {
        Self {
            standard: Transport::Standard(StandardTransport::new(layer.clone(), ctx.clone())),
            sequenced: Transport::Sequenced(SequencedTransport::new(
                layer,
                ctx,
                config.frame_channel_capacity,
            )),
        }
    }

    pub fn get(&self, kind: TransportKind) -> &Transport {
        match kind {
            TransportKind::Standard => &self.standard,
            TransportKind::Sequenced => &self.sequenced,
        }
    }
}
