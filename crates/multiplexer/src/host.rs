//! Process layer
//!
//! `ProcessLayer` is the boundary the transports talk to. `PtyHost` is the
//! in-process implementation: it owns the sessions, numbers their output
//! into frames, keeps a bounded backlog per session for snapshots and
//! backfill, and delivers frames to subscribers.
//!
//! Sequenced subscribers receive frames through a bounded channel under a
//! credit window: once a subscriber has `ack_window_bytes` unacknowledged,
//! or its channel is full, delivery stalls until it acks. Push listeners get
//! every frame as a `PtyEvent` with no flow control.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::mpsc::TrySendError;
use std::time::Duration;

use async_trait::async_trait;
use calloop::channel::{Sender, SyncSender};
use calloop::RegistrationToken;

use terminal::pty::{Pty, PtyCommand, PtyError};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::runtime::{LoopContext, RuntimeError};
use crate::wire::{
    Backfill, BackfillRequest, Frame, PtyEvent, SessionHandle, SpawnRequest, SubscribeReply,
    TerminalId,
};

/// Upper bound on bytes read from one session per pump
const MAX_READ_PER_PUMP: usize = 64 * 1024;

/// Identifies a sequenced subscription on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostSubscriptionId(pub u64);

/// Identifies a push listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The running process behind a session
pub trait ProcessIo {
    /// Non-blocking read; `Ok(0)` means nothing is pending
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Non-blocking write; returns how much was accepted
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize>;

    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()>;

    fn is_running(&mut self) -> bool;

    fn terminate(&mut self);

    fn pid(&self) -> Option<u32>;
}

/// Starts processes for spawn requests
pub trait ProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessIo>, TransportError>;
}

fn pty_to_io(e: PtyError) -> std::io::Error {
    match e {
        PtyError::Io(e) | PtyError::Open(e) | PtyError::Spawn(e) => e,
        other => std::io::Error::other(other.to_string()),
    }
}

impl ProcessIo for Pty {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Pty::read(self, buf).map_err(pty_to_io)
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        Pty::write(self, data).map_err(pty_to_io)
    }

    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
        Pty::resize(self, cols, rows).map_err(pty_to_io)
    }

    fn is_running(&mut self) -> bool {
        Pty::is_running(self)
    }

    fn terminate(&mut self) {
        Pty::terminate(self);
    }

    fn pid(&self) -> Option<u32> {
        Some(Pty::pid(self))
    }
}

/// Spawns sessions on real PTYs
#[derive(Debug, Clone, Default)]
pub struct PtySpawner {
    /// Shell overriding `$SHELL`
    pub shell: Option<String>,
}

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessIo>, TransportError> {
        let mut env = request.env.clone();
        if let Some(shell) = &self.shell {
            env.entry("SHELL".to_string()).or_insert_with(|| shell.clone());
        }

        let pty = Pty::spawn(&PtyCommand {
            command: request.command.as_deref(),
            working_dir: &request.cwd,
            env: &env,
            cols: request.cols,
            rows: request.rows,
        })
        .map_err(|e| TransportError::Spawn {
            id: request.id.clone(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(pty))
    }
}

/// The IPC seam between transports and the processes
#[async_trait(?Send)]
pub trait ProcessLayer {
    async fn spawn(&self, request: SpawnRequest) -> Result<SessionHandle, TransportError>;

    async fn write(&self, id: &TerminalId, data: &[u8]) -> Result<(), TransportError>;

    async fn resize(&self, id: &TerminalId, rows: u16, cols: u16) -> Result<(), TransportError>;

    async fn kill(&self, id: &TerminalId) -> Result<(), TransportError>;

    async fn backfill(&self, request: BackfillRequest) -> Result<Backfill, TransportError>;

    /// Start a sequenced subscription delivering into `frames`
    ///
    /// Replaces any existing subscription for `id`.
    async fn subscribe(
        &self,
        id: &TerminalId,
        last_seen_seq: Option<u64>,
        frames: SyncSender<Frame>,
    ) -> Result<(SubscribeReply, HostSubscriptionId), TransportError>;

    async fn unsubscribe(
        &self,
        id: &TerminalId,
        subscription: HostSubscriptionId,
    ) -> Result<(), TransportError>;

    async fn ack(&self, id: &TerminalId, seq: u64, bytes_consumed: usize)
        -> Result<(), TransportError>;

    /// Receive every `PtyEvent` until removed
    fn add_event_listener(&self, listener: Sender<PtyEvent>) -> ListenerId;

    fn remove_event_listener(&self, listener: ListenerId);
}

/// Limits applied by `PtyHost`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub backlog_limit_bytes: usize,
    pub ack_window_bytes: usize,
}

impl From<&TransportConfig> for HostConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            backlog_limit_bytes: config.backlog_limit_bytes,
            ack_window_bytes: config.ack_window_bytes,
        }
    }
}

struct Subscriber {
    id: HostSubscriptionId,
    frames: SyncSender<Frame>,
    /// Highest seq handed to the channel
    delivered_seq: u64,
    unacked_bytes: usize,
    stalled: bool,
}

struct Session {
    process: Box<dyn ProcessIo>,
    next_seq: u64,
    backlog: VecDeque<Frame>,
    backlog_bytes: usize,
    subscriber: Option<Subscriber>,
    pending_write: Vec<u8>,
    exited: bool,
}

impl Session {
    fn new(process: Box<dyn ProcessIo>) -> Self {
        Self {
            process,
            next_seq: 1,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            subscriber: None,
            pending_write: Vec::new(),
            exited: false,
        }
    }

    /// Seq of the newest frame (0 before any output)
    fn head_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Number `bytes` as the next frame and append it to the backlog
    fn push_frame(&mut self, bytes: Vec<u8>, backlog_limit: usize) -> Frame {
        let frame = Frame {
            seq: self.next_seq,
            bytes,
        };
        self.next_seq += 1;

        self.backlog_bytes += frame.bytes.len();
        self.backlog.push_back(frame.clone());
        while self.backlog_bytes > backlog_limit && self.backlog.len() > 1 {
            if let Some(evicted) = self.backlog.pop_front() {
                self.backlog_bytes -= evicted.bytes.len();
            }
        }
        frame
    }

    /// Hand backlog frames the subscriber has not seen to its channel
    fn deliver_pending(&mut self, id: &TerminalId, window: usize) {
        let Session {
            backlog,
            subscriber,
            ..
        } = self;
        let Some(sub) = subscriber.as_mut() else {
            return;
        };

        if let Some(oldest) = backlog.front() {
            if oldest.seq > sub.delivered_seq + 1 {
                tracing::warn!(
                    %id,
                    delivered = sub.delivered_seq,
                    oldest = oldest.seq,
                    "subscriber fell behind the backlog, frames lost"
                );
            }
        }

        let mut disconnected = false;
        let from = sub.delivered_seq;
        for frame in backlog.iter().filter(|f| f.seq > from) {
            if sub.unacked_bytes >= window {
                sub.stalled = true;
                break;
            }
            match sub.frames.try_send(frame.clone()) {
                Ok(()) => {
                    sub.delivered_seq = frame.seq;
                    sub.unacked_bytes += frame.bytes.len();
                    sub.stalled = false;
                }
                Err(TrySendError::Full(_)) => {
                    sub.stalled = true;
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    disconnected = true;
                    break;
                }
            }
        }

        if disconnected {
            tracing::debug!(%id, "subscriber channel closed, dropping subscription");
            *subscriber = None;
        }
    }

    fn flush_pending_write(&mut self) -> std::io::Result<()> {
        if self.pending_write.is_empty() {
            return Ok(());
        }
        let written = self.process.write(&self.pending_write)?;
        if written > 0 {
            self.pending_write.drain(..written);
        }
        Ok(())
    }
}

#[derive(Default)]
struct HostInner {
    sessions: HashMap<TerminalId, Session>,
    listeners: Vec<(ListenerId, Sender<PtyEvent>)>,
    next_listener: u64,
    next_subscription: u64,
}

impl HostInner {
    fn session_mut(&mut self, id: &TerminalId) -> Result<&mut Session, TransportError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| TransportError::UnknownTerminal(id.clone()))
    }

    fn broadcast(&mut self, event: PtyEvent) {
        self.listeners
            .retain(|(_, listener)| listener.send(event.clone()).is_ok());
    }
}

/// In-process process layer
pub struct PtyHost {
    spawner: Box<dyn ProcessSpawner>,
    config: HostConfig,
    inner: RefCell<HostInner>,
}

impl PtyHost {
    pub fn new(spawner: Box<dyn ProcessSpawner>, config: HostConfig) -> Rc<Self> {
        Rc::new(Self {
            spawner,
            config,
            inner: RefCell::new(HostInner::default()),
        })
    }

    /// Pump every session on `interval` until the host is dropped
    pub fn attach_pump(
        self: &Rc<Self>,
        ctx: &LoopContext,
        interval: Duration,
    ) -> Result<RegistrationToken, RuntimeError> {
        let host: Weak<Self> = Rc::downgrade(self);
        ctx.interval(interval, move || {
            if let Some(host) = host.upgrade() {
                host.pump();
            }
        })
    }

    /// Read pending output from every session and reap exited ones
    ///
    /// Returns the number of bytes read.
    pub fn pump(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        let mut outputs: Vec<(TerminalId, Vec<u8>)> = Vec::new();
        let mut exited: Vec<TerminalId> = Vec::new();
        let mut buf = [0u8; 4096];

        for (id, session) in inner.sessions.iter_mut() {
            if session.exited {
                continue;
            }

            if let Err(e) = session.flush_pending_write() {
                tracing::debug!(%id, error = %e, "flushing pending input failed");
            }

            let mut read_total = 0;
            let mut failed = false;
            while read_total < MAX_READ_PER_PUMP {
                match session.process.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        read_total += n;
                        outputs.push((id.clone(), buf[..n].to_vec()));
                    }
                    Err(e) => {
                        tracing::debug!(%id, error = %e, "read failed, treating session as exited");
                        failed = true;
                        break;
                    }
                }
            }

            if failed || (read_total == 0 && !session.process.is_running()) {
                session.exited = true;
                exited.push(id.clone());
            }
        }

        let mut total = 0;
        for (id, bytes) in outputs {
            total += bytes.len();
            self.record_output(&mut inner, &id, bytes);
        }

        for id in exited {
            tracing::info!(%id, "session exited");
            inner.broadcast(PtyEvent::Exited { id });
        }

        // Retry subscribers that stalled on a full channel
        let window = self.config.ack_window_bytes;
        for (id, session) in inner.sessions.iter_mut() {
            if session.subscriber.as_ref().is_some_and(|s| s.stalled) {
                session.deliver_pending(id, window);
            }
        }

        total
    }

    fn record_output(&self, inner: &mut HostInner, id: &TerminalId, bytes: Vec<u8>) -> Option<u64> {
        let session = inner.sessions.get_mut(id)?;
        let frame = session.push_frame(bytes, self.config.backlog_limit_bytes);
        let seq = frame.seq;
        session.deliver_pending(id, self.config.ack_window_bytes);

        inner.broadcast(PtyEvent::Output {
            id: id.clone(),
            frame,
        });
        Some(seq)
    }

    /// Feed `bytes` into a session as if its process had written them
    pub fn inject_output(&self, id: &TerminalId, bytes: &[u8]) -> Result<u64, TransportError> {
        let mut inner = self.inner.borrow_mut();
        self.record_output(&mut inner, id, bytes.to_vec())
            .ok_or_else(|| TransportError::UnknownTerminal(id.clone()))
    }

    pub fn session_ids(&self) -> Vec<TerminalId> {
        self.inner.borrow().sessions.keys().cloned().collect()
    }

    /// Seq of the newest frame of `id`
    pub fn head_seq(&self, id: &TerminalId) -> Option<u64> {
        self.inner.borrow().sessions.get(id).map(Session::head_seq)
    }

    pub fn has_exited(&self, id: &TerminalId) -> Option<bool> {
        self.inner.borrow().sessions.get(id).map(|s| s.exited)
    }

    /// Whether delivery to the sequenced subscriber of `id` is stalled
    pub fn is_stalled(&self, id: &TerminalId) -> bool {
        self.inner
            .borrow()
            .sessions
            .get(id)
            .and_then(|s| s.subscriber.as_ref())
            .is_some_and(|s| s.stalled)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }
}

#[async_trait(?Send)]
impl ProcessLayer for PtyHost {
    async fn spawn(&self, request: SpawnRequest) -> Result<SessionHandle, TransportError> {
        request
            .validate()
            .map_err(|e| TransportError::Spawn {
                id: request.id.clone(),
                reason: e.to_string(),
            })?;

        if self.inner.borrow().sessions.contains_key(&request.id) {
            return Err(TransportError::AlreadyExists(request.id));
        }

        let process = self.spawner.spawn(&request)?;
        let pid = process.pid();
        self.inner
            .borrow_mut()
            .sessions
            .insert(request.id.clone(), Session::new(process));

        tracing::info!(id = %request.id, ?pid, cwd = ?request.cwd, "session spawned");
        Ok(SessionHandle {
            id: request.id,
            pid,
        })
    }

    async fn write(&self, id: &TerminalId, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        let session = inner.session_mut(id)?;

        let io_err = |source| TransportError::Io {
            id: id.clone(),
            source,
        };
        session.flush_pending_write().map_err(io_err)?;
        if !session.pending_write.is_empty() {
            session.pending_write.extend_from_slice(data);
            return Ok(());
        }

        let written = session.process.write(data).map_err(io_err)?;
        if written < data.len() {
            session.pending_write.extend_from_slice(&data[written..]);
            tracing::debug!(
                %id,
                written,
                buffered = data.len() - written,
                "partial write, buffering remainder"
            );
        }
        Ok(())
    }

    async fn resize(&self, id: &TerminalId, rows: u16, cols: u16) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        let session = inner.session_mut(id)?;
        session
            .process
            .resize(cols, rows)
            .map_err(|source| TransportError::Io {
                id: id.clone(),
                source,
            })
    }

    async fn kill(&self, id: &TerminalId) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        let mut session = inner
            .sessions
            .remove(id)
            .ok_or_else(|| TransportError::UnknownTerminal(id.clone()))?;

        session.process.terminate();
        if !session.exited {
            inner.broadcast(PtyEvent::Exited { id: id.clone() });
        }
        tracing::info!(%id, "session killed");
        Ok(())
    }

    async fn backfill(&self, request: BackfillRequest) -> Result<Backfill, TransportError> {
        let mut inner = self.inner.borrow_mut();
        let session = inner.session_mut(&request.id)?;

        let from = request.from_seq.unwrap_or(0);
        let mut data = Vec::new();
        let mut start_seq = None;
        for frame in session.backlog.iter().filter(|f| f.seq > from) {
            start_seq.get_or_insert(frame.seq);
            data.extend_from_slice(&frame.bytes);
        }

        let seq = session.head_seq();
        Ok(Backfill {
            seq,
            start_seq: start_seq.unwrap_or(seq + 1),
            data,
        })
    }

    async fn subscribe(
        &self,
        id: &TerminalId,
        last_seen_seq: Option<u64>,
        frames: SyncSender<Frame>,
    ) -> Result<(SubscribeReply, HostSubscriptionId), TransportError> {
        let window = self.config.ack_window_bytes;
        let mut inner = self.inner.borrow_mut();
        inner.next_subscription += 1;
        let subscription = HostSubscriptionId(inner.next_subscription);

        let session = inner.session_mut(id)?;
        if session.subscriber.is_some() {
            tracing::debug!(%id, "replacing existing subscriber");
        }

        let head = session.head_seq();
        let (reply, delivered_seq) = match last_seen_seq.filter(|seq| *seq > 0) {
            None => {
                let bytes = session
                    .backlog
                    .iter()
                    .flat_map(|f| f.bytes.iter().copied())
                    .collect();
                (SubscribeReply::Snapshot { seq: head, bytes }, head)
            }
            Some(seen) => (SubscribeReply::DeltaReady { seq: head }, seen),
        };

        session.subscriber = Some(Subscriber {
            id: subscription,
            frames,
            delivered_seq,
            unacked_bytes: 0,
            stalled: false,
        });
        session.deliver_pending(id, window);

        tracing::debug!(%id, ?last_seen_seq, head, "subscribed");
        Ok((reply, subscription))
    }

    async fn unsubscribe(
        &self,
        id: &TerminalId,
        subscription: HostSubscriptionId,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(session) = inner.sessions.get_mut(id) {
            if session
                .subscriber
                .as_ref()
                .is_some_and(|s| s.id == subscription)
            {
                session.subscriber = None;
                tracing::debug!(%id, "unsubscribed");
            }
        }
        Ok(())
    }

    async fn ack(
        &self,
        id: &TerminalId,
        seq: u64,
        bytes_consumed: usize,
    ) -> Result<(), TransportError> {
        let window = self.config.ack_window_bytes;
        let mut inner = self.inner.borrow_mut();
        let session = inner.session_mut(id)?;
        let Some(sub) = session.subscriber.as_mut() else {
            return Ok(());
        };

        sub.unacked_bytes = sub.unacked_bytes.saturating_sub(bytes_consumed);
        let resume = sub.stalled;
        tracing::trace!(%id, seq, bytes_consumed, unacked = sub.unacked_bytes, "ack");
        if resume {
            session.deliver_pending(id, window);
        }
        Ok(())
    }

    fn add_event_listener(&self, listener: Sender<PtyEvent>) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        inner.next_listener += 1;
        let id = ListenerId(inner.next_listener);
        inner.listeners.push((id, listener));
        id
    }

    fn remove_event_listener(&self, listener: ListenerId) {
        self.inner
            .borrow_mut()
            .listeners
            .retain(|(id, _)| *id != listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calloop::channel;
    use calloop::EventLoop;
    use futures::executor::block_on;
    use std::path::PathBuf;

    #[derive(Default)]
    struct FakeState {
        output: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        running: bool,
        terminated: bool,
    }

    struct FakeProcess(Rc<RefCell<FakeState>>);

    impl ProcessIo for FakeProcess {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut state = self.0.borrow_mut();
            match state.output.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().written.extend_from_slice(data);
            Ok(data.len())
        }

        fn resize(&mut self, _cols: u16, _rows: u16) -> std::io::Result<()> {
            Ok(())
        }

        fn is_running(&mut self) -> bool {
            self.0.borrow().running
        }

        fn terminate(&mut self) {
            let mut state = self.0.borrow_mut();
            state.running = false;
            state.terminated = true;
        }

        fn pid(&self) -> Option<u32> {
            None
        }
    }

    struct FakeSpawner(Rc<RefCell<FakeState>>);

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, _request: &SpawnRequest) -> Result<Box<dyn ProcessIo>, TransportError> {
            self.0.borrow_mut().running = true;
            Ok(Box::new(FakeProcess(self.0.clone())))
        }
    }

    fn request(id: &str) -> SpawnRequest {
        SpawnRequest {
            id: id.into(),
            cwd: PathBuf::from("/"),
            rows: 24,
            cols: 80,
            env: HashMap::new(),
            command: None,
        }
    }

    fn host(backlog: usize, window: usize) -> (Rc<PtyHost>, Rc<RefCell<FakeState>>) {
        let state = Rc::new(RefCell::new(FakeState::default()));
        let host = PtyHost::new(
            Box::new(FakeSpawner(state.clone())),
            HostConfig {
                backlog_limit_bytes: backlog,
                ack_window_bytes: window,
            },
        );
        (host, state)
    }

    fn frame_sink(
        event_loop: &EventLoop<'static, ()>,
        capacity: usize,
    ) -> (SyncSender<Frame>, Rc<RefCell<Vec<Frame>>>) {
        let ctx = LoopContext::new(event_loop.handle()).unwrap();
        let (tx, rx) = channel::sync_channel(capacity);
        let frames = Rc::new(RefCell::new(Vec::new()));
        let sink = frames.clone();
        ctx.insert_channel(rx, move |frame| sink.borrow_mut().push(frame))
            .unwrap();
        (tx, frames)
    }

    fn spin(event_loop: &mut EventLoop<'static, ()>) {
        for _ in 0..3 {
            event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        }
    }

    #[test]
    fn pump_numbers_output_from_one() {
        let (host, state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();

        state.borrow_mut().output.push_back(b"hello".to_vec());
        state.borrow_mut().output.push_back(b" world".to_vec());
        assert_eq!(host.pump(), 11);

        assert_eq!(host.head_seq(&id), Some(2));
        let backfill = block_on(host.backfill(BackfillRequest {
            id: id.clone(),
            from_seq: None,
        }))
        .unwrap();
        assert_eq!(backfill.start_seq, 1);
        assert_eq!(backfill.seq, 2);
        assert_eq!(backfill.data, b"hello world");
    }

    #[test]
    fn backfill_from_seq_skips_seen_frames() {
        let (host, _state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();
        for chunk in ["one", "two", "three"] {
            host.inject_output(&id, chunk.as_bytes()).unwrap();
        }

        let backfill = block_on(host.backfill(BackfillRequest {
            id: id.clone(),
            from_seq: Some(1),
        }))
        .unwrap();
        assert_eq!(backfill.start_seq, 2);
        assert_eq!(backfill.data, b"twothree");

        let empty = block_on(host.backfill(BackfillRequest {
            id,
            from_seq: Some(3),
        }))
        .unwrap();
        assert!(empty.data.is_empty());
        assert_eq!(empty.start_seq, 4);
    }

    #[test]
    fn backlog_evicts_oldest_frames() {
        let (host, _state) = host(8, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();
        for chunk in ["aaaa", "bbbb", "cccc"] {
            host.inject_output(&id, chunk.as_bytes()).unwrap();
        }

        let backfill = block_on(host.backfill(BackfillRequest { id, from_seq: None })).unwrap();
        assert_eq!(backfill.start_seq, 2);
        assert_eq!(backfill.data, b"bbbbcccc");
    }

    #[test]
    fn initial_subscribe_returns_snapshot() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let (host, _state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();
        host.inject_output(&id, b"before").unwrap();

        let (tx, frames) = frame_sink(&event_loop, 16);
        let (reply, _sub) = block_on(host.subscribe(&id, None, tx)).unwrap();
        assert_eq!(
            reply,
            SubscribeReply::Snapshot {
                seq: 1,
                bytes: b"before".to_vec()
            }
        );

        host.inject_output(&id, b"after").unwrap();
        spin(&mut event_loop);
        let frames = frames.borrow();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 2);
    }

    #[test]
    fn resume_subscribe_streams_only_newer_frames() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let (host, _state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();
        for chunk in ["1", "2", "3"] {
            host.inject_output(&id, chunk.as_bytes()).unwrap();
        }

        let (tx, frames) = frame_sink(&event_loop, 16);
        let (reply, _sub) = block_on(host.subscribe(&id, Some(1), tx)).unwrap();
        assert_eq!(reply, SubscribeReply::DeltaReady { seq: 3 });

        spin(&mut event_loop);
        let seqs: Vec<u64> = frames.borrow().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn credit_window_stalls_until_ack() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let (host, _state) = host(1024, 4);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();
        let (tx, frames) = frame_sink(&event_loop, 16);
        block_on(host.subscribe(&id, None, tx)).unwrap();

        host.inject_output(&id, b"abcd").unwrap();
        host.inject_output(&id, b"efgh").unwrap();
        spin(&mut event_loop);
        assert_eq!(frames.borrow().len(), 1);
        assert!(host.is_stalled(&id));

        block_on(host.ack(&id, 1, 4)).unwrap();
        spin(&mut event_loop);
        assert_eq!(frames.borrow().len(), 2);
        assert!(!host.is_stalled(&id));
    }

    #[test]
    fn full_channel_stalls_and_recovers_on_pump() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let (host, _state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();
        let (tx, frames) = frame_sink(&event_loop, 1);
        block_on(host.subscribe(&id, None, tx)).unwrap();

        host.inject_output(&id, b"1").unwrap();
        host.inject_output(&id, b"2").unwrap();
        assert!(host.is_stalled(&id));

        spin(&mut event_loop);
        host.pump();
        spin(&mut event_loop);

        let seqs: Vec<u64> = frames.borrow().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn unsubscribe_ignores_stale_subscription() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let (host, _state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();

        let (tx1, _frames1) = frame_sink(&event_loop, 16);
        let (_, first) = block_on(host.subscribe(&id, None, tx1)).unwrap();
        let (tx2, frames2) = frame_sink(&event_loop, 16);
        let (_, _second) = block_on(host.subscribe(&id, None, tx2)).unwrap();

        block_on(host.unsubscribe(&id, first)).unwrap();
        host.inject_output(&id, b"x").unwrap();
        spin(&mut event_loop);
        assert_eq!(frames2.borrow().len(), 1);
    }

    #[test]
    fn listeners_receive_output_and_exit() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let ctx = LoopContext::new(event_loop.handle()).unwrap();
        let (host, state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();

        let (tx, rx) = channel::channel();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        ctx.insert_channel(rx, move |event| sink.borrow_mut().push(event))
            .unwrap();
        host.add_event_listener(tx);

        state.borrow_mut().output.push_back(b"out".to_vec());
        host.pump();
        state.borrow_mut().running = false;
        host.pump();
        spin(&mut event_loop);

        let events = events.borrow();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PtyEvent::Output { frame, .. } if frame.bytes == b"out"));
        assert_eq!(events[1], PtyEvent::Exited { id: id.clone() });
        assert_eq!(host.has_exited(&id), Some(true));
    }

    #[test]
    fn removed_listener_gets_nothing() {
        let (host, _state) = host(1024, 1024);
        let (tx, _rx) = channel::channel();
        let listener = host.add_event_listener(tx);
        assert_eq!(host.listener_count(), 1);

        host.remove_event_listener(listener);
        assert_eq!(host.listener_count(), 0);
    }

    #[test]
    fn write_reaches_process() {
        let (host, state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();

        block_on(host.write(&id, b"ls\n")).unwrap();
        assert_eq!(state.borrow().written, b"ls\n");
    }

    #[test]
    fn duplicate_spawn_is_rejected() {
        let (host, _state) = host(1024, 1024);
        block_on(host.spawn(request("a"))).unwrap();
        assert!(matches!(
            block_on(host.spawn(request("a"))),
            Err(TransportError::AlreadyExists(_))
        ));
    }

    #[test]
    fn kill_terminates_and_forgets_session() {
        let (host, state) = host(1024, 1024);
        let id = TerminalId::new("a");
        block_on(host.spawn(request("a"))).unwrap();

        block_on(host.kill(&id)).unwrap();
        assert!(state.borrow().terminated);
        assert!(host.session_ids().is_empty());
        assert!(matches!(
            block_on(host.kill(&id)),
            Err(TransportError::UnknownTerminal(_))
        ));
    }

    #[test]
    fn unknown_terminal_errors() {
        let (host, _state) = host(1024, 1024);
        let id = TerminalId::new("missing");
        assert!(block_on(host.write(&id, b"x")).is_err());
        assert!(host.inject_output(&id, b"x").is_err());
        assert!(block_on(host.backfill(BackfillRequest { id, from_seq: None })).is_err());
    }
}
