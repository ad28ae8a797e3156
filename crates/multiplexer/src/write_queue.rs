//! Bounded per-terminal write queue
//!
//! Sits between decoded output and the render buffer. Bursts are absorbed
//! here and written out in bounded chunks; when a burst outruns the render
//! buffer the oldest output is dropped and a single notice is injected per
//! overflow episode.
//!
//! `WriteQueue` is the pure state machine. `SharedWriteQueue` adds flush
//! scheduling on the event loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;

use crate::config::WriteQueueConfig;
use crate::decoder::{ceil_char_boundary, floor_char_boundary};
use crate::render::RenderError;
use crate::runtime::LoopContext;
use crate::wire::TerminalId;

/// Why a sink did not accept a chunk
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink declined the chunk without failing (e.g. the buffer is suspended)
    #[error("write rejected")]
    Rejected,

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Lets a sink declare how much of a chunk it consumed
///
/// A sink that never calls `consumed` is taken to have consumed the whole
/// chunk.
#[derive(Debug)]
pub struct ChunkReport {
    len: usize,
    consumed: Cell<Option<usize>>,
}

impl ChunkReport {
    fn new(len: usize) -> Self {
        Self {
            len,
            consumed: Cell::new(None),
        }
    }

    /// Record `n` more bytes as consumed (clamped to the chunk length)
    pub fn consumed(&self, n: usize) {
        let total = self.consumed.get().unwrap_or(0).saturating_add(n);
        self.consumed.set(Some(total.min(self.len)));
    }

    fn total(&self) -> usize {
        self.consumed.get().unwrap_or(self.len)
    }
}

/// Destination of flushed chunks
pub trait WriteSink {
    fn write_chunk(&self, chunk: &str, report: &ChunkReport) -> Result<(), SinkError>;
}

impl<F> WriteSink for F
where
    F: Fn(&str, &ChunkReport) -> Result<(), SinkError>,
{
    fn write_chunk(&self, chunk: &str, report: &ChunkReport) -> Result<(), SinkError> {
        self(chunk, report)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush now, within the caller's turn
    Immediate,
    /// Flush once at the end of the current loop turn, however often requested
    Coalesced,
}

/// Result of one physical flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written { bytes: usize },
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued_bytes: usize,
    pub dropped_bytes: u64,
    pub overflow_active: bool,
    pub queue_length: usize,
    /// Bytes of overflow notices injected, not part of process output
    pub notice_bytes: u64,
    /// Bytes ever passed to `enqueue`
    pub enqueued_bytes: u64,
}

/// What an `enqueue` call had to do to stay within bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub dropped: usize,
    pub notice_injected: bool,
}

#[derive(Debug)]
struct Chunk {
    text: String,
    /// Overflow notices are never dropped by the overflow policy
    notice: bool,
}

/// Pending output of one terminal
#[derive(Debug)]
pub struct WriteQueue {
    config: WriteQueueConfig,
    pending_chunks: VecDeque<Chunk>,
    queued_bytes: usize,
    dropped_bytes: u64,
    overflow_active: bool,
    pending_flush_scheduled: bool,
    reported_bytes: u64,
    notice_bytes: u64,
    enqueued_bytes: u64,
}

impl WriteQueue {
    pub fn new(config: WriteQueueConfig) -> Self {
        Self {
            config,
            pending_chunks: VecDeque::new(),
            queued_bytes: 0,
            dropped_bytes: 0,
            overflow_active: false,
            pending_flush_scheduled: false,
            reported_bytes: 0,
            notice_bytes: 0,
            enqueued_bytes: 0,
        }
    }

    /// Append `data`, dropping the oldest output if the queue overflows
    pub fn enqueue(&mut self, data: &str) -> EnqueueOutcome {
        if data.is_empty() {
            return EnqueueOutcome::default();
        }

        self.enqueued_bytes += data.len() as u64;
        self.queued_bytes += data.len();
        self.pending_chunks.push_back(Chunk {
            text: data.to_string(),
            notice: false,
        });

        if self.queued_bytes <= self.config.max_queue_bytes {
            return EnqueueOutcome::default();
        }

        let dropped = self.drop_oldest();
        self.dropped_bytes += dropped as u64;

        let mut outcome = EnqueueOutcome {
            dropped,
            notice_injected: false,
        };
        if !self.overflow_active {
            self.overflow_active = true;
            let kb = dropped.div_ceil(1024);
            let notice = self.config.overflow_notice.replace("{kb}", &kb.to_string());
            if !notice.is_empty() {
                self.notice_bytes += notice.len() as u64;
                self.queued_bytes += notice.len();
                self.pending_chunks.push_back(Chunk {
                    text: notice,
                    notice: true,
                });
                outcome.notice_injected = true;
            }
        }
        outcome
    }

    /// Drop from the front until at most `target_after_drop` bytes remain
    ///
    /// Older chunks go first. The newest chunk only loses its head and
    /// always keeps its last character.
    fn drop_oldest(&mut self) -> usize {
        let target = self.config.target_after_drop;
        let mut dropped = 0;
        let mut idx = 0;

        while self.queued_bytes > target && idx < self.pending_chunks.len() {
            let newest = idx + 1 == self.pending_chunks.len();
            let excess = self.queued_bytes - target;
            let chunk = &mut self.pending_chunks[idx];

            if chunk.notice {
                idx += 1;
                continue;
            }

            if !newest && chunk.text.len() <= excess {
                let len = chunk.text.len();
                self.pending_chunks.remove(idx);
                self.queued_bytes -= len;
                dropped += len;
                continue;
            }

            let mut cut = ceil_char_boundary(&chunk.text, excess);
            if newest && cut >= chunk.text.len() {
                cut = floor_char_boundary(&chunk.text, chunk.text.len().saturating_sub(1));
            }
            if cut > 0 {
                chunk.text.drain(..cut);
                self.queued_bytes -= cut;
                dropped += cut;
            }
            if chunk.text.is_empty() {
                self.pending_chunks.remove(idx);
            } else {
                idx += 1;
            }
        }

        dropped
    }

    /// Dequeue up to `max_write_chunk` bytes, split on a char boundary
    ///
    /// Always makes progress: a single character larger than the chunk limit
    /// is returned whole.
    pub fn take_chunk(&mut self) -> Option<String> {
        let pieces = self.take_pieces();
        if pieces.is_empty() {
            None
        } else {
            Some(join(&pieces))
        }
    }

    /// Like `take_chunk`, keeping the pieces apart so a refused write can
    /// be requeued with its notices intact
    fn take_pieces(&mut self) -> Vec<Chunk> {
        let max = self.config.max_write_chunk.max(1);
        let mut taken = 0;
        let mut pieces = Vec::new();

        while let Some(mut next) = self.pending_chunks.pop_front() {
            let room = max - taken;
            if next.text.len() <= room {
                self.queued_bytes -= next.text.len();
                taken += next.text.len();
                pieces.push(next);
                if taken == max {
                    break;
                }
                continue;
            }

            let mut split = floor_char_boundary(&next.text, room);
            if split == 0 && taken == 0 {
                split = ceil_char_boundary(&next.text, 1);
            }
            if split > 0 {
                let rest = next.text.split_off(split);
                self.queued_bytes -= next.text.len();
                taken += next.text.len();
                pieces.push(Chunk {
                    text: std::mem::replace(&mut next.text, rest),
                    notice: next.notice,
                });
            }
            if !next.text.is_empty() {
                self.pending_chunks.push_front(next);
            }
            break;
        }

        pieces
    }

    /// Account for a chunk the sink accepted
    fn commit(&mut self, consumed: usize) {
        self.reported_bytes += consumed as u64;
        if self.overflow_active && self.queued_bytes <= self.config.low_water_mark {
            self.overflow_active = false;
        }
    }

    /// Put the pieces of a refused write back at the front
    fn requeue(&mut self, pieces: Vec<Chunk>) {
        for piece in pieces.into_iter().rev() {
            self.queued_bytes += piece.text.len();
            self.pending_chunks.push_front(piece);
        }
    }

    /// One physical flush through `sink`
    pub fn flush(&mut self, sink: &dyn WriteSink) -> FlushOutcome {
        let pieces = self.take_pieces();
        if pieces.is_empty() {
            return FlushOutcome::Empty;
        }
        let chunk = join(&pieces);
        let report = ChunkReport::new(chunk.len());
        match sink.write_chunk(&chunk, &report) {
            Ok(()) => {
                self.commit(report.total());
                FlushOutcome::Written { bytes: chunk.len() }
            }
            Err(_) => {
                self.requeue(pieces);
                FlushOutcome::Failed
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending_chunks.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued_bytes: self.queued_bytes,
            dropped_bytes: self.dropped_bytes,
            overflow_active: self.overflow_active,
            queue_length: self.pending_chunks.len(),
            notice_bytes: self.notice_bytes,
            enqueued_bytes: self.enqueued_bytes,
        }
    }

    /// Bytes reported written since the last call
    pub fn drain_reported_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.reported_bytes)
    }

    /// Clear pending data and every counter
    pub fn reset(&mut self) {
        self.pending_chunks.clear();
        self.queued_bytes = 0;
        self.dropped_bytes = 0;
        self.overflow_active = false;
        self.pending_flush_scheduled = false;
        self.reported_bytes = 0;
        self.notice_bytes = 0;
        self.enqueued_bytes = 0;
    }
}

/// A write queue with flush scheduling on the event loop
#[derive(Clone)]
pub struct SharedWriteQueue {
    id: TerminalId,
    inner: Rc<RefCell<WriteQueue>>,
    ctx: LoopContext,
}

impl SharedWriteQueue {
    pub fn new(id: TerminalId, config: WriteQueueConfig, ctx: LoopContext) -> Self {
        Self {
            id,
            inner: Rc::new(RefCell::new(WriteQueue::new(config))),
            ctx,
        }
    }

    pub fn enqueue(&self, data: &str) {
        let outcome = self.inner.borrow_mut().enqueue(data);
        if outcome.dropped > 0 {
            let stats = self.stats();
            if outcome.notice_injected {
                tracing::warn!(
                    id = %self.id,
                    dropped = outcome.dropped,
                    queued = stats.queued_bytes,
                    "write queue overflow, dropping oldest output"
                );
            } else {
                tracing::debug!(
                    id = %self.id,
                    dropped = outcome.dropped,
                    total_dropped = stats.dropped_bytes,
                    "write queue still overflowing"
                );
            }
        }
    }

    /// Flush through `sink`, now or coalesced to the end of the turn
    ///
    /// A coalesced flush that succeeds with data left over schedules the
    /// next one; a failed flush waits for the next request.
    pub fn flush_pending(&self, sink: Rc<dyn WriteSink>, mode: FlushMode) {
        match mode {
            FlushMode::Immediate => {
                if let FlushOutcome::Written { .. } = self.flush_now(&*sink) {
                    if !self.is_empty() {
                        self.flush_pending(sink, FlushMode::Coalesced);
                    }
                }
            }
            FlushMode::Coalesced => {
                {
                    let mut queue = self.inner.borrow_mut();
                    if queue.pending_flush_scheduled {
                        return;
                    }
                    queue.pending_flush_scheduled = true;
                }

                let this = self.clone();
                self.ctx.defer(move || {
                    this.inner.borrow_mut().pending_flush_scheduled = false;
                    if let FlushOutcome::Written { .. } = this.flush_now(&*sink) {
                        if !this.is_empty() {
                            this.flush_pending(sink, FlushMode::Coalesced);
                        }
                    }
                });
            }
        }
    }

    /// One physical flush; the queue is not borrowed while `sink` runs
    pub fn flush_now(&self, sink: &dyn WriteSink) -> FlushOutcome {
        let pieces = self.inner.borrow_mut().take_pieces();
        if pieces.is_empty() {
            return FlushOutcome::Empty;
        }

        let chunk = join(&pieces);
        let report = ChunkReport::new(chunk.len());
        let result = sink.write_chunk(&chunk, &report);

        let mut queue = self.inner.borrow_mut();
        match result {
            Ok(()) => {
                queue.commit(report.total());
                tracing::trace!(id = %self.id, bytes = chunk.len(), queued = queue.queued_bytes, "flushed chunk");
                FlushOutcome::Written { bytes: chunk.len() }
            }
            Err(SinkError::Rejected) => {
                tracing::trace!(id = %self.id, bytes = chunk.len(), "chunk rejected, requeued");
                queue.requeue(pieces);
                FlushOutcome::Failed
            }
            Err(e) => {
                tracing::debug!(id = %self.id, bytes = chunk.len(), error = %e, "flush failed, requeued");
                queue.requeue(pieces);
                FlushOutcome::Failed
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.borrow().stats()
    }

    pub fn drain_reported_bytes(&self) -> u64 {
        self.inner.borrow_mut().drain_reported_bytes()
    }

    pub fn reset(&self) {
        self.inner.borrow_mut().reset();
    }
}

fn join(pieces: &[Chunk]) -> String {
    pieces.iter().map(|p| p.text.as_str()).collect()
}
