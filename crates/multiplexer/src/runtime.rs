//! Event-loop plumbing shared by the services
//!
//! Everything runs on a single calloop `EventLoop<'static, ()>`. `LoopContext`
//! bundles the loop handle with a future scheduler so services can defer work
//! to the end of the current dispatch, spawn futures, arm cancelable timers,
//! and attach channels.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use calloop::channel::{self, Channel};
use calloop::futures::Scheduler;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, RegistrationToken};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to create executor: {0}")]
    Executor(#[from] std::io::Error),

    #[error("failed to register event source: {0}")]
    Insert(#[from] calloop::Error),
}

/// Handle on the event loop and its future executor
#[derive(Clone)]
pub struct LoopContext {
    handle: LoopHandle<'static, ()>,
    scheduler: Scheduler<()>,
}

/// A timer armed through `LoopContext::timer`
///
/// Canceling a timer that already fired is a no-op.
pub struct TimerHandle {
    token: RegistrationToken,
    fired: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn has_fired(&self) -> bool {
        self.fired.get()
    }
}

impl LoopContext {
    /// Attach a future executor to the loop behind `handle`
    pub fn new(handle: LoopHandle<'static, ()>) -> Result<Self, RuntimeError> {
        let (executor, scheduler) = calloop::futures::executor::<()>()?;
        handle
            .insert_source(executor, |(), _, _| {})
            .map_err(|e| RuntimeError::Insert(e.error))?;

        Ok(Self { handle, scheduler })
    }

    pub fn handle(&self) -> &LoopHandle<'static, ()> {
        &self.handle
    }

    /// Run `f` once the current dispatch has processed its events
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.handle.insert_idle(move |_| f());
    }

    /// Drive `fut` to completion on the loop
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        if self.scheduler.schedule(fut).is_err() {
            tracing::warn!("executor is gone, dropping spawned future");
        }
    }

    /// Run `f` once after `after`
    pub fn timer(
        &self,
        after: Duration,
        f: impl FnOnce() + 'static,
    ) -> Result<TimerHandle, RuntimeError> {
        let fired = Rc::new(Cell::new(false));
        let fired_flag = fired.clone();
        let mut f = Some(f);

        let token = self
            .handle
            .insert_source(Timer::from_duration(after), move |_, _, _| {
                fired_flag.set(true);
                if let Some(f) = f.take() {
                    f();
                }
                TimeoutAction::Drop
            })
            .map_err(|e| RuntimeError::Insert(e.error))?;

        Ok(TimerHandle { token, fired })
    }

    /// Run `f` every `interval` until the returned token is removed
    pub fn interval(
        &self,
        interval: Duration,
        mut f: impl FnMut() + 'static,
    ) -> Result<RegistrationToken, RuntimeError> {
        self.handle
            .insert_source(Timer::from_duration(interval), move |_, _, _| {
                f();
                TimeoutAction::ToDuration(interval)
            })
            .map_err(|e| RuntimeError::Insert(e.error))
    }

    pub fn cancel_timer(&self, timer: TimerHandle) {
        if !timer.fired.get() {
            self.handle.remove(timer.token);
        }
    }

    /// Deliver every message sent on `channel` to `f`, in order
    pub fn insert_channel<T: 'static>(
        &self,
        channel: Channel<T>,
        mut f: impl FnMut(T) + 'static,
    ) -> Result<RegistrationToken, RuntimeError> {
        self.handle
            .insert_source(channel, move |event, _, _| {
                if let channel::Event::Msg(msg) = event {
                    f(msg);
                }
            })
            .map_err(|e| RuntimeError::Insert(e.error))
    }

    pub fn remove(&self, token: RegistrationToken) {
        self.handle.remove(token);
    }
}

/// Yield once to the event loop
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
