//! The I/O-thread backend: blocks on an io_uring completion queue.
//!
//! Handlers register for a completion key ([`IoToken`]); submissions carry
//! the key as their user_data and the pump routes each completion record to
//! its handler. A reserved key marks the pump's own loopback wakeup, which
//! is consumed internally instead of dispatched.

use super::ring::{CompletionRing, DEFAULT_RING_ENTRIES};
use super::waker::{FdWaker, PumpWaker};
use super::{Delegate, PumpCore};
use crate::observer::ObserverList;
use anyhow::{Context as _, Result};
use io_uring::opcode::PollAdd;
use io_uring::squeue;
use io_uring::types::Fd;
use slab::Slab;
use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Completion key handed out by [`IoPump::register_io_handler`]; tag every
/// submission belonging to that handler with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(usize);

/// user_data reserved for the pump's own wakeup poll. Slab keys are small
/// indices and can never collide with it.
const WAKE_USER_DATA: u64 = u64::MAX;

/// Receiver side of asynchronous completions.
///
/// `error` is the raw OS errno of a failed operation, `0` on success;
/// `bytes_transferred` is the non-negative result of a successful one.
pub trait IoHandler {
    fn on_io_completed(&self, token: IoToken, bytes_transferred: u32, error: i32);
}

/// Bracket notifications around each dispatched completion.
pub trait IoObserver {
    fn will_process_io_event(&self);
    fn did_process_io_event(&self);
}

#[derive(thiserror::Error, Debug)]
pub enum IoPumpError {
    #[error("submission queue is full")]
    RingFull(#[from] squeue::PushError),

    #[error("no handler registered for token {0:?}")]
    UnknownToken(IoToken),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One retrieved completion record.
#[derive(Debug, Clone, Copy)]
struct IoItem {
    key: u64,
    bytes_transferred: u32,
    error: i32,
}

struct Registration {
    handler: Weak<dyn IoHandler>,
}

pub(crate) struct IoPump {
    core: PumpCore,
    ring: RefCell<CompletionRing>,
    waker: Arc<FdWaker>,
    handlers: RefCell<Slab<Registration>>,
    /// Completions parked while a caller drained a specific handler.
    /// Almost always empty.
    completed_io: RefCell<Vec<IoItem>>,
    io_observers: ObserverList<dyn IoObserver>,
}

impl IoPump {
    pub(crate) fn try_new() -> Result<Self> {
        let ring = CompletionRing::try_new(DEFAULT_RING_ENTRIES)?;
        let waker = Arc::new(FdWaker::new().context("failed to create wakeup eventfd")?);
        let pump = Self {
            core: PumpCore::new(),
            ring: RefCell::new(ring),
            waker,
            handlers: RefCell::new(Slab::new()),
            completed_io: RefCell::new(Vec::new()),
            io_observers: ObserverList::new(),
        };
        pump.arm_wakeup().context("failed to arm wakeup poll")?;
        Ok(pump)
    }

    pub(crate) fn core(&self) -> &PumpCore {
        &self.core
    }

    pub(crate) fn waker(&self) -> Arc<dyn PumpWaker> {
        self.waker.clone()
    }

    /// Keep a one-shot poll armed on the wakeup eventfd so a cross-thread
    /// `ScheduleWork` surfaces as a completion record.
    fn arm_wakeup(&self) -> Result<()> {
        let entry = PollAdd::new(Fd(self.waker.as_raw_fd()), libc::POLLIN as u32)
            .build()
            .user_data(WAKE_USER_DATA);
        let mut ring = self.ring.borrow_mut();
        if ring.push(&entry).is_err() {
            // Submission queue full: flush it and retry once.
            ring.submit()?;
            ring.push(&entry)
                .map_err(|e| anyhow::anyhow!("submission queue still full: {e}"))?;
        }
        ring.submit()?;
        Ok(())
    }

    pub(crate) fn register_io_handler(&self, handler: &Rc<dyn IoHandler>) -> IoToken {
        IoToken(self.handlers.borrow_mut().insert(Registration {
            handler: Rc::downgrade(handler),
        }))
    }

    pub(crate) fn deregister_io_handler(&self, token: IoToken) {
        let _ = self.handlers.borrow_mut().try_remove(token.0);
    }

    /// Submit one operation on behalf of a registered handler. The entry's
    /// user_data is overwritten with the handler's completion key.
    pub(crate) fn submit_io(
        &self,
        entry: squeue::Entry,
        token: IoToken,
    ) -> Result<(), IoPumpError> {
        if !self.handlers.borrow().contains(token.0) {
            return Err(IoPumpError::UnknownToken(token));
        }
        let entry = entry.user_data(token.0 as u64);
        let mut ring = self.ring.borrow_mut();
        if let Err(first) = ring.push(&entry) {
            ring.submit()?;
            ring.push(&entry).map_err(|_| IoPumpError::RingFull(first))?;
        }
        ring.submit()?;
        Ok(())
    }

    pub(crate) fn add_io_observer(&self, observer: &Rc<dyn IoObserver>) {
        self.io_observers.add_observer(observer);
    }

    pub(crate) fn remove_io_observer(&self, observer: &Rc<dyn IoObserver>) {
        self.io_observers.remove_observer(observer);
    }

    pub(crate) fn run(&self, delegate: &dyn Delegate) {
        let _frame = self.core.enter();
        loop {
            let mut more_work = delegate.do_work();
            if self.core.should_quit() {
                break;
            }

            more_work |= self.wait_for_io_completion(Some(Duration::ZERO), None);
            if self.core.should_quit() {
                break;
            }

            let mut next_delay = self.core.delayed_work_time();
            more_work |= delegate.do_delay_work(&mut next_delay);
            self.core.set_delayed_work_time(next_delay);
            if self.core.should_quit() {
                break;
            }
            if more_work {
                continue;
            }

            more_work = delegate.do_idle_work();
            if self.core.should_quit() {
                break;
            }
            if more_work {
                continue;
            }

            self.wait_for_work();
        }
    }

    fn wait_for_work(&self) {
        debug_assert_eq!(
            self.core.run_depth(),
            1,
            "a nested activation must not block in the completion wait"
        );
        self.wait_for_io_completion(self.core.current_delay(), None);
    }

    /// Retrieve and dispatch one completion record, blocking up to `timeout`
    /// (unbounded when `None`). With a `filter`, records belonging to other
    /// handlers are parked in the side buffer instead of dispatched, so a
    /// caller can synchronously drain exactly one handler's completions
    /// without losing anyone else's. Returns whether a record was consumed.
    pub(crate) fn wait_for_io_completion(
        &self,
        timeout: Option<Duration>,
        filter: Option<IoToken>,
    ) -> bool {
        let item = match self.match_completed_io(filter) {
            Some(item) => item,
            None => {
                // Bind the wait result first so the ring borrow is released
                // before the wakeup branch re-arms through it.
                let waited = self.ring.borrow_mut().wait_one(timeout);
                let cqe = match waited {
                    Ok(Some(cqe)) => cqe,
                    Ok(None) => return false,
                    Err(e) => {
                        // A failed wait is "no work, try again"; creation-time
                        // failures are the only fatal ones.
                        warn!("completion wait failed: {e}");
                        return false;
                    }
                };
                if cqe.user_data() == WAKE_USER_DATA {
                    self.waker.clear();
                    if let Err(e) = self.arm_wakeup() {
                        warn!("failed to re-arm wakeup poll: {e}");
                    }
                    return true;
                }
                let result = cqe.result();
                IoItem {
                    key: cqe.user_data(),
                    bytes_transferred: if result < 0 { 0 } else { result as u32 },
                    error: if result < 0 { -result } else { 0 },
                }
            }
        };

        if let Some(filter) = filter
            && item.key != filter.0 as u64
        {
            self.completed_io.borrow_mut().push(item);
            return true;
        }

        self.dispatch_io_item(item);
        true
    }

    fn match_completed_io(&self, filter: Option<IoToken>) -> Option<IoItem> {
        let mut completed = self.completed_io.borrow_mut();
        let position = match filter {
            None if completed.is_empty() => return None,
            None => 0,
            Some(filter) => completed
                .iter()
                .position(|item| item.key == filter.0 as u64)?,
        };
        Some(completed.remove(position))
    }

    fn dispatch_io_item(&self, item: IoItem) {
        let token = IoToken(item.key as usize);
        let handler = self
            .handlers
            .borrow()
            .get(token.0)
            .and_then(|registration| registration.handler.upgrade());
        let Some(handler) = handler else {
            // The handler was dropped with a completion still in flight;
            // discard the record and the stale registration.
            self.deregister_io_handler(token);
            return;
        };

        self.io_observers.for_each(|o| o.will_process_io_event());
        handler.on_io_completed(token, item.bytes_transferred, item.error);
        self.io_observers.for_each(|o| o.did_process_io_event());
    }
}
