//! Thread-safe wake capabilities backing `ScheduleWork`.
//!
//! Posting a task may happen from any thread, so waking a pump must not
//! touch pump internals. Each backend exports one of these, and the loop's
//! incoming queue holds it as an `Arc<dyn PumpWaker>`.

use super::os::WakeFd;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub(crate) trait PumpWaker: Send + Sync {
    fn wake(&self);
}

/// Auto-reset binary event: the wait consumes the signal, and signals posted
/// before anyone observed them coalesce into one.
pub(crate) struct EventWaker {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl EventWaker {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Wait up to `timeout`; consumes the signal if one arrived in time.
    pub(crate) fn wait_timeout(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        *signaled = false;
    }
}

impl PumpWaker for EventWaker {
    fn wake(&self) {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            *signaled = true;
            self.condvar.notify_one();
        }
    }
}

/// Eventfd-backed waker for pumps that block in the kernel. The atomic flag
/// coalesces bursts of wakeups into a single pending signal; the owning
/// thread clears both together once it observes the wake.
pub(crate) struct FdWaker {
    fd: WakeFd,
    pending: AtomicBool,
}

impl FdWaker {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            fd: WakeFd::new()?,
            pending: AtomicBool::new(false),
        })
    }

    /// Acknowledge a wakeup. Drain strictly before lowering the flag: a
    /// wake landing in between sees the flag still raised and skips its
    /// write, which is safe because the caller is awake and about to scan
    /// for work — whereas the reverse order could eat a signal raised after
    /// the flag went down and strand the next sleep.
    pub(crate) fn clear(&self) {
        self.fd.drain();
        self.pending.store(false, Ordering::Release);
    }
}

impl AsRawFd for FdWaker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl PumpWaker for FdWaker {
    fn wake(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.fd.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::os::poll_readable;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn event_waker_wakes_a_blocked_waiter() {
        let waker = Arc::new(EventWaker::new());
        let remote = waker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.wake();
        });

        let start = Instant::now();
        waker.wait();
        assert!(Instant::now() - start >= Duration::from_millis(10));
        handle.join().unwrap();
    }

    #[test]
    fn event_waker_timeout_elapses_without_signal() {
        let waker = EventWaker::new();
        let start = Instant::now();
        waker.wait_timeout(Duration::from_millis(30));
        assert!(Instant::now() - start >= Duration::from_millis(30));
    }

    #[test]
    fn event_waker_signal_is_consumed_by_one_wait() {
        let waker = EventWaker::new();
        waker.wake();
        waker.wake();
        waker.wait();

        // The signal was consumed; a second wait would block, which the
        // timeout variant demonstrates cheaply.
        let start = Instant::now();
        waker.wait_timeout(Duration::from_millis(20));
        assert!(Instant::now() - start >= Duration::from_millis(20));
    }

    #[test]
    fn fd_waker_coalesces_until_cleared() {
        let waker = FdWaker::new().unwrap();
        waker.wake();
        waker.wake();

        let ready = poll_readable(&[waker.as_raw_fd()], Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, [true]);

        waker.clear();
        let ready = poll_readable(&[waker.as_raw_fd()], Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, [false]);

        // Cleared flag re-opens the fast path.
        waker.wake();
        let ready = poll_readable(&[waker.as_raw_fd()], Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, [true]);
        waker.clear();
    }
}
