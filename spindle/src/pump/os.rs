//! Thin wrappers over the handful of fd syscalls the pumps block on.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// An eventfd used as a coalescing wake signal: writers bump the counter,
/// the owning thread drains it in one read.
pub(crate) struct WakeFd {
    fd: OwnedFd,
}

impl WakeFd {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall, no pointers involved.
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: we exclusively own the fd we just created.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub(crate) fn signal(&self) {
        let value: u64 = 1;
        // A saturated counter (EAGAIN) already guarantees the reader wakes.
        // Safety: the buffer outlives the call and is 8 bytes as required.
        let _ = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&raw const value).cast(),
                size_of::<u64>(),
            )
        };
    }

    pub(crate) fn drain(&self) {
        let mut value: u64 = 0;
        // EAGAIN just means nobody signalled since the last drain.
        // Safety: the buffer outlives the call and is 8 bytes as required.
        let _ = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&raw mut value).cast(),
                size_of::<u64>(),
            )
        };
    }
}

impl AsRawFd for WakeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A one-shot monotonic timerfd.
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall, no pointers involved.
        let raw = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: we exclusively own the fd we just created.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Arm the timer to fire once after `delay`. A zero delay is rounded up
    /// to the shortest representable interval, since an all-zero setting
    /// would disarm instead.
    pub(crate) fn arm(&self, delay: Duration) {
        let mut value = timespec(delay);
        if value.tv_sec == 0 && value.tv_nsec == 0 {
            value.tv_nsec = 1;
        }
        self.settime(value);
    }

    pub(crate) fn disarm(&self) {
        self.settime(libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        });
    }

    /// Consume an expiration so the fd stops polling readable.
    pub(crate) fn clear(&self) {
        let mut expirations: u64 = 0;
        // Safety: the buffer outlives the call and is 8 bytes as required.
        let _ = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&raw mut expirations).cast(),
                size_of::<u64>(),
            )
        };
    }

    fn settime(&self, value: libc::timespec) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        // Safety: `spec` outlives the call; a null old_value is allowed.
        let rc = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        debug_assert_eq!(rc, 0, "timerfd_settime: {}", io::Error::last_os_error());
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

/// Block until one of `fds` is readable or `timeout` elapses (`None` waits
/// unbounded). Returns per-fd readability; an interrupted wait reads as
/// nothing ready.
pub(crate) fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    // Safety: the pollfd slice is valid for the duration of the call.
    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            poll_timeout_ms(timeout),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0)
        .collect())
}

/// Millisecond timeout for poll(2), rounded up so we never wake before a
/// deadline and then spin on a sub-millisecond remainder.
fn poll_timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let mut ms = duration.as_millis();
            if duration.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wake_fd_signals_and_drains() {
        let wake = WakeFd::new().unwrap();
        let fds = [wake.as_raw_fd()];

        let ready = poll_readable(&fds, Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, [false]);

        wake.signal();
        wake.signal();
        let ready = poll_readable(&fds, Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, [true]);

        // Coalesced: one drain clears every signal so far.
        wake.drain();
        let ready = poll_readable(&fds, Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, [false]);
    }

    #[test]
    fn timer_fd_fires_after_the_delay() {
        let timer = TimerFd::new().unwrap();
        let fds = [timer.as_raw_fd()];

        timer.arm(Duration::from_millis(20));
        let start = Instant::now();
        let ready = poll_readable(&fds, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready, [true]);
        assert!(Instant::now() - start >= Duration::from_millis(20));

        timer.clear();
        let ready = poll_readable(&fds, Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, [false]);
    }

    #[test]
    fn disarmed_timer_stays_quiet() {
        let timer = TimerFd::new().unwrap();
        timer.arm(Duration::from_millis(10));
        timer.disarm();

        let ready =
            poll_readable(&[timer.as_raw_fd()], Some(Duration::from_millis(40))).unwrap();
        assert_eq!(ready, [false]);
    }

    #[test]
    fn poll_timeout_rounds_up() {
        assert_eq!(poll_timeout_ms(None), -1);
        assert_eq!(poll_timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(poll_timeout_ms(Some(Duration::from_micros(100))), 1);
        assert_eq!(poll_timeout_ms(Some(Duration::from_millis(7))), 7);
    }
}
