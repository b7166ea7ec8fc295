//! Helpers shared by the test suites.

use crate::pump::os::WakeFd;
use crate::pump::{NativeEvent, NativeSource};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// A unidirectional OS pipe with both ends owned.
pub(crate) struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    pub(crate) fn new() -> Self {
        let mut fds = [0; 2];
        // Safety: the fd array outlives the call.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe: {}", std::io::Error::last_os_error());
        // Safety: we exclusively own both fds we just created.
        unsafe {
            Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        }
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub(crate) fn write(&self, bytes: &[u8]) {
        // Safety: the buffer outlives the call.
        let written =
            unsafe { libc::write(self.write.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(written, bytes.len() as isize);
    }
}

/// In-process stand-in for a host native event queue: an eventfd provides
/// the readable-fd contract and a deque holds the events.
pub(crate) struct MockNativeSource {
    fd: WakeFd,
    events: Mutex<VecDeque<NativeEvent>>,
    dispatched: Mutex<Vec<NativeEvent>>,
}

impl MockNativeSource {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self {
            fd: WakeFd::new().unwrap(),
            events: Mutex::new(VecDeque::new()),
            dispatched: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn push_event(&self, event: NativeEvent) {
        self.events.lock().push_back(event);
        self.fd.signal();
    }

    /// Events routed through default dispatch, in order.
    pub(crate) fn dispatched(&self) -> Vec<NativeEvent> {
        self.dispatched.lock().clone()
    }
}

/// The [`NativeSource`] face of a shared mock.
pub(crate) struct SourceHandle(pub(crate) Arc<MockNativeSource>);

impl NativeSource for SourceHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }

    fn next_event(&self) -> Option<NativeEvent> {
        let mut events = self.0.events.lock();
        let event = events.pop_front();
        if events.is_empty() {
            self.0.fd.drain();
        }
        event
    }

    fn dispatch(&self, event: &NativeEvent) {
        self.0.dispatched.lock().push(*event);
    }
}
