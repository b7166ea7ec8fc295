//! io_uring wrapped as a completion port: submissions go in tagged with a
//! completion key, and the owner retrieves one completion record at a time.

use anyhow::{Context as _, Result};
use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{IoUring, cqueue, squeue};
use std::io;
use std::time::Duration;

pub(crate) const DEFAULT_RING_ENTRIES: u32 = 64;

pub(crate) struct CompletionRing {
    ring: IoUring,
}

impl CompletionRing {
    pub(crate) fn try_new(entries: u32) -> Result<Self> {
        let ring = IoUring::builder()
            // Submissions only ever come from the owning thread.
            .setup_single_issuer()
            .setup_coop_taskrun()
            .build(entries)
            .context("failed to create io_uring instance")?;
        Ok(Self { ring })
    }

    pub(crate) fn push(&mut self, entry: &squeue::Entry) -> Result<(), squeue::PushError> {
        let mut sq = self.ring.submission();
        // Safety: callers keep every buffer referenced by `entry` alive until
        // its completion is reaped; that is the submission contract.
        let pushed = unsafe { sq.push(entry) };
        sq.sync();
        pushed
    }

    /// Flush pending submissions without waiting for completions.
    pub(crate) fn submit(&mut self) -> io::Result<usize> {
        self.ring.submit()
    }

    /// Retrieve one completion record, blocking up to `timeout` (unbounded
    /// when `None`). A timed-out or interrupted wait yields `None`.
    pub(crate) fn wait_one(
        &mut self,
        timeout: Option<Duration>,
    ) -> io::Result<Option<cqueue::Entry>> {
        if let Some(cqe) = self.pop() {
            return Ok(Some(cqe));
        }

        let waited = match timeout {
            Some(duration) => {
                let ts = Timespec::from(duration);
                let args = SubmitArgs::new().timespec(&ts);
                match self.ring.submitter().submit_with_args(1, &args) {
                    // Timing out is how the shutdown and delayed-work paths
                    // regain control; it is not an error.
                    Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(0),
                    other => other,
                }
            }
            None => self.ring.submitter().submit_and_wait(1),
        };

        match waited {
            Ok(_) => Ok(self.pop()),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn pop(&mut self) -> Option<cqueue::Entry> {
        let mut cq = self.ring.completion();
        cq.sync();
        cq.next()
    }
}
