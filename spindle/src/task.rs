use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A unit of deferred work.
///
/// Implemented for free by every `FnOnce() + Send` closure, which is the
/// normal way to build one. Running consumes the task; there is no result
/// channel through this interface, only side effects.
pub trait Task: Send {
    fn run(self: Box<Self>);
}

impl<F> Task for F
where
    F: FnOnce() + Send,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// A task that can be neutralized after it has been posted.
///
/// Cancellation is cooperative: the queued task stays where it is, but once
/// cancelled its `run` drops the payload without invoking it. The flag is
/// shared, so the [`CancelHandle`] keeps working after the task itself has
/// moved into a queue.
pub struct CancelableTask {
    task: Box<dyn Task>,
    cancelled: Arc<AtomicBool>,
}

impl CancelableTask {
    pub fn new<F>(f: F) -> (Self, CancelHandle)
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = Self {
            task: Box::new(f),
            cancelled: cancelled.clone(),
        };
        (task, CancelHandle { cancelled })
    }
}

impl Task for CancelableTask {
    fn run(self: Box<Self>) {
        if !self.cancelled.load(Ordering::Acquire) {
            self.task.run();
        }
    }
}

/// Remote control for one [`CancelableTask`]. Cloneable and thread-safe.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Make a subsequent run of the task a no-op. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
