//! Per-thread cooperative message loops.
//!
//! A [`MessageLoop`] lets a single thread interleave three kinds of work
//! under one priority policy: tasks posted for immediate execution, tasks
//! scheduled against a deadline, and OS-level event sources. The loop owns
//! one *pump* — the backend supplying its blocking-wait strategy — chosen at
//! construction:
//!
//! - [`MessageLoop::new`] blocks on a plain wake event (generic workers),
//! - [`MessageLoop::new_io`] blocks on an `io_uring` completion queue,
//! - [`MessageLoop::new_ui`] blocks on a host native event queue.
//!
//! Posting is the only cross-thread operation: clone a [`Handle`] and post
//! from anywhere. Everything else — running, quitting, observers, backend
//! registration — belongs to the owning thread, and at most one loop may
//! exist per thread at a time.

pub mod message_loop;
pub use message_loop::{
    Current, DestructionObserver, Handle, LoopKind, MessageLoop, TaskObserver,
};

pub mod observer;
pub use observer::ObserverList;

pub mod pump;
pub use pump::{
    Delegate, Dispatcher, IoHandler, IoObserver, IoPumpError, IoToken, NativeEvent, NativeSource,
    UiObserver,
};

pub mod task;
pub use task::{CancelHandle, CancelableTask, Task};

// Submissions to an IO loop are built with the `io-uring` opcode types.
pub use io_uring;

#[cfg(test)]
mod test_utils;
