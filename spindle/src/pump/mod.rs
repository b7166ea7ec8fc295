//! Pump backends: the blocking-wait strategies driving a message loop.
//!
//! A pump repeatedly asks its [`Delegate`] (the loop core) for immediate,
//! delayed, then idle work, and falls back to a backend-specific blocking
//! wait when none is plausible. The backends are a closed set behind
//! [`Pump`]; they share the nested run-state discipline and the
//! next-deadline bookkeeping through [`PumpCore`].

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) mod os;
pub(crate) mod waker;

mod ring;

pub mod default;
pub(crate) use default::DefaultPump;

pub mod io;
pub use io::{IoHandler, IoObserver, IoPumpError, IoToken};
pub(crate) use io::IoPump;

pub mod ui;
pub use ui::{Dispatcher, NativeEvent, NativeSource, UiObserver};
pub(crate) use ui::UiPump;

use waker::PumpWaker;

/// The contract a message loop implements so a pump can drive its task
/// execution. Each capability reports whether more work is plausible, which
/// tells the pump to loop again instead of blocking.
pub trait Delegate {
    /// Run at most one immediate task.
    fn do_work(&self) -> bool;

    /// Run at most one due delayed task; reports the next known deadline
    /// back through `next_delayed_work_time` (`None` when there is none).
    fn do_delay_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool;

    /// Last-chance hook before the pump blocks.
    fn do_idle_work(&self) -> bool;
}

/// The closed set of pump backends.
pub(crate) enum Pump {
    Default(DefaultPump),
    Io(IoPump),
    Ui(UiPump),
}

impl Pump {
    pub(crate) fn run_with_dispatcher(
        &self,
        delegate: &dyn Delegate,
        dispatcher: Option<&dyn Dispatcher>,
    ) {
        match self {
            Pump::Default(pump) => pump.run(delegate),
            Pump::Io(pump) => pump.run(delegate),
            Pump::Ui(pump) => pump.run_with_dispatcher(delegate, dispatcher),
        }
    }

    /// Ask the innermost run activation to stop at its next safe point.
    pub(crate) fn quit(&self) {
        self.core().quit();
    }

    /// Tell the pump about a new earliest deadline so its wait can re-arm.
    pub(crate) fn schedule_delay_work(&self, deadline: Instant) {
        match self {
            Pump::Ui(pump) => pump.schedule_delay_work(deadline),
            other => other.core().set_delayed_work_time(Some(deadline)),
        }
    }

    /// The thread-safe wake capability backing `ScheduleWork`.
    pub(crate) fn waker(&self) -> Arc<dyn PumpWaker> {
        match self {
            Pump::Default(pump) => pump.waker(),
            Pump::Io(pump) => pump.waker(),
            Pump::Ui(pump) => pump.waker(),
        }
    }

    fn core(&self) -> &PumpCore {
        match self {
            Pump::Default(pump) => pump.core(),
            Pump::Io(pump) => pump.core(),
            Pump::Ui(pump) => pump.core(),
        }
    }
}

/// State every backend shares: one frame per nested run activation plus the
/// nearest known delayed-work deadline.
pub(crate) struct PumpCore {
    frames: RefCell<Vec<PumpFrame>>,
    delayed_work_time: Cell<Option<Instant>>,
}

struct PumpFrame {
    should_quit: bool,
}

impl PumpCore {
    pub(crate) fn new() -> Self {
        Self {
            frames: RefCell::new(Vec::new()),
            delayed_work_time: Cell::new(None),
        }
    }

    /// Push a run activation; the guard pops it on every exit path.
    pub(crate) fn enter(&self) -> FrameGuard<'_> {
        self.frames
            .borrow_mut()
            .push(PumpFrame { should_quit: false });
        FrameGuard { core: self }
    }

    pub(crate) fn quit(&self) {
        if let Some(frame) = self.frames.borrow_mut().last_mut() {
            frame.should_quit = true;
        }
    }

    pub(crate) fn should_quit(&self) -> bool {
        self.frames
            .borrow()
            .last()
            .is_some_and(|frame| frame.should_quit)
    }

    pub(crate) fn run_depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub(crate) fn delayed_work_time(&self) -> Option<Instant> {
        self.delayed_work_time.get()
    }

    pub(crate) fn set_delayed_work_time(&self, deadline: Option<Instant>) {
        self.delayed_work_time.set(deadline);
    }

    /// Time remaining until the nearest known deadline: `None` means wait
    /// unbounded, and an elapsed deadline clamps to zero rather than going
    /// negative.
    pub(crate) fn current_delay(&self) -> Option<Duration> {
        self.delayed_work_time
            .get()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

pub(crate) struct FrameGuard<'a> {
    core: &'a PumpCore,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.core.frames.borrow_mut().pop();
    }
}
