//! The UI-thread backend: pumps a host native event queue alongside tasks.
//!
//! The host queue is modelled the way Linux display servers expose one: a
//! file descriptor that polls readable while events are pending, plus
//! non-blocking retrieval and a default dispatch. The pump adds its own
//! wakeup eventfd (the "work message") and a one-shot timer for delayed
//! work, and its blocking wait covers all three.

use super::os::{self, TimerFd};
use super::waker::{FdWaker, PumpWaker};
use super::{Delegate, PumpCore};
use crate::observer::ObserverList;
use anyhow::{Context as _, Result};
use std::cell::Cell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Shortest interval the host timer is armed with; requested deadlines
/// closer than this are rounded up, matching usual OS timer granularity.
const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(10);

/// One event taken off a host native queue. The field meaning is private to
/// the source that produced it; the pump only routes events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeEvent {
    pub code: u32,
    pub param: u64,
}

/// The host native event queue a UI loop integrates.
pub trait NativeSource {
    /// Descriptor that polls readable while native events are pending.
    fn as_raw_fd(&self) -> RawFd;

    /// Pop the next pending event without blocking.
    fn next_event(&self) -> Option<NativeEvent>;

    /// Default handling for one event, used when no dispatcher consumed it.
    fn dispatch(&self, event: &NativeEvent);
}

/// Optional hook that sees native events before default handling.
/// Returning `true` consumes the event.
pub trait Dispatcher {
    fn dispatch(&self, event: &NativeEvent) -> bool;
}

/// Bracket notifications around each dispatched native event.
pub trait UiObserver {
    fn will_process_event(&self, event: &NativeEvent);
    fn did_process_event(&self, event: &NativeEvent);
}

pub(crate) struct UiPump {
    core: PumpCore,
    source: Box<dyn NativeSource>,
    waker: Arc<FdWaker>,
    timer: TimerFd,
    /// Deadline the timer is currently armed for, to skip redundant re-arms.
    armed_deadline: Cell<Option<Instant>>,
    ui_observers: ObserverList<dyn UiObserver>,
}

impl UiPump {
    pub(crate) fn try_new(source: Box<dyn NativeSource>) -> Result<Self> {
        Ok(Self {
            core: PumpCore::new(),
            source,
            waker: Arc::new(FdWaker::new().context("failed to create wakeup eventfd")?),
            timer: TimerFd::new().context("failed to create delayed-work timer")?,
            armed_deadline: Cell::new(None),
            ui_observers: ObserverList::new(),
        })
    }

    pub(crate) fn core(&self) -> &PumpCore {
        &self.core
    }

    pub(crate) fn waker(&self) -> Arc<dyn PumpWaker> {
        self.waker.clone()
    }

    pub(crate) fn add_ui_observer(&self, observer: &Rc<dyn UiObserver>) {
        self.ui_observers.add_observer(observer);
    }

    pub(crate) fn remove_ui_observer(&self, observer: &Rc<dyn UiObserver>) {
        self.ui_observers.remove_observer(observer);
    }

    /// Arm the host timer for `deadline`. The computed delay never goes
    /// negative (an elapsed deadline fires as soon as possible) and is
    /// rounded up to the minimum timer granularity.
    pub(crate) fn schedule_delay_work(&self, deadline: Instant) {
        self.core.set_delayed_work_time(Some(deadline));
        if self.armed_deadline.get() == Some(deadline) {
            return;
        }
        let delay = deadline
            .saturating_duration_since(Instant::now())
            .max(MIN_TIMER_INTERVAL);
        self.timer.arm(delay);
        self.armed_deadline.set(Some(deadline));
    }

    pub(crate) fn run_with_dispatcher(
        &self,
        delegate: &dyn Delegate,
        dispatcher: Option<&dyn Dispatcher>,
    ) {
        let _frame = self.core.enter();
        loop {
            let mut more_work = self.process_next_native_event(dispatcher);
            if self.core.should_quit() {
                break;
            }

            more_work |= delegate.do_work();
            if self.core.should_quit() {
                break;
            }

            let mut next_delay = self.core.delayed_work_time();
            more_work |= delegate.do_delay_work(&mut next_delay);
            self.core.set_delayed_work_time(next_delay);
            match next_delay {
                Some(deadline) => self.schedule_delay_work(deadline),
                None => {
                    if more_work && self.armed_deadline.get().is_some() {
                        // Delayed queue drained; no reason to keep the host
                        // timer armed.
                        self.timer.disarm();
                        self.armed_deadline.set(None);
                    }
                }
            }
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

    /// Handle at most one pending native event, routing it through the
    /// installed dispatcher before falling back to the source's default.
    fn process_next_native_event(&self, dispatcher: Option<&dyn Dispatcher>) -> bool {
        let Some(event) = self.source.next_event() else {
            return false;
        };

        self.ui_observers.for_each(|o| o.will_process_event(&event));
        let consumed = dispatcher.is_some_and(|d| d.dispatch(&event));
        if !consumed {
            self.source.dispatch(&event);
        }
        self.ui_observers.for_each(|o| o.did_process_event(&event));
        true
    }

    /// Block until native input, a posted wakeup, or the timer — bounded by
    /// the next known deadline either way.
    fn wait_for_work(&self) {
        let fds = [
            self.source.as_raw_fd(),
            self.waker.as_raw_fd(),
            self.timer.as_raw_fd(),
        ];
        match os::poll_readable(&fds, self.core.current_delay()) {
            Ok(ready) => {
                if ready[1] {
                    self.waker.clear();
                }
                if ready[2] {
                    self.timer.clear();
                    self.armed_deadline.set(None);
                }
            }
            Err(e) => warn!("native event wait failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageLoop;
    use crate::test_utils::{MockNativeSource, SourceHandle};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reposts itself until the source has dispatched `until` events, then
    /// quits. Each loop iteration handles one native event before tasks, so
    /// the probe observes the native queue draining ahead of posted work.
    struct DrainProbe {
        source: Arc<MockNativeSource>,
        until: usize,
    }

    impl crate::Task for DrainProbe {
        fn run(self: Box<Self>) {
            let current = MessageLoop::current().unwrap();
            if self.source.dispatched().len() == self.until {
                current.quit();
            } else {
                current.post_task(*self);
            }
        }
    }

    #[test]
    fn pending_native_events_drain_ahead_of_tasks() {
        let source = MockNativeSource::shared();
        source.push_event(NativeEvent { code: 1, param: 0 });
        source.push_event(NativeEvent { code: 2, param: 0 });

        let ml = MessageLoop::new_ui(Box::new(SourceHandle(source.clone())));
        // The first probe run already sees one event dispatched: the native
        // queue goes first within an iteration.
        let probe = source.clone();
        ml.post_task(move || assert!(!probe.dispatched().is_empty()));
        ml.post_task(DrainProbe {
            source: source.clone(),
            until: 2,
        });

        ml.run();
        assert_eq!(
            source
                .dispatched()
                .iter()
                .map(|e| e.code)
                .collect::<Vec<_>>(),
            [1, 2]
        );
    }

    #[test]
    fn dispatcher_intercepts_native_events() {
        struct Interceptor {
            seen: Mutex<Vec<NativeEvent>>,
            quit_after: usize,
        }
        impl Dispatcher for Interceptor {
            fn dispatch(&self, event: &NativeEvent) -> bool {
                let mut seen = self.seen.lock();
                seen.push(*event);
                if seen.len() == self.quit_after {
                    MessageLoop::current().unwrap().quit();
                }
                true
            }
        }

        let source = MockNativeSource::shared();
        source.push_event(NativeEvent { code: 7, param: 1 });
        source.push_event(NativeEvent { code: 8, param: 2 });

        let ml = MessageLoop::new_ui(Box::new(SourceHandle(source.clone())));
        let interceptor = Interceptor {
            seen: Mutex::new(Vec::new()),
            quit_after: 2,
        };
        ml.run_with_dispatcher(&interceptor);

        // The dispatcher consumed both events, so default dispatch never ran.
        assert_eq!(interceptor.seen.lock().len(), 2);
        assert!(source.dispatched().is_empty());
    }

    #[test]
    fn delayed_task_fires_after_its_deadline() {
        let source = MockNativeSource::shared();
        let ml = MessageLoop::new_ui(Box::new(SourceHandle(source)));

        let start = Instant::now();
        ml.post_delay_task(
            || MessageLoop::current().unwrap().quit(),
            Duration::from_millis(40),
        );
        ml.run();
        assert!(Instant::now() - start >= Duration::from_millis(40));
    }

    #[test]
    fn cross_thread_posts_wake_a_blocked_ui_loop() {
        let source = MockNativeSource::shared();
        let ml = MessageLoop::new_ui(Box::new(SourceHandle(source)));
        let handle = ml.handle();
        let counter = Arc::new(AtomicUsize::new(0));

        let poster = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                for _ in 0..5 {
                    let counter = counter.clone();
                    handle.post_task(move || {
                        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                            MessageLoop::current().unwrap().quit();
                        }
                    });
                }
            })
        };

        ml.run();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        poster.join().unwrap();
    }

    #[test]
    fn ui_observers_bracket_each_event() {
        struct Brackets {
            will: Cell<usize>,
            did: Cell<usize>,
        }
        impl UiObserver for Brackets {
            fn will_process_event(&self, _event: &NativeEvent) {
                self.will.set(self.will.get() + 1);
            }
            fn did_process_event(&self, _event: &NativeEvent) {
                self.did.set(self.did.get() + 1);
            }
        }

        let source = MockNativeSource::shared();
        source.push_event(NativeEvent { code: 1, param: 0 });

        let ml = MessageLoop::new_ui(Box::new(SourceHandle(source.clone())));
        let brackets = Rc::new(Brackets {
            will: Cell::new(0),
            did: Cell::new(0),
        });
        let observer: Rc<dyn UiObserver> = brackets.clone();
        ml.add_ui_observer(&observer);

        let probe = source.clone();
        ml.post_task(move || {
            assert_eq!(probe.dispatched().len(), 1);
            MessageLoop::current().unwrap().quit();
        });
        ml.run();

        assert_eq!(brackets.will.get(), 1);
        assert_eq!(brackets.did.get(), 1);
    }
}
