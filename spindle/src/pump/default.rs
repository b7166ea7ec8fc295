//! The generic-worker backend: no OS event source, just a wake event.

use super::waker::{EventWaker, PumpWaker};
use super::{Delegate, PumpCore};
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct DefaultPump {
    core: PumpCore,
    event: Arc<EventWaker>,
}

impl DefaultPump {
    pub(crate) fn new() -> Self {
        Self {
            core: PumpCore::new(),
            event: Arc::new(EventWaker::new()),
        }
    }

    pub(crate) fn core(&self) -> &PumpCore {
        &self.core
    }

    pub(crate) fn waker(&self) -> Arc<dyn PumpWaker> {
        self.event.clone()
    }

    pub(crate) fn run(&self, delegate: &dyn Delegate) {
        let _frame = self.core.enter();
        loop {
            let mut more_work = delegate.do_work();
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
        match self.core.delayed_work_time() {
            None => self.event.wait(),
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    self.event.wait_timeout(deadline - now);
                } else {
                    // The deadline already elapsed while we were busy; skip
                    // the wait and let the next iteration promote the task.
                    self.core.set_delayed_work_time(None);
                }
            }
        }
    }
}
