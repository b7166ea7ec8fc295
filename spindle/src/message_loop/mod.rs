//! The per-thread loop: queues, ordering, run states, posting, teardown.
//!
//! A [`MessageLoop`] owns one pump and three task queues. Posting pushes
//! into the lock-guarded incoming queue (the only cross-thread state) and
//! wakes the pump if the queue just went non-empty. The pump drives the
//! loop through the [`Delegate`] contract: immediate work drains the work
//! queue one task at a time, promoting delay-carrying tasks into the
//! delayed priority queue; delayed work promotes the earliest due task and
//! reports the next deadline back so the pump can bound its wait.

mod pending;


use crate::observer::ObserverList;
use crate::pump::waker::PumpWaker;
use crate::pump::{
    DefaultPump, Delegate, Dispatcher, IoHandler, IoObserver, IoPump, IoPumpError, IoToken,
    NativeSource, Pump, UiObserver, UiPump,
};
use crate::task::Task;
use io_uring::squeue;
use parking_lot::Mutex;
use pending::{DelayedTaskQueue, PendingTask, TaskQueue};
use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

thread_local! {
    static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// How many teardown passes a loop tolerates for cleanup tasks that keep
/// posting more cleanup tasks before cutting the chain off.
const CLEANUP_PASS_LIMIT: usize = 100;

/// Which pump backend a loop blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Default,
    Io,
    Ui,
}

/// Notified once, on the owning thread, right before the loop goes away.
pub trait DestructionObserver {
    fn will_destroy_current_loop(&self);
}

/// Bracket notifications around every executed task.
pub trait TaskObserver {
    fn will_process_task(&self);
    fn did_process_task(&self);
}

/// A per-thread cooperative task loop. Sole owner of its pump and queues;
/// at most one exists per thread at a time, and construction on a thread
/// that already has one panics.
///
/// The loop itself never leaves its thread (`!Send`); other threads post
/// through a [`Handle`].
pub struct MessageLoop {
    core: Rc<Core>,
}

impl MessageLoop {
    /// A loop that blocks on a plain wake event.
    pub fn new() -> Self {
        Self::with_pump(LoopKind::Default, Pump::Default(DefaultPump::new()))
    }

    /// A loop that blocks on an io_uring completion queue.
    ///
    /// Panics if the OS refuses the ring or the wakeup descriptor; failing
    /// to stand up the backend is a defect, not a recoverable condition.
    pub fn new_io() -> Self {
        let pump = IoPump::try_new().expect("failed to create IO completion backend");
        Self::with_pump(LoopKind::Io, Pump::Io(pump))
    }

    /// A loop that pumps `source`, a host native event queue.
    ///
    /// Panics if the wakeup or timer descriptor cannot be created.
    pub fn new_ui(source: Box<dyn NativeSource>) -> Self {
        let pump = UiPump::try_new(source).expect("failed to create UI backend");
        Self::with_pump(LoopKind::Ui, Pump::Ui(pump))
    }

    fn with_pump(kind: LoopKind, pump: Pump) -> Self {
        let incoming = Arc::new(IncomingQueue::new(pump.waker()));
        let core = Rc::new(Core {
            kind,
            owner: thread::current().id(),
            pump,
            incoming,
            work_queue: RefCell::new(TaskQueue::new()),
            delayed_work_queue: RefCell::new(DelayedTaskQueue::new()),
            next_sequence_num: Cell::new(0),
            recent_time: Cell::new(None),
            run_states: RefCell::new(Vec::new()),
            destruction_observers: ObserverList::new(),
            task_observers: ObserverList::new(),
        });
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.is_none(),
                "this thread already owns a MessageLoop"
            );
            *current = Some(core.clone());
        });
        debug!(?kind, "message loop created");
        Self { core }
    }

    /// The loop registered on the calling thread, if any. This is how code
    /// running inside a task reaches its own loop to post or quit.
    pub fn current() -> Option<Current> {
        CURRENT.with(|current| current.borrow().clone()).map(Current)
    }
}

impl Default for MessageLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for MessageLoop {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.core
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        self.core.check_owning_thread();

        // Discard pending tasks, but carefully: dropping one can post more
        // (cleanup chains), so keep reloading until a pass finds nothing.
        // A chain still going at the cap is cut off rather than chased.
        let mut did_work = false;
        for _ in 0..CLEANUP_PASS_LIMIT {
            self.core.delete_pending_tasks();
            self.core.reload_work_queue();
            did_work = self.core.delete_pending_tasks();
            if !did_work {
                break;
            }
        }
        if did_work {
            warn!("cleanup tasks still being posted after {CLEANUP_PASS_LIMIT} passes; dropping the remainder");
        }

        self.core
            .destruction_observers
            .for_each(|o| o.will_destroy_current_loop());

        // Tasks posted from here on are accepted and never run; the posting
        // surface outlives the loop through its Arc.
        self.core.incoming.close();

        // Release the thread's slot explicitly rather than through drop
        // order.
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// The loop state shared by [`MessageLoop`], [`Current`], and the pump
/// delegate path. All methods must be called on the owning thread unless
/// noted otherwise.
pub struct Core {
    kind: LoopKind,
    owner: ThreadId,
    pump: Pump,
    incoming: Arc<IncomingQueue>,
    work_queue: RefCell<TaskQueue>,
    delayed_work_queue: RefCell<DelayedTaskQueue>,
    next_sequence_num: Cell<i64>,
    /// Lazily refreshed clock cursor bounding `Instant::now` reads while
    /// promoting delayed work.
    recent_time: Cell<Option<Instant>>,
    run_states: RefCell<Vec<RunState>>,
    destruction_observers: ObserverList<dyn DestructionObserver>,
    task_observers: ObserverList<dyn TaskObserver>,
}

struct RunState {
    quit_received: bool,
}

impl Core {
    pub fn kind(&self) -> LoopKind {
        self.kind
    }

    /// A cloneable, thread-safe posting handle.
    pub fn handle(&self) -> Handle {
        Handle {
            incoming: self.incoming.clone(),
        }
    }

    /// Queue `task` for execution. Callable from any thread.
    pub fn post_task<T: Task + 'static>(&self, task: T) {
        self.incoming
            .push(PendingTask::new(Box::new(task), None));
    }

    /// Queue `task` to run once `delay` has elapsed. Callable from any
    /// thread. A zero delay is an immediate post.
    pub fn post_delay_task<T: Task + 'static>(&self, task: T, delay: Duration) {
        self.incoming
            .push(PendingTask::new(Box::new(task), delayed_run_time(delay)));
    }

    /// Drive the loop until the activation is asked to quit. Re-entrant: a
    /// task may start a nested activation, and quitting affects only the
    /// innermost one.
    pub fn run(&self) {
        self.check_owning_thread();
        let _state = self.enter_run_state(false);
        self.pump.run_with_dispatcher(self, None);
    }

    /// Like [`run`](Self::run), with `dispatcher` installed to intercept
    /// native events for the duration of this activation (UI backend).
    pub fn run_with_dispatcher(&self, dispatcher: &dyn Dispatcher) {
        self.check_owning_thread();
        let _state = self.enter_run_state(false);
        self.pump.run_with_dispatcher(self, Some(dispatcher));
    }

    /// Run at most one more sweep of already-queued and already-due work,
    /// then return without blocking.
    pub fn run_all_pending(&self) {
        self.check_owning_thread();
        let _state = self.enter_run_state(true);
        self.pump.run_with_dispatcher(self, None);
    }

    /// Ask the innermost activation to stop once it goes idle. A no-op when
    /// the loop is not running.
    pub fn quit(&self) {
        self.check_owning_thread();
        if let Some(state) = self.run_states.borrow_mut().last_mut() {
            state.quit_received = true;
        }
    }

    /// Like [`quit`](Self::quit), but also tells the pump to stop at its
    /// next iteration boundary instead of waiting for idle.
    pub fn quit_now(&self) {
        self.check_owning_thread();
        let mut run_states = self.run_states.borrow_mut();
        if let Some(state) = run_states.last_mut() {
            state.quit_received = true;
            drop(run_states);
            self.pump.quit();
        }
    }

    pub fn add_destruction_observer(&self, observer: &Rc<dyn DestructionObserver>) {
        self.check_owning_thread();
        self.destruction_observers.add_observer(observer);
    }

    pub fn remove_destruction_observer(&self, observer: &Rc<dyn DestructionObserver>) {
        self.check_owning_thread();
        self.destruction_observers.remove_observer(observer);
    }

    pub fn add_task_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.check_owning_thread();
        self.task_observers.add_observer(observer);
    }

    pub fn remove_task_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.check_owning_thread();
        self.task_observers.remove_observer(observer);
    }

    // Backend-specific surfaces. Each panics on the wrong loop kind, the
    // same contract violation as using the loop off-thread.

    /// Register `handler` for completions on an IO loop; tag submissions
    /// with the returned token.
    pub fn register_io_handler(&self, handler: &Rc<dyn IoHandler>) -> IoToken {
        self.check_owning_thread();
        self.io_pump().register_io_handler(handler)
    }

    pub fn deregister_io_handler(&self, token: IoToken) {
        self.check_owning_thread();
        self.io_pump().deregister_io_handler(token)
    }

    /// Submit one io_uring operation on behalf of a registered handler.
    pub fn submit_io(&self, entry: squeue::Entry, token: IoToken) -> Result<(), IoPumpError> {
        self.check_owning_thread();
        self.io_pump().submit_io(entry, token)
    }

    /// Synchronously retrieve and dispatch one completion record; see the
    /// pump documentation for the `filter` semantics.
    pub fn wait_for_io_completion(
        &self,
        timeout: Option<Duration>,
        filter: Option<IoToken>,
    ) -> bool {
        self.check_owning_thread();
        self.io_pump().wait_for_io_completion(timeout, filter)
    }

    pub fn add_io_observer(&self, observer: &Rc<dyn IoObserver>) {
        self.check_owning_thread();
        self.io_pump().add_io_observer(observer)
    }

    pub fn remove_io_observer(&self, observer: &Rc<dyn IoObserver>) {
        self.check_owning_thread();
        self.io_pump().remove_io_observer(observer)
    }

    pub fn add_ui_observer(&self, observer: &Rc<dyn UiObserver>) {
        self.check_owning_thread();
        self.ui_pump().add_ui_observer(observer)
    }

    pub fn remove_ui_observer(&self, observer: &Rc<dyn UiObserver>) {
        self.check_owning_thread();
        self.ui_pump().remove_ui_observer(observer)
    }

    fn io_pump(&self) -> &IoPump {
        match &self.pump {
            Pump::Io(pump) => pump,
            _ => panic!("not an IO message loop"),
        }
    }

    fn ui_pump(&self) -> &UiPump {
        match &self.pump {
            Pump::Ui(pump) => pump,
            _ => panic!("not a UI message loop"),
        }
    }

    fn check_owning_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "MessageLoop used from a thread that does not own it"
        );
    }

    fn enter_run_state(&self, quit_received: bool) -> RunStateGuard<'_> {
        self.run_states
            .borrow_mut()
            .push(RunState { quit_received });
        RunStateGuard { core: self }
    }

    /// Swap the incoming queue into the work queue, but only once the work
    /// queue is empty: each immediate-work pass is bounded to the tasks
    /// visible at its start, so a task posting another immediate task can
    /// never have it preempt siblings already queued in the same pass.
    fn reload_work_queue(&self) {
        if !self.work_queue.borrow().is_empty() {
            return;
        }
        let mut incoming = self.incoming.queue.lock();
        if incoming.is_empty() {
            return;
        }
        std::mem::swap(&mut *incoming, &mut *self.work_queue.borrow_mut());
        debug_assert!(incoming.is_empty());
    }

    fn add_to_delayed_queue(&self, mut task: PendingTask) -> i64 {
        // Sequence numbers are handed out here, at insertion, so ties on the
        // deadline resolve in promotion order.
        let sequence_num = self.next_sequence_num.get();
        self.next_sequence_num.set(sequence_num + 1);
        task.sequence_num = sequence_num;
        self.delayed_work_queue.borrow_mut().push(task);
        sequence_num
    }

    fn run_task(&self, task: PendingTask) {
        let PendingTask { task, .. } = task;
        self.task_observers.for_each(|o| o.will_process_task());
        task.run();
        self.task_observers.for_each(|o| o.did_process_task());
    }

    fn delete_pending_tasks(&self) -> bool {
        let mut did_work = !self.work_queue.borrow().is_empty();
        loop {
            let Some(task) = self.work_queue.borrow_mut().pop_front() else {
                break;
            };
            if task.delayed_run_time.is_some() {
                self.add_to_delayed_queue(task);
            }
            // An immediate task is dropped here; its drop may post more.
        }

        did_work |= !self.delayed_work_queue.borrow().is_empty();
        loop {
            let Some(task) = self.delayed_work_queue.borrow_mut().pop() else {
                break;
            };
            drop(task);
        }
        did_work
    }
}

impl Delegate for Core {
    fn do_work(&self) -> bool {
        loop {
            self.reload_work_queue();
            if self.work_queue.borrow().is_empty() {
                break;
            }
            loop {
                let Some(task) = self.work_queue.borrow_mut().pop_front() else {
                    break;
                };
                if let Some(run_time) = task.delayed_run_time {
                    let sequence_num = self.add_to_delayed_queue(task);
                    let now_soonest = self
                        .delayed_work_queue
                        .borrow()
                        .peek()
                        .is_some_and(|top| top.sequence_num == sequence_num);
                    if now_soonest {
                        // The promoted task moved the earliest deadline up;
                        // let the pump re-arm its wait.
                        self.pump.schedule_delay_work(run_time);
                    }
                } else {
                    self.run_task(task);
                    return true;
                }
            }
        }
        false
    }

    fn do_delay_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool {
        let Some(next_run_time) = self
            .delayed_work_queue
            .borrow()
            .peek()
            .and_then(|task| task.delayed_run_time)
        else {
            self.recent_time.set(None);
            *next_delayed_work_time = None;
            return false;
        };

        if self
            .recent_time
            .get()
            .is_none_or(|recent| next_run_time > recent)
        {
            // The cached cursor says the deadline might still be in the
            // future; pay for one real clock read to find out.
            let now = Instant::now();
            self.recent_time.set(Some(now));
            if next_run_time > now {
                *next_delayed_work_time = Some(next_run_time);
                return false;
            }
        }

        let Some(task) = self.delayed_work_queue.borrow_mut().pop() else {
            return false;
        };
        *next_delayed_work_time = self
            .delayed_work_queue
            .borrow()
            .peek()
            .and_then(|next| next.delayed_run_time);
        self.run_task(task);
        true
    }

    fn do_idle_work(&self) -> bool {
        if self
            .run_states
            .borrow()
            .last()
            .is_some_and(|state| state.quit_received)
        {
            self.pump.quit();
        }
        false
    }
}

struct RunStateGuard<'a> {
    core: &'a Core,
}

impl Drop for RunStateGuard<'_> {
    fn drop(&mut self) {
        self.core.run_states.borrow_mut().pop();
    }
}

/// The loop registered on the calling thread; see [`MessageLoop::current`].
/// Exposes the owner-thread API to code running inside tasks.
#[derive(Clone)]
pub struct Current(Rc<Core>);

impl Deref for Current {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.0
    }
}

/// Thread-safe posting handle; the only part of a loop other threads may
/// touch. Posting to a loop that has been destroyed is accepted and the
/// task is silently never run.
#[derive(Clone)]
pub struct Handle {
    incoming: Arc<IncomingQueue>,
}

impl Handle {
    pub fn post_task<T: Task + 'static>(&self, task: T) {
        self.incoming
            .push(PendingTask::new(Box::new(task), None));
    }

    pub fn post_delay_task<T: Task + 'static>(&self, task: T, delay: Duration) {
        self.incoming
            .push(PendingTask::new(Box::new(task), delayed_run_time(delay)));
    }
}

/// The one piece of loop state shared across threads. The lock guards only
/// the push and the was-empty wakeup decision, never task execution.
struct IncomingQueue {
    queue: Mutex<TaskQueue>,
    waker: Arc<dyn PumpWaker>,
    closed: AtomicBool,
}

impl IncomingQueue {
    fn new(waker: Arc<dyn PumpWaker>) -> Self {
        Self {
            queue: Mutex::new(TaskQueue::new()),
            waker,
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, task: PendingTask) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        // A post racing against a non-empty queue skips the wakeup: the pump
        // is already scheduled to drain everything visible.
        if was_empty && !self.closed.load(Ordering::Acquire) {
            self.waker.wake();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn delayed_run_time(delay: Duration) -> Option<Instant> {
    (!delay.is_zero()).then(|| Instant::now() + delay)
}
