//! Active objects and direct event posting.
//!
//! An active object owns a priority, an [`EventQueue`] and a behavior. Its
//! dispatch loop takes one event at a time, hands it to the behavior, and
//! garbage-collects it afterwards. Producers reach the queue through
//! [`Framework::post`] and friends; the loop blocks on a [`Wakeup`] that a
//! producer signals whenever it fills an empty queue.

use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use critical_section::Mutex as CsMutex;

use crate::assert::{q_error, q_require};
use crate::dynamic::Retain;
use crate::error::PostError;
use crate::event::{EventRef, Margin, Signal};
use crate::framework::Framework;
use crate::isr::IsrContext;
use crate::priority::Priority;
use crate::queue::{Admission, EventQueue, QueueStats};
use crate::sync::{Arc, Mutex, Wakeup};
use crate::trace::{records, RecordBuf, TraceResult};

const MODULE: &str = "qf_actq";

/// Lifecycle of an active object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActiveState {
    Created = 0,
    Registered = 1,
    Running = 2,
    Stopping = 3,
    Removed = 4,
}

impl ActiveState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ActiveState::Created,
            1 => ActiveState::Registered,
            2 => ActiveState::Running,
            3 => ActiveState::Stopping,
            _ => ActiveState::Removed,
        }
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActiveState::Created => "created",
            ActiveState::Registered => "registered",
            ActiveState::Running => "running",
            ActiveState::Stopping => "stopping",
            ActiveState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Framework-facing half of an active object: priority, queue, wake-up and
/// lifecycle state.
pub struct ActiveCore {
    priority: Priority,
    queue: CsMutex<RefCell<EventQueue>>,
    wakeup: Wakeup,
    state: AtomicU8,
}

impl ActiveCore {
    pub fn new(priority: Priority, queue_capacity: usize) -> Self {
        q_require!(
            MODULE,
            300,
            queue_capacity > 0,
            "queue of {priority} needs at least one slot"
        );
        Self {
            priority,
            queue: CsMutex::new(RefCell::new(EventQueue::new(queue_capacity))),
            wakeup: Wakeup::new(),
            state: AtomicU8::new(ActiveState::Created as u8),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ActiveState {
        ActiveState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn has_events(&self) -> bool {
        critical_section::with(|cs| !self.queue.borrow_ref(cs).is_empty())
    }

    pub fn queue_stats(&self) -> QueueStats {
        critical_section::with(|cs| self.queue.borrow_ref(cs).stats())
    }

    /// Asks the dispatch loop to finish after the event in progress.
    ///
    /// Returns `false` if the object was not running.
    pub fn request_stop(&self) -> bool {
        if !self.transition(ActiveState::Running, ActiveState::Stopping) {
            return false;
        }
        log::debug!("{} stopping", self.priority);
        self.wakeup.signal();
        true
    }

    pub(crate) fn set_state(&self, state: ActiveState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: ActiveState, to: ActiveState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn take(&self) -> Option<EventRef> {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).take())
    }
}

/// Handed to behaviors for the duration of one callback.
pub struct ActiveContext<'a> {
    framework: &'a Framework,
    core: &'a ActiveCore,
}

impl<'a> ActiveContext<'a> {
    pub(crate) fn new(framework: &'a Framework, core: &'a ActiveCore) -> Self {
        Self { framework, core }
    }

    pub fn framework(&self) -> &'a Framework {
        self.framework
    }

    pub fn priority(&self) -> Priority {
        self.core.priority
    }

    /// Stops the owning object once the current callback returns.
    pub fn stop(&self) -> bool {
        self.core.request_stop()
    }

    pub fn emit_trace(&self, record_type: u8, payload: &[u8]) -> TraceResult {
        match self.framework.trace_hook() {
            Some(hook) => hook(record_type, payload, true),
            None => Ok(()),
        }
    }
}

/// Trait implemented by application state machines.
///
/// `on_event` runs to completion for every dequeued event. The event handle
/// is only valid until the callback returns unless the behavior calls
/// [`Framework::retain`] on it.
pub trait ActiveBehavior: Send + 'static {
    fn on_start(&mut self, ctx: &mut ActiveContext<'_>, initial: Option<EventRef>);
    fn on_event(&mut self, ctx: &mut ActiveContext<'_>, event: EventRef);
}

/// Object-safe interface the framework schedules.
pub trait ActiveRunnable: Send + Sync {
    fn core(&self) -> &ActiveCore;
    fn init(&self, ctx: &mut ActiveContext<'_>, initial: Option<EventRef>);
    fn dispatch(&self, ctx: &mut ActiveContext<'_>, event: EventRef);

    fn priority(&self) -> Priority {
        self.core().priority()
    }

    fn state(&self) -> ActiveState {
        self.core().state()
    }

    fn has_events(&self) -> bool {
        self.core().has_events()
    }

    fn stop(&self) -> bool {
        self.core().request_stop()
    }

    /// Dispatches one queued event without blocking. Returns `false` if the
    /// object is not running or its queue is empty.
    fn dispatch_one(&self, framework: &Framework) -> bool {
        if self.state() != ActiveState::Running {
            return false;
        }
        match framework.take_event(self.core()) {
            Some(event) => {
                process(self, framework, event);
                true
            }
            None => false,
        }
    }

    /// Dispatch loop: blocks for events until stopped, then removes the
    /// object from the framework.
    fn run(&self, framework: &Framework) {
        while let Some(event) = framework.get_event(self.core()) {
            process(self, framework, event);
        }
        framework.retire(self.core());
    }
}

fn process<A: ActiveRunnable + ?Sized>(active: &A, framework: &Framework, event: EventRef) {
    let mut ctx = ActiveContext::new(framework, active.core());
    active.dispatch(&mut ctx, event);
    framework.gc(event);
}

/// Active object driving a concrete behavior.
pub struct ActiveObject<B: ActiveBehavior> {
    core: ActiveCore,
    behavior: Mutex<B>,
}

impl<B: ActiveBehavior> ActiveObject<B> {
    pub fn new(priority: Priority, queue_capacity: usize, behavior: B) -> Arc<Self> {
        Arc::new(Self {
            core: ActiveCore::new(priority, queue_capacity),
            behavior: Mutex::new(behavior),
        })
    }

    /// Runs `f` against the behavior, outside of any dispatch.
    pub fn with_behavior<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.behavior.lock())
    }
}

impl<B: ActiveBehavior> ActiveRunnable for ActiveObject<B> {
    fn core(&self) -> &ActiveCore {
        &self.core
    }

    fn init(&self, ctx: &mut ActiveContext<'_>, initial: Option<EventRef>) {
        self.behavior.lock().on_start(ctx, initial);
    }

    fn dispatch(&self, ctx: &mut ActiveContext<'_>, event: EventRef) {
        self.behavior.lock().on_event(ctx, event);
    }
}

pub type ActiveObjectRef = Arc<dyn ActiveRunnable>;

/// Helper builder for typed active objects.
pub fn new_active_object<B: ActiveBehavior>(
    priority: Priority,
    queue_capacity: usize,
    behavior: B,
) -> ActiveObjectRef {
    ActiveObject::new(priority, queue_capacity, behavior) as ActiveObjectRef
}

/// Convenience behavior for state machines that only react to signals.
pub trait SignalHandler: Send + 'static {
    fn on_start(&mut self, _ctx: &mut ActiveContext<'_>) {}
    fn handle_signal(&mut self, signal: Signal, ctx: &mut ActiveContext<'_>);
}

impl<T: SignalHandler> ActiveBehavior for T {
    fn on_start(&mut self, ctx: &mut ActiveContext<'_>, _initial: Option<EventRef>) {
        SignalHandler::on_start(self, ctx);
    }

    fn on_event(&mut self, ctx: &mut ActiveContext<'_>, event: EventRef) {
        SignalHandler::handle_signal(self, event.signal(), ctx);
    }
}

enum PostOutcome {
    Queued { wake: bool, free: usize, min: usize },
    Rejected { free: usize },
    Overflow,
    Stale,
    Saturated,
}

impl Framework {
    /// Posts `event` to the active object at `target`, FIFO.
    ///
    /// With [`Margin::NoMargin`] the post must succeed and a full queue
    /// halts the system. With [`Margin::Keep`] a post that would leave too
    /// little room is refused and the event is left untouched.
    pub fn post(&self, target: Priority, event: EventRef, margin: Margin) -> Result<(), PostError> {
        self.post_x(target, event, margin, false, None)
    }

    /// Posts `event` ahead of everything already queued at `target`.
    ///
    /// Urgent posts never use a margin; an overflow halts.
    pub fn post_lifo(&self, target: Priority, event: EventRef) {
        self.post_no_margin(target, event, true, None);
    }

    /// Interrupt-context variant of [`post`](Self::post).
    pub fn post_from_isr(
        &self,
        target: Priority,
        event: EventRef,
        margin: Margin,
        isr: &mut IsrContext,
    ) -> Result<(), PostError> {
        self.post_x(target, event, margin, false, Some(isr))
    }

    /// Post that cannot be refused: it either queues or halts.
    pub(crate) fn post_no_margin(
        &self,
        target: Priority,
        event: EventRef,
        lifo: bool,
        isr: Option<&mut IsrContext>,
    ) {
        if let Err(err) = self.post_x(target, event, Margin::NoMargin, lifo, isr) {
            q_error!(MODULE, 320, "{err}");
        }
    }

    fn post_x(
        &self,
        target: Priority,
        event: EventRef,
        margin: Margin,
        lifo: bool,
        isr: Option<&mut IsrContext>,
    ) -> Result<(), PostError> {
        let Some(active) = self.active(target) else {
            q_error!(MODULE, 310, "{event} posted to unregistered {target}");
        };
        let core = active.core();

        let outcome = critical_section::with(|cs| {
            let mut queue = core.queue.borrow_ref_mut(cs);
            match queue.admit(margin) {
                Admission::Accept => {}
                Admission::Reject => {
                    return PostOutcome::Rejected { free: queue.free() };
                }
                Admission::Overflow => return PostOutcome::Overflow,
            }
            match self.retain_in(cs, event) {
                Retain::Held => {}
                Retain::Stale => return PostOutcome::Stale,
                Retain::Saturated => return PostOutcome::Saturated,
            }
            let wake = if lifo {
                queue.push_front(event)
            } else {
                queue.push_back(event)
            };
            PostOutcome::Queued {
                wake,
                free: queue.free(),
                min: queue.min_free(),
            }
        });

        match outcome {
            PostOutcome::Queued { wake, free, min } => {
                if wake {
                    core.wakeup.signal();
                    if let Some(isr) = isr {
                        isr.note_woken(target);
                    }
                }
                let record = if lifo {
                    records::ACTIVE_POST_LIFO
                } else {
                    records::ACTIVE_POST
                };
                self.trace_with(record, || post_record(event, target).count(free).count(min));
                Ok(())
            }
            PostOutcome::Rejected { free } => {
                log::debug!("{target} refused {event}: {free} free, margin {margin:?}");
                self.trace_with(records::ACTIVE_POST_ATTEMPT, || {
                    post_record(event, target)
                        .count(free)
                        .count(margin.threshold())
                });
                Err(PostError::QueueFull {
                    target,
                    free,
                    margin: margin.threshold(),
                })
            }
            PostOutcome::Overflow => {
                q_error!(MODULE, 320, "queue of {target} overflowed posting {event}")
            }
            PostOutcome::Stale => {
                q_error!(MODULE, 321, "{event} was recycled before reaching {target}")
            }
            PostOutcome::Saturated => {
                q_error!(MODULE, 322, "reference count of {event} saturated")
            }
        }
    }

    /// Takes the next event for `core` without blocking.
    pub(crate) fn take_event(&self, core: &ActiveCore) -> Option<EventRef> {
        let (event, free) = {
            let _gate = self.sched_lock.dispatch_gate();
            critical_section::with(|cs| {
                let mut queue = core.queue.borrow_ref_mut(cs);
                queue.take().map(|event| (event, queue.free()))
            })?
        };
        self.trace_with(records::ACTIVE_GET, || {
            post_record(event, core.priority()).count(free)
        });
        Some(event)
    }

    /// Blocks until `core` has an event or is asked to stop.
    pub(crate) fn get_event(&self, core: &ActiveCore) -> Option<EventRef> {
        loop {
            if core.state() != ActiveState::Running {
                return None;
            }
            if let Some(event) = self.take_event(core) {
                return Some(event);
            }
            core.wakeup.wait();
        }
    }
}

fn post_record(event: EventRef, target: Priority) -> RecordBuf {
    RecordBuf::new()
        .u16(event.signal().raw())
        .u8(target.raw())
        .u8(event.pool_id())
}
