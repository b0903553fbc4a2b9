//! Time events (software timers).
//!
//! Time events live in a fixed table owned by the framework and are linked
//! into one list per tick rate while armed. Arming never touches the main
//! list: a newly armed event goes onto a side list that the next tick
//! splices in when its walk reaches the end. Every walk step runs in its own
//! short critical section.
//!
//! Disarming only clears the counter; the tick unlinks the event lazily the
//! next time it walks past it.
//!
//! Expired events are posted as static events carrying the time event's
//! signal, highest target priority first, once the walk is done.

use core::cmp::Reverse;
use core::fmt;

use crate::assert::{q_error, q_require};
use crate::event::{EventRef, Signal};
use crate::framework::Framework;
use crate::isr::IsrContext;
use crate::priority::Priority;
use crate::trace::{records, RecordBuf};

const MODULE: &str = "qf_time";

/// Size of the time event table.
pub const MAX_TIME_EVENTS: usize = 64;

/// Handle to a time event in the framework's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeEventId(u16);

impl TimeEventId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TimeEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "te#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct TimeEventConfig {
    pub signal: Signal,
    pub tick_rate: u8,
}

impl TimeEventConfig {
    pub fn new(signal: Signal) -> Self {
        Self {
            signal,
            tick_rate: 0,
        }
    }

    pub fn with_tick_rate(mut self, rate: u8) -> Self {
        self.tick_rate = rate;
        self
    }
}

struct TimeEventSlot {
    signal: Signal,
    target: Priority,
    rate: u8,
    ctr: u32,
    interval: u32,
    linked: bool,
    next: Option<u16>,
    /// Tick of its rate that last counted this event down.
    counted: Option<u32>,
}

#[derive(Default)]
struct RateList {
    head: Option<u16>,
    /// Armed since the last walk, not yet spliced in.
    armed: Option<u16>,
    ticks: u32,
    in_tick: bool,
}

#[derive(Clone, Copy)]
enum Link {
    Head,
    Slot(u16),
}

#[derive(Debug, Clone, Copy)]
struct Expired {
    id: u16,
    signal: Signal,
    target: Priority,
    one_shot: bool,
}

enum Step {
    Done,
    Continue,
    Expired(Expired),
}

enum Arm {
    Armed,
    AlreadyArmed,
    Unknown,
}

pub(crate) struct TimeEngine {
    slots: Vec<TimeEventSlot>,
    capacity: usize,
    rates: Box<[RateList]>,
}

impl TimeEngine {
    pub(crate) fn new(max_tick_rate: u8, capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            rates: (0..max_tick_rate).map(|_| RateList::default()).collect(),
        }
    }

    fn rate_count(&self) -> usize {
        self.rates.len()
    }

    fn add(&mut self, signal: Signal, target: Priority, rate: u8) -> Option<TimeEventId> {
        if usize::from(rate) >= self.rate_count() || self.slots.len() >= self.capacity {
            return None;
        }
        let id = TimeEventId(self.slots.len() as u16);
        self.slots.push(TimeEventSlot {
            signal,
            target,
            rate,
            ctr: 0,
            interval: 0,
            linked: false,
            next: None,
            counted: None,
        });
        Some(id)
    }

    fn slot(&self, id: TimeEventId) -> Option<&TimeEventSlot> {
        self.slots.get(id.index())
    }

    fn next_of(&self, rate: usize, link: Link) -> Option<u16> {
        match link {
            Link::Head => self.rates[rate].head,
            Link::Slot(index) => self.slots[usize::from(index)].next,
        }
    }

    fn set_next(&mut self, rate: usize, link: Link, next: Option<u16>) {
        match link {
            Link::Head => self.rates[rate].head = next,
            Link::Slot(index) => self.slots[usize::from(index)].next = next,
        }
    }

    fn arm(&mut self, id: TimeEventId, ticks: u32, interval: u32) -> Arm {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return Arm::Unknown;
        };
        if slot.ctr != 0 {
            return Arm::AlreadyArmed;
        }
        slot.ctr = ticks;
        slot.interval = interval;
        if !slot.linked {
            self.link(id);
        }
        Arm::Armed
    }

    fn link(&mut self, id: TimeEventId) {
        let slot = &mut self.slots[id.index()];
        let rate = usize::from(slot.rate);
        slot.linked = true;
        slot.next = self.rates[rate].armed;
        self.rates[rate].armed = Some(id.0);
    }

    /// One step of the walk. `prev` is the last event kept in the list.
    fn step(&mut self, rate: usize, prev: &mut Link) -> Step {
        let current = match self.next_of(rate, *prev) {
            Some(current) => current,
            None => match self.rates[rate].armed.take() {
                Some(armed) => {
                    self.set_next(rate, *prev, Some(armed));
                    armed
                }
                None => return Step::Done,
            },
        };

        let now = self.rates[rate].ticks;
        let slot = &mut self.slots[usize::from(current)];
        if slot.ctr == 0 {
            // disarmed earlier; drop it now
            let next = slot.next.take();
            slot.linked = false;
            self.set_next(rate, *prev, next);
            return Step::Continue;
        }
        if slot.counted == Some(now) {
            // expired earlier in this walk and armed again since
            *prev = Link::Slot(current);
            return Step::Continue;
        }

        slot.counted = Some(now);
        slot.ctr -= 1;
        if slot.ctr != 0 {
            *prev = Link::Slot(current);
            return Step::Continue;
        }

        let expired = Expired {
            id: current,
            signal: slot.signal,
            target: slot.target,
            one_shot: slot.interval == 0,
        };
        if expired.one_shot {
            let next = slot.next.take();
            slot.linked = false;
            self.set_next(rate, *prev, next);
        } else {
            slot.ctr = slot.interval;
            *prev = Link::Slot(current);
        }
        Step::Expired(expired)
    }
}

impl Framework {
    /// Allocates a disarmed time event that posts `config.signal` to
    /// `target`.
    pub fn new_time_event(&self, target: Priority, config: TimeEventConfig) -> TimeEventId {
        let signal = config.signal;
        q_require!(MODULE, 600, signal.is_user(), "{signal} is reserved");
        let id = critical_section::with(|cs| {
            self.timers
                .borrow_ref_mut(cs)
                .add(signal, target, config.tick_rate)
        });
        match id {
            Some(id) => id,
            None => q_error!(
                MODULE,
                601,
                "cannot add a time event at rate {} (table of {} or rate out of range)",
                config.tick_rate,
                self.config().max_time_events
            ),
        }
    }

    /// Arms `te` to expire after `ticks` ticks, then every `interval` ticks
    /// (0 for one-shot).
    pub fn arm(&self, te: TimeEventId, ticks: u32, interval: u32) {
        q_require!(MODULE, 610, ticks > 0, "{te} armed with zero ticks");
        match critical_section::with(|cs| self.timers.borrow_ref_mut(cs).arm(te, ticks, interval)) {
            Arm::Armed => {}
            Arm::AlreadyArmed => q_error!(MODULE, 611, "{te} is already armed"),
            Arm::Unknown => q_error!(MODULE, 612, "{te} does not exist"),
        }
        self.trace_with(records::TIMEEVT_ARM, || {
            RecordBuf::new().u16(te.0).u32(ticks).u32(interval)
        });
    }

    /// Stops `te`. Returns `true` if it was armed.
    pub fn disarm(&self, te: TimeEventId) -> bool {
        let previous = critical_section::with(|cs| {
            let mut engine = self.timers.borrow_ref_mut(cs);
            engine.slots.get_mut(te.index()).map(|slot| {
                let previous = (slot.ctr, slot.interval);
                slot.ctr = 0;
                previous
            })
        });
        let Some((ctr, interval)) = previous else {
            q_error!(MODULE, 620, "{te} does not exist");
        };
        if ctr != 0 {
            self.trace_with(records::TIMEEVT_DISARM, || {
                RecordBuf::new().u16(te.0).u32(ctr).u32(interval)
            });
            true
        } else {
            self.trace_with(records::TIMEEVT_DISARM_ATTEMPT, || RecordBuf::new().u16(te.0));
            false
        }
    }

    /// Restarts `te` with a new countdown, keeping its interval. Returns
    /// `true` if it was still armed.
    pub fn rearm(&self, te: TimeEventId, ticks: u32) -> bool {
        q_require!(MODULE, 630, ticks > 0, "{te} rearmed with zero ticks");
        let was_armed = critical_section::with(|cs| {
            let mut engine = self.timers.borrow_ref_mut(cs);
            let slot = engine.slots.get_mut(te.index())?;
            let was_armed = slot.ctr != 0;
            slot.ctr = ticks;
            if !slot.linked {
                engine.link(te);
            }
            Some(was_armed)
        });
        let Some(was_armed) = was_armed else {
            q_error!(MODULE, 631, "{te} does not exist");
        };
        self.trace_with(records::TIMEEVT_REARM, || {
            RecordBuf::new().u16(te.0).u32(ticks).u8(u8::from(was_armed))
        });
        was_armed
    }

    pub fn is_armed(&self, te: TimeEventId) -> bool {
        self.time_event_counter(te) != 0
    }

    /// Ticks left until `te` expires, 0 while disarmed.
    pub fn time_event_counter(&self, te: TimeEventId) -> u32 {
        critical_section::with(|cs| self.timers.borrow_ref(cs).slot(te).map(|slot| slot.ctr))
            .unwrap_or(0)
    }

    /// Number of ticks processed at `rate`.
    pub fn tick_count(&self, rate: u8) -> u32 {
        critical_section::with(|cs| {
            self.timers
                .borrow_ref(cs)
                .rates
                .get(usize::from(rate))
                .map_or(0, |list| list.ticks)
        })
    }

    /// `true` if no time event is linked at `rate`.
    pub fn no_active_timers(&self, rate: u8) -> bool {
        critical_section::with(|cs| {
            self.timers
                .borrow_ref(cs)
                .rates
                .get(usize::from(rate))
                .map_or(true, |list| list.head.is_none() && list.armed.is_none())
        })
    }

    /// Processes one tick at `rate`.
    ///
    /// Ticks of the same rate must not overlap.
    pub fn tick(&self, rate: u8) {
        self.tick_x(rate, None);
    }

    /// Interrupt-context variant of [`tick`](Self::tick). Does not take the
    /// scheduler lock.
    pub fn tick_from_isr(&self, rate: u8, isr: &mut IsrContext) {
        self.tick_x(rate, Some(isr));
    }

    /// Disarms every time event that targets `prio`.
    pub(crate) fn disarm_targeting(&self, prio: Priority) {
        critical_section::with(|cs| {
            let mut engine = self.timers.borrow_ref_mut(cs);
            for slot in engine.slots.iter_mut().filter(|slot| slot.target == prio) {
                slot.ctr = 0;
            }
        });
    }

    fn tick_x(&self, rate: u8, mut isr: Option<&mut IsrContext>) {
        let index = usize::from(rate);
        let begun = critical_section::with(|cs| {
            let mut engine = self.timers.borrow_ref_mut(cs);
            let list = engine.rates.get_mut(index)?;
            if list.in_tick {
                return Some(None);
            }
            list.in_tick = true;
            list.ticks = list.ticks.wrapping_add(1);
            Some(Some(list.ticks))
        });
        let ticks = match begun {
            Some(Some(ticks)) => ticks,
            Some(None) => q_error!(MODULE, 640, "nested tick at rate {rate}"),
            None => q_error!(MODULE, 641, "tick rate {rate} out of range"),
        };
        self.trace_with(records::TICK, || RecordBuf::new().u32(ticks).u8(rate));

        // held across walk and posts so no target retires in between
        let _sched = isr.is_none().then(|| self.sched_lock.lock());
        let mut expired: heapless::Vec<Expired, MAX_TIME_EVENTS> = heapless::Vec::new();
        let mut prev = Link::Head;
        loop {
            match critical_section::with(|cs| self.timers.borrow_ref_mut(cs).step(index, &mut prev)) {
                Step::Done => break,
                Step::Continue => {}
                Step::Expired(fired) => {
                    if expired.push(fired).is_err() {
                        q_error!(MODULE, 642, "more expirations than time events");
                    }
                }
            }
        }

        critical_section::with(|cs| {
            if let Some(list) = self.timers.borrow_ref_mut(cs).rates.get_mut(index) {
                list.in_tick = false;
            }
        });

        // stable: walk order is kept among events of one target
        expired.sort_by_key(|fired| Reverse(fired.target));

        for fired in expired {
            if fired.one_shot {
                self.trace_with(records::TIMEEVT_AUTO_DISARM, || {
                    RecordBuf::new().u16(fired.id).u8(fired.target.raw()).u8(rate)
                });
            }
            self.trace_with(records::TIMEEVT_POST, || {
                RecordBuf::new()
                    .u16(fired.id)
                    .u16(fired.signal.raw())
                    .u8(fired.target.raw())
                    .u8(rate)
            });
            self.post_no_margin(
                fired.target,
                EventRef::Static(fired.signal),
                false,
                isr.as_deref_mut(),
            );
        }
    }
}
