//! Publish/subscribe router.
//!
//! Each publishable signal maps to the set of subscribed priorities. A
//! publish snapshots that set and posts the event to every member, highest
//! priority first. In task context the fan-out runs under the scheduler
//! lock, so no subscriber starts processing before all of them have it.

use crate::assert::{q_error, q_require};
use crate::dynamic::Retain;
use crate::event::{EventRef, Signal};
use crate::framework::Framework;
use crate::isr::IsrContext;
use crate::priority::{Priority, PrioritySet};
use crate::trace::{records, RecordBuf};

const MODULE: &str = "qf_ps";

pub(crate) struct SubscriberTable {
    sets: Box<[PrioritySet]>,
}

impl SubscriberTable {
    pub(crate) fn new(max_pub_signal: u16) -> Self {
        Self {
            sets: vec![PrioritySet::EMPTY; usize::from(max_pub_signal)].into_boxed_slice(),
        }
    }

    fn is_publishable(&self, signal: Signal) -> bool {
        signal.is_user() && usize::from(signal.raw()) < self.sets.len()
    }

    fn get(&self, signal: Signal) -> PrioritySet {
        self.sets
            .get(usize::from(signal.raw()))
            .copied()
            .unwrap_or_default()
    }

    fn set_mut(&mut self, signal: Signal) -> &mut PrioritySet {
        &mut self.sets[usize::from(signal.raw())]
    }

    fn remove_everywhere(&mut self, prio: Priority) -> usize {
        let mut removed = 0;
        for set in self.sets.iter_mut().filter(|set| set.contains(prio)) {
            set.remove(prio);
            removed += 1;
        }
        removed
    }
}

impl Framework {
    /// Subscribes the active object at `prio` to `signal`.
    pub fn subscribe(&self, prio: Priority, signal: Signal) {
        self.require_subscriber(prio, signal);
        critical_section::with(|cs| self.subscribers.borrow_ref_mut(cs).set_mut(signal).insert(prio));
        self.trace_with(records::SUBSCRIBE, || {
            RecordBuf::new().u16(signal.raw()).u8(prio.raw())
        });
    }

    /// Drops the subscription of `prio` to `signal`. Unsubscribing a signal
    /// that was never subscribed is harmless.
    pub fn unsubscribe(&self, prio: Priority, signal: Signal) {
        self.require_subscriber(prio, signal);
        critical_section::with(|cs| self.subscribers.borrow_ref_mut(cs).set_mut(signal).remove(prio));
        self.trace_with(records::UNSUBSCRIBE, || {
            RecordBuf::new().u16(signal.raw()).u8(prio.raw())
        });
    }

    /// Drops every subscription held by `prio`.
    pub fn unsubscribe_all(&self, prio: Priority) {
        q_require!(
            MODULE,
            502,
            self.is_registered(prio),
            "{prio} is not a registered active object"
        );
        let removed =
            critical_section::with(|cs| self.subscribers.borrow_ref_mut(cs).remove_everywhere(prio));
        if removed > 0 {
            log::debug!("{prio} dropped {removed} subscriptions");
        }
    }

    /// Current subscribers of `signal`.
    pub fn subscribers(&self, signal: Signal) -> PrioritySet {
        critical_section::with(|cs| self.subscribers.borrow_ref(cs).get(signal))
    }

    /// Posts `event` to every subscriber of its signal, highest priority
    /// first.
    ///
    /// Each delivery must succeed; a full subscriber queue halts. The event
    /// is garbage-collected at the end, which frees it if nobody subscribed.
    pub fn publish(&self, event: EventRef) {
        self.publish_x(event, None);
    }

    /// Interrupt-context variant of [`publish`](Self::publish). Does not
    /// take the scheduler lock.
    pub fn publish_from_isr(&self, event: EventRef, isr: &mut IsrContext) {
        self.publish_x(event, Some(isr));
    }

    fn publish_x(&self, event: EventRef, mut isr: Option<&mut IsrContext>) {
        let signal = event.signal();
        // taken before the snapshot so no subscriber can retire under us
        let sched = isr.is_none().then(|| self.sched_lock.lock());
        let (publishable, subscribers, retained) = critical_section::with(|cs| {
            let table = self.subscribers.borrow_ref(cs);
            if !table.is_publishable(signal) {
                return (false, PrioritySet::EMPTY, Retain::Held);
            }
            // hold the event for the whole multicast
            (true, table.get(signal), self.retain_in(cs, event))
        });
        if !publishable {
            drop(sched);
            q_error!(MODULE, 510, "{signal} is outside the publishable range");
        }
        match retained {
            Retain::Held => {}
            Retain::Stale => {
                drop(sched);
                q_error!(MODULE, 511, "publish of recycled {event}")
            }
            Retain::Saturated => {
                drop(sched);
                q_error!(MODULE, 512, "reference count of {event} saturated")
            }
        }

        self.trace_with(records::PUBLISH, || {
            RecordBuf::new()
                .u16(signal.raw())
                .u8(event.pool_id())
                .u8(subscribers.len() as u8)
        });

        for prio in subscribers.iter_descending() {
            self.post_no_margin(prio, event, false, isr.as_deref_mut());
        }
        drop(sched);

        self.gc(event);
    }

    fn require_subscriber(&self, prio: Priority, signal: Signal) {
        let publishable =
            critical_section::with(|cs| self.subscribers.borrow_ref(cs).is_publishable(signal));
        q_require!(MODULE, 500, publishable, "{signal} is outside the publishable range");
        q_require!(
            MODULE,
            501,
            self.is_registered(prio),
            "{prio} is not a registered active object"
        );
    }
}
