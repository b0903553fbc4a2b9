//! Priority-indexed table of live active objects.

use crate::active::ActiveObjectRef;
use crate::priority::{Priority, PrioritySet, MAX_ACTIVE};

pub(crate) struct Registry {
    slots: Vec<Option<ActiveObjectRef>>,
    live: PrioritySet,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![None; MAX_ACTIVE + 1],
            live: PrioritySet::EMPTY,
        }
    }

    /// Installs `active` under its priority. Returns `false` if the slot is
    /// taken.
    pub(crate) fn register(&mut self, active: ActiveObjectRef) -> bool {
        let prio = active.priority();
        let slot = &mut self.slots[prio.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(active);
        self.live.insert(prio);
        true
    }

    pub(crate) fn unregister(&mut self, prio: Priority) -> Option<ActiveObjectRef> {
        self.live.remove(prio);
        self.slots[prio.index()].take()
    }

    pub(crate) fn get(&self, prio: Priority) -> Option<ActiveObjectRef> {
        self.slots[prio.index()].clone()
    }

    pub(crate) fn contains(&self, prio: Priority) -> bool {
        self.live.contains(prio)
    }

    pub(crate) fn live(&self) -> PrioritySet {
        self.live
    }
}
