//! Interrupt-context bookkeeping.
//!
//! The `*_from_isr` operations never block and never take the scheduler
//! lock. Instead of waking tasks behind the interrupt's back they record the
//! highest priority they made ready in an [`IsrContext`]; the interrupt
//! handler hands that to the host scheduler once it leaves the critical
//! section.

use crate::priority::Priority;

#[derive(Debug, Default)]
pub struct IsrContext {
    woken: Option<Priority>,
}

impl IsrContext {
    /// Opens the bookkeeping for one interrupt.
    pub const fn enter() -> Self {
        Self { woken: None }
    }

    /// Highest priority made ready so far.
    pub fn woken_priority(&self) -> Option<Priority> {
        self.woken
    }

    /// `true` if some task became ready whose priority exceeds `running`.
    pub fn higher_priority_woken(&self, running: Option<Priority>) -> bool {
        match (self.woken, running) {
            (Some(woken), Some(running)) => woken > running,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub(crate) fn note_woken(&mut self, prio: Priority) {
        if self.woken.map_or(true, |woken| prio > woken) {
            self.woken = Some(prio);
        }
    }

    /// Closes the interrupt and yields the priority to switch to, if any.
    pub fn exit(self) -> Option<Priority> {
        self.woken
    }
}
