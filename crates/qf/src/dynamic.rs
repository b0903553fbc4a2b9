//! Pool-backed events: allocation, reference counting and garbage
//! collection.
//!
//! A fresh event starts with a reference count of 0. Every queue that holds
//! it adds one, and so does every explicit [`Framework::retain`]. A
//! garbage-collection step decrements the count while it is above 1 and
//! recycles the block otherwise, so an event that was allocated but never
//! posted is freed by its first collection.

use critical_section::CriticalSection;

use crate::assert::{q_error, q_require};
use crate::event::{EventRef, Margin, PoolEvent, Signal};
use crate::framework::Framework;
use crate::isr::IsrContext;
use crate::pool::BlockPool;
use crate::trace::{records, RecordBuf};

const MODULE: &str = "qf_dyn";

pub(crate) enum Retain {
    Held,
    Stale,
    Saturated,
}

enum Collect {
    Released(u8),
    Recycle,
    Stale,
}

impl Framework {
    /// Allocates an event of at least `size` bytes from the smallest pool
    /// that fits.
    ///
    /// Returns `None` when the pool cannot honor `margin`. Under
    /// [`Margin::NoMargin`] exhaustion halts the system, as does a `size`
    /// no pool can hold.
    pub fn new_event(&self, size: usize, margin: Margin, signal: Signal) -> Option<EventRef> {
        let Some(pool) = self.pools.iter().find(|pool| pool.block_size() >= size) else {
            q_error!(MODULE, 200, "no event pool holds {size} bytes");
        };

        let Some(block) = pool.get(margin.threshold()) else {
            q_require!(
                MODULE,
                201,
                margin != Margin::NoMargin,
                "pool {} exhausted allocating {signal}",
                pool.id()
            );
            log::debug!("pool {} cannot spare a block for {signal} ({margin:?})", pool.id());
            self.trace_with(records::MPOOL_GET_ATTEMPT, || pool_record(pool));
            self.trace_with(records::NEW_ATTEMPT, || {
                RecordBuf::new().u16(signal.raw()).count(size)
            });
            return None;
        };

        let event = EventRef::Pooled(PoolEvent::new(signal, pool.id(), block));
        self.trace_with(records::MPOOL_GET, || pool_record(pool));
        self.trace_with(records::NEW, || RecordBuf::new().u16(signal.raw()).count(size));
        Some(event)
    }

    /// Interrupt-context variant of [`new_event`](Self::new_event).
    ///
    /// Allocation never wakes a task; the context is taken for symmetry with
    /// the other interrupt entry points.
    pub fn new_event_from_isr(
        &self,
        size: usize,
        margin: Margin,
        signal: Signal,
        _isr: &mut IsrContext,
    ) -> Option<EventRef> {
        self.new_event(size, margin, signal)
    }

    /// Allocates an event and copies `payload` into its block.
    pub fn new_event_with(
        &self,
        signal: Signal,
        margin: Margin,
        payload: &[u8],
    ) -> Option<EventRef> {
        let event = self.new_event(payload.len(), margin, signal)?;
        self.payload_mut(event, |bytes| bytes[..payload.len()].copy_from_slice(payload));
        Some(event)
    }

    /// Takes an extra reference on a pool event. No-op for static events.
    pub fn retain(&self, event: EventRef) {
        match critical_section::with(|cs| self.retain_in(cs, event)) {
            Retain::Held => {}
            Retain::Stale => q_error!(MODULE, 210, "retain of recycled {event}"),
            Retain::Saturated => q_error!(MODULE, 211, "reference count of {event} saturated"),
        }
    }

    /// Garbage-collection step: drops one reference and recycles the block
    /// when no other holder remains. No-op for static events.
    pub fn gc(&self, event: EventRef) {
        let EventRef::Pooled(evt) = event else {
            return;
        };
        let pool = self.pool_of(evt);

        let outcome = critical_section::with(|cs| {
            let Some(mut header) = pool.header_mut(cs, evt.block()) else {
                return Collect::Stale;
            };
            if header.ref_count > 1 {
                header.ref_count -= 1;
                Collect::Released(header.ref_count)
            } else {
                Collect::Recycle
            }
        });

        match outcome {
            Collect::Released(remaining) => {
                self.trace_with(records::GC_ATTEMPT, || {
                    RecordBuf::new()
                        .u16(evt.signal().raw())
                        .u8(evt.pool_id())
                        .u8(remaining)
                });
            }
            Collect::Recycle => {
                pool.put(evt.block());
                self.trace_with(records::GC, || {
                    RecordBuf::new().u16(evt.signal().raw()).u8(evt.pool_id())
                });
                self.trace_with(records::MPOOL_PUT, || pool_record(pool));
            }
            Collect::Stale => q_error!(MODULE, 220, "garbage collection of recycled {event}"),
        }
    }

    /// Interrupt-context variant of [`gc`](Self::gc).
    pub fn gc_from_isr(&self, event: EventRef, _isr: &mut IsrContext) {
        self.gc(event);
    }

    /// Current reference count, or `None` for static and recycled events.
    pub fn ref_count(&self, event: EventRef) -> Option<u8> {
        let evt = event.as_pooled()?;
        let pool = self.pools.get(usize::from(evt.pool_id()).checked_sub(1)?)?;
        critical_section::with(|cs| {
            pool.header_mut(cs, evt.block())
                .map(|header| header.ref_count)
        })
    }

    /// Reads the payload bytes of a pool event. Static events have none.
    pub fn payload<R>(&self, event: EventRef, f: impl FnOnce(&[u8]) -> R) -> R {
        match event {
            EventRef::Static(_) => f(&[]),
            EventRef::Pooled(evt) => self.pool_of(evt).with_block(evt.block(), f),
        }
    }

    /// Writes the payload bytes of a pool event. Static events have none.
    pub fn payload_mut<R>(&self, event: EventRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match event {
            EventRef::Static(_) => f(&mut []),
            EventRef::Pooled(evt) => self.pool_of(evt).with_block_mut(evt.block(), f),
        }
    }

    pub(crate) fn retain_in(&self, cs: CriticalSection<'_>, event: EventRef) -> Retain {
        let EventRef::Pooled(evt) = event else {
            return Retain::Held;
        };
        let Some(pool) = self.pools.get(usize::from(evt.pool_id()).wrapping_sub(1)) else {
            return Retain::Stale;
        };
        let Some(mut header) = pool.header_mut(cs, evt.block()) else {
            return Retain::Stale;
        };
        match header.ref_count.checked_add(1) {
            Some(count) => {
                header.ref_count = count;
                Retain::Held
            }
            None => Retain::Saturated,
        }
    }

    fn pool_of(&self, evt: PoolEvent) -> &BlockPool {
        let index = usize::from(evt.pool_id()).wrapping_sub(1);
        match self.pools.get(index) {
            Some(pool) => pool,
            None => q_error!(MODULE, 230, "event pool {} does not exist", evt.pool_id()),
        }
    }
}

fn pool_record(pool: &BlockPool) -> RecordBuf {
    let stats = pool.stats();
    RecordBuf::new()
        .u8(stats.pool_id)
        .count(stats.free_blocks)
        .count(stats.min_free_blocks)
}
