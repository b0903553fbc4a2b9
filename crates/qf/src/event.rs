//! Signals, margins and event handles.
//!
//! An event is identified by its [`Signal`]. Static events carry nothing
//! else and are never reference counted. Pool events are generational
//! handles into a [`BlockPool`](crate::pool::BlockPool): the pool keeps the
//! reference count and the payload bytes, and bumps the slot generation when
//! the block is recycled so a stale handle is caught on its next use.

use core::fmt;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::pool::Block;

/// Identifier for an event type.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u16);

impl Signal {
    /// Reserved: empty event.
    pub const EMPTY: Signal = Signal(0);
    /// Reserved: state entry.
    pub const ENTRY: Signal = Signal(1);
    /// Reserved: state exit.
    pub const EXIT: Signal = Signal(2);
    /// Reserved: initial transition.
    pub const INIT: Signal = Signal(3);
    /// First signal available to applications.
    pub const USER: Signal = Signal(4);

    pub const fn new(raw: u16) -> Self {
        Signal(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_user(self) -> bool {
        self.0 >= Self::USER.0
    }
}

impl From<u16> for Signal {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG({:#06x})", self.0)
    }
}

/// Spare capacity a caller insists on leaving in a pool or queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Margin {
    /// The operation must succeed. Running out of room is a sizing error and
    /// halts the system.
    NoMargin,
    /// Succeed only if more than this many free entries remain; otherwise
    /// report "not available" and change nothing.
    Keep(usize),
}

impl Margin {
    pub(crate) const fn threshold(self) -> usize {
        match self {
            Margin::NoMargin => 0,
            Margin::Keep(margin) => margin,
        }
    }
}

/// Handle to an event living in a block pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolEvent {
    signal: Signal,
    pool_id: u8,
    block: Block,
}

impl PoolEvent {
    pub(crate) const fn new(signal: Signal, pool_id: u8, block: Block) -> Self {
        Self {
            signal,
            pool_id,
            block,
        }
    }

    pub const fn signal(&self) -> Signal {
        self.signal
    }

    /// One-based index of the originating pool.
    pub const fn pool_id(&self) -> u8 {
        self.pool_id
    }

    pub const fn block(&self) -> Block {
        self.block
    }
}

/// Reference to an event as it travels through queues.
///
/// Copying the handle does not take a reference; only [`retain`] and queue
/// posts do, and each must be balanced by one garbage-collection step.
///
/// [`retain`]: crate::Framework::retain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventRef {
    /// Statically owned event; never counted or pooled.
    Static(Signal),
    /// Pool-allocated, reference-counted event.
    Pooled(PoolEvent),
}

impl EventRef {
    pub const fn signal(&self) -> Signal {
        match self {
            EventRef::Static(signal) => *signal,
            EventRef::Pooled(evt) => evt.signal,
        }
    }

    /// 0 for static events, otherwise the one-based pool index.
    pub const fn pool_id(&self) -> u8 {
        match self {
            EventRef::Static(_) => 0,
            EventRef::Pooled(evt) => evt.pool_id,
        }
    }

    pub const fn is_pooled(&self) -> bool {
        matches!(self, EventRef::Pooled(_))
    }

    pub const fn as_pooled(&self) -> Option<PoolEvent> {
        match self {
            EventRef::Static(_) => None,
            EventRef::Pooled(evt) => Some(*evt),
        }
    }
}

impl From<Signal> for EventRef {
    fn from(signal: Signal) -> Self {
        EventRef::Static(signal)
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventRef::Static(signal) => write!(f, "{signal}"),
            EventRef::Pooled(evt) => write!(
                f,
                "{}@pool{}#{}",
                evt.signal,
                evt.pool_id,
                evt.block.index()
            ),
        }
    }
}
