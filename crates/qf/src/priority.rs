//! Active object priorities and priority sets.

use core::fmt;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Highest number of active objects the framework can register.
pub const MAX_ACTIVE: usize = 64;

/// Priority of an active object, `1..=MAX_ACTIVE`; higher value wins.
///
/// Priorities are unique keys: at most one live active object per value.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority level.
    pub const MIN: Priority = Priority(1);

    /// Highest priority level.
    pub const MAX: Priority = Priority(MAX_ACTIVE as u8);

    /// Returns `None` for 0 (reserved for idle) or values above `MAX_ACTIVE`.
    pub const fn new(raw: u8) -> Option<Self> {
        if raw == 0 || raw as usize > MAX_ACTIVE {
            None
        } else {
            Some(Priority(raw))
        }
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    const fn bit(self) -> u64 {
        1u64 << (self.0 - 1)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio({})", self.0)
    }
}

/// Builds a [`Priority`] from a constant, rejecting out-of-range values at
/// compile time.
#[macro_export]
macro_rules! priority {
    ($value:expr) => {{
        const PRIO: $crate::Priority = match $crate::Priority::new($value) {
            Some(prio) => prio,
            None => panic!("priority out of range"),
        };
        PRIO
    }};
}

/// Set of priorities backed by a single bitmask.
///
/// Used for subscriber lists; iteration goes from the highest priority down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrioritySet(u64);

impl PrioritySet {
    pub const EMPTY: Self = Self(0);

    pub const fn new() -> Self {
        Self::EMPTY
    }

    pub fn insert(&mut self, prio: Priority) {
        self.0 |= prio.bit();
    }

    pub fn remove(&mut self, prio: Priority) {
        self.0 &= !prio.bit();
    }

    pub const fn contains(&self, prio: Priority) -> bool {
        self.0 & prio.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Highest priority in the set.
    pub fn highest(&self) -> Option<Priority> {
        if self.is_empty() {
            None
        } else {
            Some(Priority((u64::BITS - self.0.leading_zeros()) as u8))
        }
    }

    /// Lowest priority in the set.
    pub fn lowest(&self) -> Option<Priority> {
        if self.is_empty() {
            None
        } else {
            Some(Priority((self.0.trailing_zeros() + 1) as u8))
        }
    }

    /// Drains a copy of the set in descending priority order.
    pub fn iter_descending(self) -> impl Iterator<Item = Priority> {
        let mut rest = self;
        core::iter::from_fn(move || {
            let prio = rest.highest()?;
            rest.remove(prio);
            Some(prio)
        })
    }
}
