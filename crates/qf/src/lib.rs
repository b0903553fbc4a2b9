//! # qf-core
//!
//! Runtime core of an active-object framework: prioritized, event-driven
//! tasks that talk to each other only through events, each processing one
//! event to completion before taking the next.
//!
//! ## Module Overview
//! - [`pool`]     – fixed-block memory pools with generational block handles.
//! - [`event`]    – signals, margins and event handles.
//! - [`queue`]    – bounded event queue with a front slot.
//! - [`active`]   – active objects, dispatch loop and direct posting.
//! - [`publish`]  – publish/subscribe router with descending-priority delivery.
//! - [`time`]     – time events driven by per-rate tick lists.
//! - [`framework`] – configuration, pools, registry and lifecycle.
//! - [`port`]     – host scheduler seam (threads or manual dispatch).
//! - [`isr`]      – bookkeeping for the interrupt-context entry points.
//! - [`trace`]    – optional trace hook and record numbers.
//!
//! All shared state lives behind the global critical section provided by the
//! `critical-section` crate. Capacity exhaustion under an explicit margin is
//! reported to the caller; every other contract violation halts through
//! [`assert::on_assert`].

pub mod active;
pub mod assert;
mod dynamic;
pub mod error;
pub mod event;
pub mod framework;
pub mod isr;
pub mod pool;
pub mod port;
pub mod priority;
pub mod publish;
pub mod queue;
mod registry;
pub mod sync;
pub mod time;
pub mod trace;

pub use active::{
    new_active_object, ActiveBehavior, ActiveContext, ActiveCore, ActiveObject, ActiveObjectRef,
    ActiveRunnable, ActiveState, SignalHandler,
};
pub use error::{PostError, QfError, QfResult};
pub use event::{EventRef, Margin, PoolEvent, Signal};
pub use framework::{Framework, FrameworkBuilder, FrameworkConfig, FrameworkConfigBuilder};
pub use isr::IsrContext;
pub use pool::{Block, BlockPool, PoolStats};
#[cfg(feature = "std")]
pub use port::ThreadScheduler;
pub use port::{HostScheduler, ManualScheduler, TaskAttrs};
pub use priority::{Priority, PrioritySet, MAX_ACTIVE};
pub use queue::{EventQueue, QueueStats};
pub use time::{TimeEventConfig, TimeEventId, MAX_TIME_EVENTS};
pub use trace::{TraceError, TraceHook};

#[cfg(test)]
mod tests;
