//! Framework object: configuration, event pools, the active-object registry
//! and lifecycle.

use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex as CsMutex;

use crate::active::{ActiveContext, ActiveCore, ActiveObjectRef, ActiveState};
use crate::assert::q_require;
use crate::error::{QfError, QfResult};
use crate::event::{EventRef, Signal};
use crate::pool::{BlockPool, PoolStats};
use crate::port::{HostScheduler, TaskAttrs};
use crate::priority::{Priority, MAX_ACTIVE};
use crate::publish::SubscriberTable;
use crate::queue::QueueStats;
use crate::registry::Registry;
use crate::sync::{Arc, SchedulerGuard, SchedulerLock};
use crate::time::{TimeEngine, MAX_TIME_EVENTS};
use crate::trace::{self, RecordBuf, TraceHook};

const MODULE: &str = "qf_fw";

/// Static sizing of the framework.
#[derive(Clone)]
pub struct FrameworkConfig {
    pub name: &'static str,
    /// Highest priority an active object may use, at most 64.
    pub max_active: u8,
    /// Signals in `Signal::USER..max_pub_signal` can be published.
    pub max_pub_signal: u16,
    pub max_tick_rate: u8,
    pub max_time_events: usize,
    /// Called by [`Framework::run`].
    pub on_startup: Option<fn()>,
    /// Called by [`Framework::stop`].
    pub on_cleanup: Option<fn()>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            name: "QF",
            max_active: 32,
            max_pub_signal: 64,
            max_tick_rate: 2,
            max_time_events: 32,
            on_startup: None,
            on_cleanup: None,
        }
    }
}

impl fmt::Debug for FrameworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameworkConfig")
            .field("name", &self.name)
            .field("max_active", &self.max_active)
            .field("max_pub_signal", &self.max_pub_signal)
            .field("max_tick_rate", &self.max_tick_rate)
            .field("max_time_events", &self.max_time_events)
            .field("on_startup", &self.on_startup.is_some())
            .field("on_cleanup", &self.on_cleanup.is_some())
            .finish()
    }
}

impl FrameworkConfig {
    pub fn builder() -> FrameworkConfigBuilder {
        FrameworkConfigBuilder::default()
    }

    fn validate(&self) -> QfResult<()> {
        if self.max_active == 0 || usize::from(self.max_active) > MAX_ACTIVE {
            return Err(QfError::Config("max_active must be within 1..=64"));
        }
        if self.max_pub_signal < Signal::USER.raw() {
            return Err(QfError::Config("max_pub_signal is below the first user signal"));
        }
        if self.max_tick_rate == 0 {
            return Err(QfError::Config("at least one tick rate is required"));
        }
        if self.max_time_events > MAX_TIME_EVENTS {
            return Err(QfError::Config("max_time_events exceeds the time event table"));
        }
        Ok(())
    }
}

/// Builder for ergonomic framework configuration construction.
#[derive(Debug, Clone, Default)]
pub struct FrameworkConfigBuilder {
    config: FrameworkConfig,
}

impl FrameworkConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    pub fn max_active(mut self, max: u8) -> Self {
        self.config.max_active = max;
        self
    }

    pub fn max_pub_signal(mut self, max: u16) -> Self {
        self.config.max_pub_signal = max;
        self
    }

    pub fn max_tick_rate(mut self, max: u8) -> Self {
        self.config.max_tick_rate = max;
        self
    }

    pub fn max_time_events(mut self, max: usize) -> Self {
        self.config.max_time_events = max;
        self
    }

    pub fn on_startup(mut self, callback: fn()) -> Self {
        self.config.on_startup = Some(callback);
        self
    }

    pub fn on_cleanup(mut self, callback: fn()) -> Self {
        self.config.on_cleanup = Some(callback);
        self
    }

    pub fn build(self) -> FrameworkConfig {
        self.config
    }
}

/// Assembles a [`Framework`]: configuration, event pools and trace hook.
pub struct FrameworkBuilder {
    config: FrameworkConfig,
    pools: Vec<(usize, usize)>,
    trace: Option<TraceHook>,
}

impl FrameworkBuilder {
    pub fn new(config: FrameworkConfig) -> Self {
        Self {
            config,
            pools: Vec::new(),
            trace: None,
        }
    }

    /// Adds an event pool of `blocks` blocks, `block_size` bytes each.
    ///
    /// Pools must be added in strictly increasing block size.
    pub fn pool(mut self, block_size: usize, blocks: usize) -> Self {
        self.pools.push((block_size, blocks));
        self
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> QfResult<Arc<Framework>> {
        self.config.validate()?;
        if self.pools.len() > usize::from(u8::MAX) {
            return Err(QfError::Config("too many event pools"));
        }
        let mut previous = 0;
        for &(block_size, blocks) in &self.pools {
            if block_size == 0 || blocks == 0 || blocks > usize::from(u16::MAX) {
                return Err(QfError::Config("event pool sizing out of range"));
            }
            if block_size <= previous {
                return Err(QfError::Config(
                    "event pools must have strictly increasing block sizes",
                ));
            }
            previous = block_size;
        }

        let pools = self
            .pools
            .iter()
            .zip(1u8..)
            .map(|(&(block_size, blocks), id)| BlockPool::new(id, block_size, blocks))
            .collect();

        log::debug!(
            "{}: {} event pools, max_active {}",
            self.config.name,
            self.pools.len(),
            self.config.max_active
        );

        Ok(Arc::new(Framework {
            subscribers: CsMutex::new(RefCell::new(SubscriberTable::new(
                self.config.max_pub_signal,
            ))),
            timers: CsMutex::new(RefCell::new(TimeEngine::new(
                self.config.max_tick_rate,
                self.config.max_time_events,
            ))),
            registry: CsMutex::new(RefCell::new(Registry::new())),
            sched_lock: SchedulerLock::new(),
            running: AtomicBool::new(false),
            trace: self.trace,
            pools,
            config: self.config,
        }))
    }
}

/// The runtime core shared by every active object, interrupt handler and
/// tick source.
pub struct Framework {
    config: FrameworkConfig,
    pub(crate) pools: Vec<BlockPool>,
    pub(crate) registry: CsMutex<RefCell<Registry>>,
    pub(crate) subscribers: CsMutex<RefCell<SubscriberTable>>,
    pub(crate) timers: CsMutex<RefCell<TimeEngine>>,
    pub(crate) sched_lock: SchedulerLock,
    trace: Option<TraceHook>,
    running: AtomicBool,
}

impl Framework {
    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder::new(FrameworkConfig::default())
    }

    pub fn with_config(config: FrameworkConfig) -> FrameworkBuilder {
        FrameworkBuilder::new(config)
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn trace_hook(&self) -> Option<TraceHook> {
        self.trace.clone()
    }

    pub(crate) fn trace_with(&self, record: u8, payload: impl FnOnce() -> RecordBuf) {
        if self.trace.is_some() {
            trace::emit(self.trace.as_ref(), record, payload());
        }
    }

    /// Registers `active`, runs its initial transition, then hands it to
    /// `scheduler` to run its dispatch loop.
    ///
    /// `initial` is passed to the behavior's `on_start` and stays owned by
    /// the caller.
    pub fn start_active(
        self: &Arc<Self>,
        active: ActiveObjectRef,
        scheduler: &dyn HostScheduler,
        attrs: TaskAttrs,
        initial: Option<EventRef>,
    ) -> QfResult<()> {
        let core = active.core();
        let prio = core.priority();
        q_require!(
            MODULE,
            700,
            prio.raw() <= self.config.max_active,
            "{prio} exceeds max_active {}",
            self.config.max_active
        );
        let fresh = core.transition(ActiveState::Created, ActiveState::Registered);
        q_require!(MODULE, 701, fresh, "{prio} was already started");

        let entry = Arc::clone(&active);
        let registered =
            critical_section::with(|cs| self.registry.borrow_ref_mut(cs).register(entry));
        q_require!(MODULE, 702, registered, "{prio} is already taken");

        {
            let mut ctx = ActiveContext::new(self, core);
            active.init(&mut ctx, initial);
        }
        core.set_state(ActiveState::Running);
        log::debug!("{prio} started as {:?}", attrs.name);

        if let Err(err) = scheduler.spawn(Arc::clone(&active), Arc::clone(self), &attrs) {
            log::error!("{prio} could not be spawned: {err}");
            core.set_state(ActiveState::Stopping);
            self.retire(core);
            return Err(err);
        }
        Ok(())
    }

    /// Removes a stopping active object: drops its subscriptions and timers,
    /// unregisters it and garbage-collects whatever is still queued.
    pub(crate) fn retire(&self, core: &ActiveCore) {
        let prio = core.priority();
        let removed = {
            // no publish or tick fan-out may be half way through
            let _sched = self.sched_lock.lock();
            self.unsubscribe_all(prio);
            self.disarm_targeting(prio);
            critical_section::with(|cs| self.registry.borrow_ref_mut(cs).unregister(prio))
        };
        drop(removed);

        let mut discarded = 0usize;
        while let Some(event) = core.take() {
            self.gc(event);
            discarded += 1;
        }
        core.set_state(ActiveState::Removed);
        log::debug!("{prio} removed, {discarded} queued events discarded");
    }

    /// Live active object at `prio`.
    pub fn active(&self, prio: Priority) -> Option<ActiveObjectRef> {
        critical_section::with(|cs| self.registry.borrow_ref(cs).get(prio))
    }

    pub(crate) fn is_registered(&self, prio: Priority) -> bool {
        critical_section::with(|cs| self.registry.borrow_ref(cs).contains(prio))
    }

    /// Dispatches one event of the highest-priority active object that has
    /// one, retiring stopped objects on the way. For hosts that drive the
    /// dispatch loops themselves.
    pub fn dispatch_ready(&self) -> bool {
        let live = critical_section::with(|cs| self.registry.borrow_ref(cs).live());
        for prio in live.iter_descending() {
            let Some(active) = self.active(prio) else {
                continue;
            };
            match active.state() {
                ActiveState::Stopping => self.retire(active.core()),
                ActiveState::Running if active.dispatch_one(self) => return true,
                _ => {}
            }
        }
        false
    }

    pub fn run_until_idle(&self) {
        while self.dispatch_ready() {}
    }

    /// Marks the framework as running and invokes the startup callback.
    pub fn run(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("{} running", self.config.name);
        if let Some(on_startup) = self.config.on_startup {
            on_startup();
        }
    }

    /// Asks every live active object to stop and invokes the cleanup
    /// callback.
    pub fn stop(&self) {
        let live = critical_section::with(|cs| self.registry.borrow_ref(cs).live());
        for prio in live.iter_descending() {
            if let Some(active) = self.active(prio) {
                active.stop();
            }
        }
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(on_cleanup) = self.config.on_cleanup {
                on_cleanup();
            }
        }
        log::info!("{} stopped", self.config.name);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Holds off every dispatch loop until the guard is dropped.
    ///
    /// Nests on the calling thread, which may keep posting, publishing and
    /// ticking while it holds the guard.
    pub fn lock_scheduler(&self) -> SchedulerGuard<'_> {
        self.sched_lock.lock()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Usage of event pool `pool_id` (1-based).
    pub fn pool_stats(&self, pool_id: u8) -> Option<PoolStats> {
        let index = usize::from(pool_id).checked_sub(1)?;
        self.pools.get(index).map(BlockPool::stats)
    }

    /// Low-water mark of free blocks in pool `pool_id`.
    pub fn pool_min(&self, pool_id: u8) -> Option<usize> {
        self.pool_stats(pool_id).map(|stats| stats.min_free_blocks)
    }

    pub fn queue_stats(&self, prio: Priority) -> Option<QueueStats> {
        self.active(prio).map(|active| active.core().queue_stats())
    }

    /// Low-water mark of free entries in the queue at `prio`.
    pub fn queue_min(&self, prio: Priority) -> Option<usize> {
        self.queue_stats(prio).map(|stats| stats.min_free)
    }
}
