//! Host scheduler seam.
//!
//! The framework never creates execution contexts on its own. Once an active
//! object is registered and initialized, [`Framework::start_active`] hands
//! it to a [`HostScheduler`], which must eventually call
//! [`ActiveRunnable::run`](crate::active::ActiveRunnable::run) on it.

use crate::active::ActiveObjectRef;
use crate::error::QfResult;
use crate::framework::Framework;
use crate::sync::Arc;
#[cfg(feature = "std")]
use crate::{error::QfError, sync::Mutex};

/// Attributes of the execution context created for an active object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAttrs {
    pub name: &'static str,
    /// Stack size in bytes.
    pub stack_size: usize,
}

impl Default for TaskAttrs {
    fn default() -> Self {
        Self {
            name: "AO",
            stack_size: 64 * 1024,
        }
    }
}

impl TaskAttrs {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }
}

/// Creates the execution context that runs an active object's dispatch loop.
pub trait HostScheduler {
    fn spawn(
        &self,
        active: ActiveObjectRef,
        framework: Arc<Framework>,
        attrs: &TaskAttrs,
    ) -> QfResult<()>;
}

/// Runs every active object on its own named OS thread.
#[cfg(feature = "std")]
#[derive(Default)]
pub struct ThreadScheduler {
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

#[cfg(feature = "std")]
impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for every spawned dispatch loop to finish.
    pub fn join_all(&self) {
        let handles = core::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let name = handle.thread().name().unwrap_or("AO").to_owned();
            if handle.join().is_err() {
                log::error!("dispatch loop {name} panicked");
            }
        }
    }
}

#[cfg(feature = "std")]
impl HostScheduler for ThreadScheduler {
    fn spawn(
        &self,
        active: ActiveObjectRef,
        framework: Arc<Framework>,
        attrs: &TaskAttrs,
    ) -> QfResult<()> {
        let priority = active.priority();
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", attrs.name, priority.raw()))
            .stack_size(attrs.stack_size)
            .spawn(move || active.run(&framework))
            .map_err(|source| QfError::Spawn { priority, source })?;
        self.handles.lock().push(handle);
        Ok(())
    }
}

/// Leaves every dispatch loop to the host, which drives them through
/// [`Framework::dispatch_ready`] or
/// [`ActiveRunnable::dispatch_one`](crate::active::ActiveRunnable::dispatch_one).
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualScheduler;

impl HostScheduler for ManualScheduler {
    fn spawn(
        &self,
        active: ActiveObjectRef,
        _framework: Arc<Framework>,
        attrs: &TaskAttrs,
    ) -> QfResult<()> {
        log::trace!("{} ({}) left to the host", active.priority(), attrs.name);
        Ok(())
    }
}
