use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::active::{new_active_object, ActiveContext, ActiveObjectRef, SignalHandler};
use crate::event::Signal;
use crate::framework::Framework;
use crate::port::{ManualScheduler, TaskAttrs};
use crate::priority::Priority;
use crate::trace::TraceHook;

mod active;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub(crate) fn init_logging() {
    Lazy::force(&LOGGER);
}

pub(crate) fn prio(raw: u8) -> Priority {
    Priority::new(raw).unwrap()
}

#[derive(Clone, Default)]
pub(crate) struct Collector {
    events: Arc<Mutex<Vec<Signal>>>,
}

impl Collector {
    pub(crate) fn signals(&self) -> Vec<Signal> {
        self.events.lock().unwrap().clone()
    }
}

impl SignalHandler for Collector {
    fn handle_signal(&mut self, signal: Signal, _ctx: &mut ActiveContext<'_>) {
        self.events.lock().unwrap().push(signal);
    }
}

/// Keeps every trace record emitted by a framework.
#[derive(Clone, Default)]
pub(crate) struct TraceLog {
    records: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
}

impl TraceLog {
    pub(crate) fn hook(&self) -> TraceHook {
        let records = Arc::clone(&self.records);
        Arc::new(move |record, payload, _| {
            records.lock().unwrap().push((record, payload.to_vec()));
            Ok(())
        })
    }

    pub(crate) fn payloads(&self, record: u8) -> Vec<Vec<u8>> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == record)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Target priorities of the direct posts seen so far, in order.
    pub(crate) fn post_targets(&self) -> Vec<u8> {
        self.payloads(crate::trace::records::ACTIVE_POST)
            .iter()
            .map(|payload| payload[2])
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

/// Two pools: four 16-byte blocks and two 64-byte blocks.
pub(crate) fn framework() -> Arc<Framework> {
    init_logging();
    Framework::builder().pool(16, 4).pool(64, 2).build().unwrap()
}

pub(crate) fn traced_framework(log: &TraceLog) -> Arc<Framework> {
    init_logging();
    Framework::builder()
        .pool(16, 4)
        .pool(64, 2)
        .with_trace_hook(log.hook())
        .build()
        .unwrap()
}

/// Starts a [`Collector`] at `raw` with a manually driven dispatch loop.
pub(crate) fn start_collector(
    framework: &Arc<Framework>,
    raw: u8,
    queue_capacity: usize,
) -> (ActiveObjectRef, Collector) {
    let collector = Collector::default();
    let sink = collector.clone();
    let active = new_active_object(prio(raw), queue_capacity, collector);
    framework
        .start_active(Arc::clone(&active), &ManualScheduler, TaskAttrs::new("test"), None)
        .unwrap();
    (active, sink)
}
