use std::sync::{Arc, Mutex};

use super::{framework, prio, start_collector, traced_framework, TraceLog};
use crate::active::{
    new_active_object, ActiveBehavior, ActiveContext, ActiveObject, ActiveObjectRef, ActiveState,
};
use crate::event::{EventRef, Margin, Signal};
use crate::isr::IsrContext;
use crate::port::{ManualScheduler, TaskAttrs};
use crate::trace::records;

const SIG_A: Signal = Signal(0x10);
const SIG_B: Signal = Signal(0x11);
const SIG_C: Signal = Signal(0x12);
const SIG_ECHO: Signal = Signal(0x13);

#[test]
fn events_are_dispatched_in_fifo_order() {
    let fw = framework();
    let (_ao, sink) = start_collector(&fw, 1, 4);

    for signal in [SIG_A, SIG_B, SIG_C] {
        fw.post(prio(1), signal.into(), Margin::NoMargin).unwrap();
    }
    fw.run_until_idle();

    assert_eq!(sink.signals(), vec![SIG_A, SIG_B, SIG_C]);
}

#[test]
fn higher_priority_runs_first_under_manual_dispatch() {
    let log = Arc::new(Mutex::new(Vec::new()));

    struct Tagger {
        tag: u8,
        log: Arc<Mutex<Vec<u8>>>,
    }

    impl ActiveBehavior for Tagger {
        fn on_start(&mut self, _ctx: &mut ActiveContext<'_>, _initial: Option<EventRef>) {}

        fn on_event(&mut self, _ctx: &mut ActiveContext<'_>, _event: EventRef) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    let fw = framework();
    for raw in [2u8, 7] {
        let ao = new_active_object(
            prio(raw),
            2,
            Tagger {
                tag: raw,
                log: Arc::clone(&log),
            },
        );
        fw.start_active(ao, &ManualScheduler, TaskAttrs::default(), None)
            .unwrap();
    }

    fw.post(prio(2), SIG_A.into(), Margin::NoMargin).unwrap();
    fw.post(prio(7), SIG_A.into(), Margin::NoMargin).unwrap();
    fw.run_until_idle();

    assert_eq!(*log.lock().unwrap(), vec![7, 2]);
}

#[test]
fn initial_transition_runs_before_start_returns() {
    struct Greeter {
        started_with: Arc<Mutex<Option<Signal>>>,
    }

    impl ActiveBehavior for Greeter {
        fn on_start(&mut self, ctx: &mut ActiveContext<'_>, initial: Option<EventRef>) {
            *self.started_with.lock().unwrap() = initial.map(|e| e.signal());
            // posting to self is allowed once registered
            ctx.framework()
                .post(ctx.priority(), SIG_ECHO.into(), Margin::NoMargin)
                .unwrap();
        }

        fn on_event(&mut self, _ctx: &mut ActiveContext<'_>, _event: EventRef) {}
    }

    let fw = framework();
    let started_with = Arc::new(Mutex::new(None));
    let ao = new_active_object(
        prio(3),
        2,
        Greeter {
            started_with: Arc::clone(&started_with),
        },
    );
    fw.start_active(
        Arc::clone(&ao),
        &ManualScheduler,
        TaskAttrs::new("greeter"),
        Some(SIG_A.into()),
    )
    .unwrap();

    assert_eq!(*started_with.lock().unwrap(), Some(SIG_A));
    assert_eq!(ao.state(), ActiveState::Running);
    assert!(ao.has_events());
    assert!(ao.dispatch_one(&fw));
    assert!(!ao.dispatch_one(&fw));
}

#[test]
fn lifo_post_is_dispatched_next() {
    let fw = framework();
    let (_ao, sink) = start_collector(&fw, 1, 4);

    fw.post(prio(1), SIG_A.into(), Margin::NoMargin).unwrap();
    fw.post(prio(1), SIG_B.into(), Margin::NoMargin).unwrap();
    fw.post_lifo(prio(1), SIG_C.into());
    fw.run_until_idle();

    assert_eq!(sink.signals(), vec![SIG_C, SIG_A, SIG_B]);
}

#[test]
fn dispatch_collects_pooled_events() {
    let fw = framework();
    let (_ao, sink) = start_collector(&fw, 1, 4);

    let event = fw.new_event(16, Margin::NoMargin, SIG_A).unwrap();
    fw.post(prio(1), event, Margin::NoMargin).unwrap();
    assert_eq!(fw.ref_count(event), Some(1));

    fw.run_until_idle();

    assert_eq!(sink.signals(), vec![SIG_A]);
    assert_eq!(fw.ref_count(event), None);
    assert_eq!(fw.pool_stats(1).unwrap().free_blocks, 4);
}

#[test]
fn margin_rejection_keeps_queue_unchanged() {
    let fw = framework();
    let (_ao, _sink) = start_collector(&fw, 4, 3);

    fw.post(prio(4), SIG_A.into(), Margin::NoMargin).unwrap();
    let before = fw.queue_stats(prio(4)).unwrap();

    assert!(fw.post(prio(4), SIG_B.into(), Margin::Keep(2)).is_err());
    assert_eq!(fw.queue_stats(prio(4)).unwrap(), before);
    assert!(fw.post(prio(4), SIG_B.into(), Margin::Keep(1)).is_ok());
    assert_eq!(fw.queue_min(prio(4)), Some(1));
}

#[test]
fn stop_retires_and_discards_backlog() {
    let fw = framework();
    let (ao, sink) = start_collector(&fw, 5, 4);

    let event = fw.new_event(16, Margin::NoMargin, SIG_B).unwrap();
    fw.post(prio(5), SIG_A.into(), Margin::NoMargin).unwrap();
    fw.post(prio(5), event, Margin::NoMargin).unwrap();

    assert!(ao.stop());
    assert!(!ao.stop());
    assert_eq!(ao.state(), ActiveState::Stopping);
    assert!(!ao.dispatch_one(&fw));

    assert!(!fw.dispatch_ready());
    assert_eq!(ao.state(), ActiveState::Removed);
    assert!(fw.active(prio(5)).is_none());
    assert!(sink.signals().is_empty());
    assert_eq!(fw.pool_stats(1).unwrap().free_blocks, 4);
}

#[test]
fn behavior_can_stop_itself() {
    struct OneShot;

    impl ActiveBehavior for OneShot {
        fn on_start(&mut self, _ctx: &mut ActiveContext<'_>, _initial: Option<EventRef>) {}

        fn on_event(&mut self, ctx: &mut ActiveContext<'_>, _event: EventRef) {
            ctx.stop();
        }
    }

    let fw = framework();
    let ao = new_active_object(prio(6), 4, OneShot);
    fw.start_active(Arc::clone(&ao), &ManualScheduler, TaskAttrs::default(), None)
        .unwrap();
    fw.post(prio(6), SIG_A.into(), Margin::NoMargin).unwrap();
    fw.post(prio(6), SIG_B.into(), Margin::NoMargin).unwrap();

    fw.run_until_idle();

    assert_eq!(ao.state(), ActiveState::Removed);
}

#[test]
fn isr_post_reports_woken_priority() {
    let fw = framework();
    let (_low, _) = start_collector(&fw, 2, 2);
    let (_high, _) = start_collector(&fw, 9, 2);

    let mut isr = IsrContext::enter();
    fw.post_from_isr(prio(2), SIG_A.into(), Margin::NoMargin, &mut isr)
        .unwrap();
    fw.post_from_isr(prio(9), SIG_A.into(), Margin::NoMargin, &mut isr)
        .unwrap();
    // already non-empty, no new wake-up
    fw.post_from_isr(prio(2), SIG_B.into(), Margin::NoMargin, &mut isr)
        .unwrap();

    assert!(isr.higher_priority_woken(Some(prio(3))));
    assert_eq!(isr.exit(), Some(prio(9)));
}

#[test]
fn posts_and_gets_are_traced() {
    let log = TraceLog::default();
    let fw = traced_framework(&log);
    let (_ao, _sink) = start_collector(&fw, 3, 2);

    fw.post(prio(3), SIG_A.into(), Margin::NoMargin).unwrap();
    let _ = fw.post(prio(3), SIG_B.into(), Margin::Keep(1));
    fw.run_until_idle();

    assert_eq!(log.post_targets(), vec![3]);
    assert_eq!(log.payloads(records::ACTIVE_POST_ATTEMPT).len(), 1);
    assert_eq!(log.payloads(records::ACTIVE_GET).len(), 1);
}

#[test]
fn behaviors_emit_their_own_records() {
    const USER_RECORD: u8 = 100;

    struct Reporter {
        handled: usize,
    }

    impl ActiveBehavior for Reporter {
        fn on_start(&mut self, ctx: &mut ActiveContext<'_>, _initial: Option<EventRef>) {
            ctx.framework().subscribe(ctx.priority(), SIG_ECHO);
        }

        fn on_event(&mut self, ctx: &mut ActiveContext<'_>, event: EventRef) {
            self.handled += 1;
            let raw = event.signal().raw().to_le_bytes();
            ctx.emit_trace(USER_RECORD, &raw).unwrap();
        }
    }

    let log = TraceLog::default();
    let fw = traced_framework(&log);
    let reporter = ActiveObject::new(prio(5), 2, Reporter { handled: 0 });
    fw.start_active(
        Arc::clone(&reporter) as ActiveObjectRef,
        &ManualScheduler,
        TaskAttrs::default(),
        None,
    )
    .unwrap();
    log.clear();

    fw.publish(SIG_ECHO.into());
    fw.run_until_idle();

    assert_eq!(log.payloads(USER_RECORD), vec![vec![0x13, 0x00]]);
    assert_eq!(reporter.with_behavior(|behavior| behavior.handled), 1);
    assert!(log.payloads(records::SUBSCRIBE).is_empty());
}

#[test]
#[should_panic(expected = "qf_actq:320")]
fn overflow_without_margin_is_fatal() {
    let fw = framework();
    let (_ao, _sink) = start_collector(&fw, 1, 2);
    for _ in 0..3 {
        let _ = fw.post(prio(1), SIG_A.into(), Margin::NoMargin);
    }
}

#[test]
#[should_panic(expected = "qf_actq:310")]
fn posting_to_unregistered_priority_is_fatal() {
    let fw = framework();
    let _ = fw.post(prio(12), SIG_A.into(), Margin::NoMargin);
}

#[test]
#[should_panic(expected = "qf_fw:702")]
fn duplicate_priority_is_fatal() {
    let fw = framework();
    let (_first, _) = start_collector(&fw, 8, 2);
    let (_second, _) = start_collector(&fw, 8, 2);
}

#[test]
#[should_panic(expected = "qf_fw:700")]
fn priority_above_max_active_is_fatal() {
    let fw = framework();
    let (_ao, _) = start_collector(&fw, 40, 2);
}

#[test]
#[should_panic(expected = "qf_actq:320")]
fn lifo_overflow_is_fatal() {
    let fw = framework();
    let (_ao, _sink) = start_collector(&fw, 1, 2);
    for signal in [SIG_A, SIG_B, SIG_C] {
        fw.post_lifo(prio(1), signal.into());
    }
}
