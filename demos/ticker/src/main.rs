//! Ticker demo on host threads.
//!
//! A `Blinker` active object owns a periodic time event. Each expiration
//! toggles its state and publishes a `BLINK` event carrying the blink
//! count. A `Monitor` subscribes to `BLINK` and shuts the framework down
//! after a fixed number of blinks. A plain thread drives tick rate 0.
//!
//! Run with `RUST_LOG=info cargo run -p ticker`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use qf_core::{
    new_active_object, ActiveBehavior, ActiveContext, EventRef, Framework, FrameworkConfig,
    Margin, Priority, QfError, QfResult, Signal, TaskAttrs, ThreadScheduler, TimeEventConfig,
};

const SIG_TIMEOUT: Signal = Signal(4);
const SIG_BLINK: Signal = Signal(5);

const TICK_PERIOD: Duration = Duration::from_millis(20);
const BLINK_TICKS: u32 = 5;
const BLINKS: u8 = 6;

struct Blinker {
    lit: bool,
    count: u8,
}

impl ActiveBehavior for Blinker {
    fn on_start(&mut self, ctx: &mut ActiveContext<'_>, _initial: Option<EventRef>) {
        let fw = ctx.framework();
        let te = fw.new_time_event(ctx.priority(), TimeEventConfig::new(SIG_TIMEOUT));
        fw.arm(te, BLINK_TICKS, BLINK_TICKS);
    }

    fn on_event(&mut self, ctx: &mut ActiveContext<'_>, event: EventRef) {
        if event.signal() != SIG_TIMEOUT {
            return;
        }
        self.lit = !self.lit;
        self.count = self.count.wrapping_add(1);
        info!("LED {}", if self.lit { "on" } else { "off" });

        let fw = ctx.framework();
        match fw.new_event_with(SIG_BLINK, Margin::Keep(1), &[self.count]) {
            Some(blink) => fw.publish(blink),
            None => warn!("no block left for blink #{}", self.count),
        }
    }
}

struct Monitor {
    seen: u8,
}

impl ActiveBehavior for Monitor {
    fn on_start(&mut self, ctx: &mut ActiveContext<'_>, _initial: Option<EventRef>) {
        ctx.framework().subscribe(ctx.priority(), SIG_BLINK);
    }

    fn on_event(&mut self, ctx: &mut ActiveContext<'_>, event: EventRef) {
        let fw = ctx.framework();
        let count = fw.payload(event, |bytes| bytes.first().copied().unwrap_or(0));
        self.seen += 1;
        info!("monitor saw blink #{count}");
        if self.seen >= BLINKS {
            fw.stop();
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = FrameworkConfig::builder().name("ticker").max_active(8).build();
    let fw = match Framework::with_config(config).pool(8, 8).build() {
        Ok(fw) => fw,
        Err(err) => {
            eprintln!("framework setup failed: {err}");
            std::process::exit(1);
        }
    };

    let scheduler = ThreadScheduler::new();
    // Subscriber first so no blink is published before it listens.
    let monitor = Monitor { seen: 0 };
    let blinker = Blinker {
        lit: false,
        count: 0,
    };
    if let Err(err) = start(&fw, &scheduler, 2, "monitor", monitor)
        .and_then(|()| start(&fw, &scheduler, 1, "blinker", blinker))
    {
        eprintln!("failed to start active objects: {err}");
        std::process::exit(1);
    }

    fw.run();
    let ticker = {
        let fw = Arc::clone(&fw);
        thread::spawn(move || {
            while fw.is_running() {
                fw.tick(0);
                thread::sleep(TICK_PERIOD);
            }
        })
    };

    let _ = ticker.join();
    scheduler.join_all();

    if let Some(stats) = fw.pool_stats(1) {
        info!(
            "pool 1: {} of {} blocks free, low-water mark {}",
            stats.free_blocks, stats.total_blocks, stats.min_free_blocks
        );
    }
}

fn start<B: ActiveBehavior>(
    fw: &Arc<Framework>,
    scheduler: &ThreadScheduler,
    raw: u8,
    name: &'static str,
    behavior: B,
) -> QfResult<()> {
    let prio = Priority::new(raw).ok_or(QfError::Config("demo priority out of range"))?;
    let active = new_active_object(prio, 8, behavior);
    fw.start_active(active, scheduler, TaskAttrs::new(name), None)
}
