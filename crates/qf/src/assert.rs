//! Fatal contract violations.
//!
//! The core reports capacity exhaustion under an explicit margin back to the
//! caller. Everything else that goes wrong (posting without margin into a
//! full queue, double free, stale or foreign blocks, unregistered targets)
//! leaves memory or message state undefined and ends here. The handler never
//! returns.
//!
//! Checks are evaluated outside the critical section so the unwinding or
//! aborting thread never holds it.

use core::fmt;

/// Logs the violation and halts the calling context.
///
/// The panic message starts with `"<module>:<id>"` so the failing check can
/// be identified from a log line alone.
#[cold]
#[track_caller]
pub fn on_assert(module: &'static str, id: u16, detail: fmt::Arguments<'_>) -> ! {
    log::error!("assertion {module}:{id} failed: {detail}");
    panic!("{module}:{id}: {detail}")
}

/// Halts unless `$cond` holds.
macro_rules! q_require {
    ($module:expr, $id:expr, $cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::assert::on_assert($module, $id, format_args!($($arg)+))
        }
    };
}

/// Halts unconditionally.
macro_rules! q_error {
    ($module:expr, $id:expr, $($arg:tt)+) => {
        $crate::assert::on_assert($module, $id, format_args!($($arg)+))
    };
}

pub(crate) use q_error;
pub(crate) use q_require;
