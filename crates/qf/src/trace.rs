//! Software tracing hook.
//!
//! The framework reports what it does through an optional [`TraceHook`].
//! A record is a type number from [`records`] plus a little-endian payload.
//! Framing, buffering and transport belong to whoever installs the hook.

use thiserror::Error;

use crate::sync::Arc;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace payload of {0} bytes does not fit a record")]
    PayloadTooLarge(usize),
    #[error("trace sink failed: {0}")]
    Sink(String),
}

pub type TraceResult = Result<(), TraceError>;

/// Receives `(record_type, payload, with_timestamp)`.
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> TraceResult + Send + Sync>;

/// Record type numbers, kept compatible with the QS numbering.
pub mod records {
    pub const SUBSCRIBE: u8 = 12;
    pub const UNSUBSCRIBE: u8 = 13;
    pub const ACTIVE_POST: u8 = 14;
    pub const ACTIVE_POST_LIFO: u8 = 15;
    pub const ACTIVE_GET: u8 = 16;
    pub const NEW_ATTEMPT: u8 = 23;
    pub const MPOOL_GET: u8 = 24;
    pub const MPOOL_PUT: u8 = 25;
    pub const PUBLISH: u8 = 26;
    pub const NEW: u8 = 28;
    pub const GC_ATTEMPT: u8 = 29;
    pub const GC: u8 = 30;
    pub const TICK: u8 = 31;
    pub const TIMEEVT_ARM: u8 = 32;
    pub const TIMEEVT_AUTO_DISARM: u8 = 33;
    pub const TIMEEVT_DISARM_ATTEMPT: u8 = 34;
    pub const TIMEEVT_DISARM: u8 = 35;
    pub const TIMEEVT_REARM: u8 = 36;
    pub const TIMEEVT_POST: u8 = 37;
    pub const ACTIVE_POST_ATTEMPT: u8 = 45;
    pub const MPOOL_GET_ATTEMPT: u8 = 47;
}

/// Largest payload a single record may carry.
pub const MAX_RECORD_PAYLOAD: usize = 32;

/// Fixed-capacity payload builder.
#[derive(Debug, Default)]
pub struct RecordBuf {
    bytes: heapless::Vec<u8, MAX_RECORD_PAYLOAD>,
    overflow: usize,
}

impl RecordBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.put(&[value]);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.put(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.put(&value.to_le_bytes());
        self
    }

    /// Emits `usize` counters as `u16`, saturating.
    pub fn count(self, value: usize) -> Self {
        self.u16(u16::try_from(value).unwrap_or(u16::MAX))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn put(&mut self, data: &[u8]) {
        if self.overflow > 0 || self.bytes.extend_from_slice(data).is_err() {
            self.overflow += data.len();
        }
    }

    fn finish(&self) -> Result<&[u8], TraceError> {
        if self.overflow > 0 {
            Err(TraceError::PayloadTooLarge(self.bytes.len() + self.overflow))
        } else {
            Ok(&self.bytes)
        }
    }
}

/// Sends a record to `hook`, if any.
///
/// Tracing never influences the framework, so failures are only logged.
pub(crate) fn emit(hook: Option<&TraceHook>, record: u8, buf: RecordBuf) {
    let Some(hook) = hook else {
        return;
    };
    let result = buf.finish().and_then(|payload| hook(record, payload, true));
    if let Err(err) = result {
        log::trace!("trace record {record} dropped: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn record_buf_is_little_endian() {
        let buf = RecordBuf::new().u8(7).u16(0x1234).u32(0xA0B0_C0D0);
        assert_eq!(buf.as_bytes(), &[7, 0x34, 0x12, 0xD0, 0xC0, 0xB0, 0xA0]);
    }

    #[test]
    fn counters_saturate() {
        let buf = RecordBuf::new().count(70_000);
        assert_eq!(buf.as_bytes(), &[0xFF, 0xFF]);
    }

    #[test]
    fn oversized_payload_is_not_delivered() {
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let hook: TraceHook = Arc::new(move |_, _, _| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        let mut buf = RecordBuf::new();
        for _ in 0..(MAX_RECORD_PAYLOAD / 4 + 1) {
            buf = buf.u32(0);
        }
        emit(Some(&hook), records::PUBLISH, buf);
        emit(Some(&hook), records::PUBLISH, RecordBuf::new().u8(1));

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn missing_hook_is_a_no_op() {
        emit(None, records::TICK, RecordBuf::new().u8(0));
    }
}
