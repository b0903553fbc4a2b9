//! Recoverable error types.
//!
//! Only outcomes a caller can act on are represented here. Contract
//! violations are fatal and go through [`crate::assert::on_assert`].

use thiserror::Error;

use crate::priority::Priority;

pub type QfResult<T> = Result<T, QfError>;

/// Errors raised while configuring or starting the framework.
#[derive(Debug, Error)]
pub enum QfError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("failed to create execution context for active object {priority}")]
    Spawn {
        priority: Priority,
        #[source]
        source: std::io::Error,
    },
}

/// A post with an explicit margin found too little room in the queue.
///
/// The event was not queued and its reference count is untouched; the caller
/// decides whether to retry, substitute, or garbage-collect it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    #[error("queue of {target} has {free} free entries, margin {margin} requested")]
    QueueFull {
        target: Priority,
        free: usize,
        margin: usize,
    },
}
