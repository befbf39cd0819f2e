//! Error taxonomy surfaced by the cache controller.
//!
//! Every failure path of `open_and_lock`/`unlock_and_close` resolves to one
//! of these variants. Callers are expected to match on `CacheError` to
//! decide whether to retry, back off, or surface the failure to their own
//! caller; nothing here is meant to unwind past the cache boundary
//! un-inspected.

use std::time::Duration;

/// Error kinds surfaced by the cache controller.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Soft retryable condition: capacity reached, or a deadline expired
    /// before a real attempt to open was made.
    #[error("busy: {0}")]
    Busy(String),

    /// No idle slot could be evicted to make room.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The calling thread already owned the slot past its own deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Sustained high latency observed on this slot's rolling counters.
    #[error("excessive load: avg_wait={avg_wait:?} deadline_reached={deadline_reached}")]
    ExcessiveLoad {
        avg_wait: Duration,
        deadline_reached: bool,
    },

    /// The slot is being closed for deletion; the name no longer resolves.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Programming error: invalid slot id, or a release attempted on a
    /// slot that isn't held by the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Busy(_) | CacheError::Unavailable(_))
    }
}

/// Errors reported by an [`crate::dispatch::broker::EventBroker`] implementation.
///
/// The dispatch worker never propagates these past its own loop; it
/// classifies them with [`BrokerError::is_retry`] / [`BrokerError::is_network_error`]
/// and either requeues, drops, or (for session-level failures) surfaces
/// them to the embedder via the worker's `healthy` flag.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker session could not be created: {0}")]
    SessionUnavailable(String),

    #[error("broker rejected publish (retryable): {0}")]
    Retryable(String),

    #[error("network error while talking to broker: {0}")]
    Network(String),

    #[error("broker rejected publish (unrecoverable): {0}")]
    Unrecoverable(String),
}

impl BrokerError {
    pub fn is_retry(&self) -> bool {
        matches!(self, BrokerError::Retryable(_))
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, BrokerError::Network(_))
    }

    /// True when neither `is_retry` nor `is_network_error` applies: the
    /// message must be dropped rather than requeued.
    pub fn is_unrecoverable(&self) -> bool {
        !self.is_retry() && !self.is_network_error()
    }
}
