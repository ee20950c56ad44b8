//! Error kinds shared across the engine pool, tree builder, and coordinator.
//!
//! The pool recovers locally from transient failures (worker restart plus a
//! single retry at the facade); everything else propagates here as a typed
//! variant. Nothing is ever swallowed inside the build loop: a failed
//! extension either retries, leaves its victim red and advances, or aborts
//! the request as `EngineUnavailable`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed FEN, illegal move, or out-of-range target/baseline.
    /// Surfaced to the caller before any engine work is performed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The request queue was full at submit time.
    #[error("engine queue is full")]
    Overloaded,

    /// A single engine call exceeded its deadline. The worker is killed
    /// and respawned; the facade retries the call once.
    #[error("engine call timed out")]
    Timeout,

    /// The engine subprocess died or produced unparseable output. The
    /// worker restarts automatically; the in-flight call is retried once.
    #[error("engine crashed: {0}")]
    EngineCrashed(String),

    /// No worker could satisfy the call after retries. Fatal to the request.
    #[error("engine unavailable after retries")]
    EngineUnavailable,

    /// The engine rejected the position (e.g. `bestmove (none)` on a
    /// terminal position). Callers are expected to filter terminal
    /// positions before querying, so this indicates a caller bug.
    #[error("engine rejected position: {0}")]
    IllegalPosition(String),

    /// The caller withdrew the request.
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the facade should retry the call once before giving up.
    /// Only transient engine-side failures qualify.
    pub fn retryable(&self) -> bool {
        matches!(self, Error::Timeout | Error::EngineCrashed(_))
    }
}
