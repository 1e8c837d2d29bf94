//! Error taxonomy
//!
//! Configuration problems are reported synchronously at the call that
//! introduced them; they are never deferred into the scheduling loop.
//! Cancellation is delivered asynchronously to blocked waits and is expected
//! to unwind the owning thread.

use thiserror::Error;

/// A rejected tempo/envelope mutation or an operation called on the wrong
/// kind of clock.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfigError {
    #[error("beat length must be positive and finite, got {0}")]
    InvalidBeatLength(f64),

    #[error("rate must be positive and finite, got {0}")]
    InvalidRate(f64),

    #[error("tempo must be positive and finite, got {0}")]
    InvalidTempo(f64),

    #[error("duration must be non-negative and finite, got {0}")]
    InvalidDuration(f64),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("{0} is only available on the master clock")]
    MasterOnly(&'static str),

    #[error("cannot {0} on a dead clock")]
    DeadClock(&'static str),

    #[error("failed to spawn clock thread: {0}")]
    ThreadSpawn(String),
}

/// Returned from a blocked wait whose clock (or an ancestor) was killed.
///
/// This is a cancellation signal, not a recoverable condition: the owning
/// thread should propagate it and exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("clock was killed while waiting")]
pub struct Interrupted;
