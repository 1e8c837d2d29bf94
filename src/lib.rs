//! Clocktree - a hierarchical virtual-time clock engine
//!
//! A tree of logical clocks, each running on its own OS thread:
//! - Drift-free waits measured in beats, paced against the wall clock
//! - Time-varying tempo: instant changes, gradual glides, whole envelopes,
//!   retiming any wait already in flight
//! - Nested clocks: a child's time axis is its parent's beat axis, so a
//!   tempo change anywhere rescales the whole subtree below it
//! - Structured lifecycle: fork / kill cascades, suspend and resume,
//!   deterministic ordering for simultaneous wake-ups
//! - Fast-forwarding and post-hoc extraction of a clock's tempo as the
//!   master experienced it

pub mod envelope;
pub mod tempo;
pub mod rng;
pub mod error;
pub mod wakeup;
pub mod wait_keeper;
pub mod clock;

#[cfg(test)]
mod clock_tests;

pub use clock::{Clock, ClockHandle, ForkOptions, MasterConfig};
pub use envelope::{Envelope, EnvelopeSegment};
pub use error::{ConfigError, Interrupted};
pub use tempo::{DurationUnits, TempoEnvelope};
