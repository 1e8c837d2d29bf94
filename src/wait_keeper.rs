//! Wait keeper - one clock thread's blocking primitive
//!
//! Every clock owns a `WaitKeeper`. The owning thread sleeps or parks on it;
//! other threads poke it to release a parked child at its wake-up beat, to
//! force a re-evaluation after a tempo change, or to kill the clock. All
//! blocking here is interruptible; a killed clock never stays asleep.
//!
//! Precise sleeps are two-phase: coarse condvar waits (so interrupts land)
//! until only [`SPIN_THRESHOLD`] remains, then a spin_sleep tail for
//! sub-millisecond accuracy.

use spin_sleep::SpinSleeper;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Remaining-time cutoff below which a timed sleep stops condvar-waiting and
/// spins instead.
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

/// Why a timed sleep returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The deadline was reached.
    Elapsed,
    /// Someone nudged us; the caller should re-evaluate its deadline.
    Nudged,
    /// The clock was killed.
    Killed,
}

/// Why an open-ended park returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkOutcome {
    /// The parent released us at our wake-up beat.
    Released,
    /// Our tempo changed while parked; the pending wait must be re-planned.
    Retimed,
    /// The clock was killed.
    Killed,
}

#[derive(Default)]
struct Signals {
    released: bool,
    retimed: bool,
    nudges: u64,
}

pub struct WaitKeeper {
    signals: Mutex<Signals>,
    condvar: Condvar,
    /// Set by the owning thread right before parking; the parent reads it
    /// during rendezvous.
    ready: AtomicBool,
    killed: AtomicBool,
    sleeper: SpinSleeper,
}

impl WaitKeeper {
    pub fn new() -> Self {
        Self {
            signals: Mutex::new(Signals::default()),
            condvar: Condvar::new(),
            ready: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            sleeper: SpinSleeper::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Wake whatever is blocked so it re-checks its situation.
    pub fn nudge(&self) {
        let mut signals = self.signals.lock().unwrap();
        signals.nudges = signals.nudges.wrapping_add(1);
        drop(signals);
        self.condvar.notify_all();
    }

    /// Release a parked clock at its wake-up beat. Clears the ready flag in
    /// the same step so the releaser never observes a stale "ready".
    pub fn release(&self) {
        let mut signals = self.signals.lock().unwrap();
        signals.released = true;
        self.ready.store(false, Ordering::Release);
        drop(signals);
        self.condvar.notify_all();
    }

    /// Tell a parked or sleeping clock its timing assumptions are stale.
    pub fn retime(&self) {
        let mut signals = self.signals.lock().unwrap();
        signals.retimed = true;
        drop(signals);
        self.condvar.notify_all();
    }

    /// Permanently wake the clock; every current and future block returns
    /// Killed immediately.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        // lock so a concurrent blocker cannot miss the wakeup
        let _signals = self.signals.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Block until released, retimed, or killed.
    pub fn park(&self) -> ParkOutcome {
        let mut signals = self.signals.lock().unwrap();
        loop {
            if self.killed.load(Ordering::Acquire) {
                return ParkOutcome::Killed;
            }
            if signals.retimed {
                signals.retimed = false;
                return ParkOutcome::Retimed;
            }
            if signals.released {
                signals.released = false;
                return ParkOutcome::Released;
            }
            signals = self.condvar.wait(signals).unwrap();
        }
    }

    /// Snapshot of the nudge counter. Capture one before planning a sleep,
    /// then pass it to [`sleep_until`](Self::sleep_until); a nudge landing
    /// between the snapshot and the sleep is then never lost.
    pub fn signal_token(&self) -> u64 {
        self.signals.lock().unwrap().nudges
    }

    /// Sleep until `deadline`, waking early on nudge, retime, or kill.
    /// A pending retime is consumed here; the caller re-plans either way.
    pub fn sleep_until(&self, deadline: Instant, token: u64) -> SleepOutcome {
        let mut signals = self.signals.lock().unwrap();
        loop {
            if self.killed.load(Ordering::Acquire) {
                return SleepOutcome::Killed;
            }
            if signals.nudges != token || signals.retimed || signals.released {
                signals.retimed = false;
                return SleepOutcome::Nudged;
            }
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining <= SPIN_THRESHOLD {
                break;
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(signals, remaining - SPIN_THRESHOLD)
                .unwrap();
            signals = guard;
        }
        drop(signals);
        let tail = deadline.saturating_duration_since(Instant::now());
        if !tail.is_zero() {
            self.sleeper.sleep(tail);
        }
        SleepOutcome::Elapsed
    }

    /// Block for at most `timeout` waiting for any signal activity. Used by
    /// the rendezvous loop, which re-checks child states after every wakeup.
    /// A pending retime is consumed (the caller is about to re-plan anyway);
    /// a pending release is left for the next park.
    pub fn wait_for_nudge(&self, timeout: Duration) {
        let mut signals = self.signals.lock().unwrap();
        if self.killed.load(Ordering::Acquire) || signals.released {
            return;
        }
        if signals.retimed {
            signals.retimed = false;
            return;
        }
        let _unused = self.condvar.wait_timeout(signals, timeout).unwrap();
    }

    /// Drop any queued release or retime. Called when a pending wait is
    /// abandoned (the wait-entry was removed from the parent's queue first).
    pub fn clear_signals(&self) {
        let mut signals = self.signals.lock().unwrap();
        signals.released = false;
        signals.retimed = false;
    }
}

impl Default for WaitKeeper {
    fn default() -> Self {
        Self::new()
    }
}
