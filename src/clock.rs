//! Clocks - the hierarchical scheduling units
//!
//! A clock tree is rooted at a master clock tied to the wall clock; every
//! forked clock runs on its own OS thread with its own tempo envelope. A
//! clock's "time" unit is its parent's "beat" unit, so tempo changes anywhere
//! in the ancestor chain rescale everything below.
//!
//! Only the master ever sleeps against the OS clock. A child that calls
//! `wait` converts the beat delta to a time delta through its envelope,
//! registers a wake-up call (a beat in the parent's space) with its parent,
//! and parks on its own [`WaitKeeper`]; the parent does the same with its
//! parent, up to the master. Wake-ups flow back down in deterministic order:
//! earliest beat first, fork order among ties, parents strictly before the
//! children they release.
//!
//! `beat()` and `time()` are live reads computed recursively from the
//! master's elapsed wall time, so they are current from any thread without a
//! catch-up pass. The envelope cursor only moves when the owning thread
//! arrives somewhere, and planning always works from the cursor.
//!
//! Two views exist: [`Clock`] is the owning-thread view (waiting, forking),
//! [`ClockHandle`] is the cloneable cross-thread view (tempo changes, hold,
//! kill, observation).

use crate::envelope::{Envelope, EnvelopeSegment};
use crate::error::{ConfigError, Interrupted};
use crate::rng::{derive_seed, fnv1a64, ClockRng};
use crate::tempo::{DurationUnits, TempoEnvelope};
use crate::wait_keeper::{ParkOutcome, SleepOutcome, WaitKeeper};
use crate::wakeup::{release_order, WakeUpQueue};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static CLOCK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_clock_id() -> u64 {
    CLOCK_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Poll interval for rendezvous-style condition waits.
const RENDEZVOUS_POLL: Duration = Duration::from_millis(1);

/// Slack when deciding whether a queued wake-up call is due at the cursor.
const DUE_EPSILON: f64 = 1e-9;

/// The master logs a warning when it arrives this many seconds late.
const BEHIND_WARNING_SECONDS: f64 = 0.010;

/// Configuration for the master clock.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub name: String,
    /// Beats per second of wall time.
    pub initial_rate: f64,
    /// Seed for the deterministic per-clock RNG tree; hashed from the name
    /// when absent.
    pub seed: Option<u64>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            name: "master".into(),
            initial_rate: 1.0,
            seed: None,
        }
    }
}

/// Options for [`Clock::fork_with`].
#[derive(Clone, Debug)]
pub struct ForkOptions {
    /// Child name; `parent-name/fork-seq` when absent.
    pub name: Option<String>,
    /// Child beats per parent beat.
    pub initial_rate: f64,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            name: None,
            initial_rate: 1.0,
        }
    }
}

/// Mutable clock state, always accessed under the per-clock mutex. Locks
/// are only ever taken upward (a thread may lock a clock and then that
/// clock's parent, never the reverse).
struct ClockState {
    tempo: TempoEnvelope,
    /// Own-time at which the clock was frozen, when held.
    held: Option<f64>,
    dead: bool,
    /// Total own-time excluded by past holds.
    held_time: f64,
    queue: WakeUpQueue,
    children: Vec<Arc<ClockCore>>,
    fork_counter: u64,
    /// Wall seconds skipped by fast-forwarding. Master only.
    skipped: f64,
    /// Own-time up to which sleeps are free. Master only.
    ff_goal: Option<f64>,
}

struct ClockCore {
    id: u64,
    name: String,
    /// Position among siblings, the tie-break key in the parent's queue.
    fork_seq: u64,
    seed: u64,
    parent: Option<Weak<ClockCore>>,
    /// Parent's beat at fork; own time 0 maps to this parent beat.
    parent_offset: f64,
    keeper: WaitKeeper,
    state: Mutex<ClockState>,
    /// Anchor for the master's wall-clock math; unused on children.
    start_instant: Instant,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ClockCore {
    // ----- live reads ---------------------------------------------------

    /// Own time ignoring holds: wall seconds plus skip for the master, the
    /// parent's live beat minus the fork offset for a child.
    fn raw_time_locked(&self, st: &ClockState) -> f64 {
        match self.parent.as_ref() {
            None => self.start_instant.elapsed().as_secs_f64() + st.skipped,
            Some(weak) => match weak.upgrade() {
                Some(parent) => parent.current_beat() - self.parent_offset,
                // orphaned clock, frozen at its cursor
                None => st.tempo.time() + st.held_time,
            },
        }
    }

    fn current_time_locked(&self, st: &ClockState) -> f64 {
        if st.dead {
            return st.tempo.time();
        }
        if let Some(anchor) = st.held {
            return anchor;
        }
        self.raw_time_locked(st) - st.held_time
    }

    fn current_beat_locked(&self, st: &ClockState) -> f64 {
        if st.dead {
            return st.tempo.beat();
        }
        let elapsed = self.current_time_locked(st) - st.tempo.time();
        if elapsed <= 0.0 {
            st.tempo.beat()
        } else {
            st.tempo.beat() + st.tempo.beats_for_time(st.tempo.beat(), elapsed)
        }
    }

    fn current_time(&self) -> f64 {
        let st = self.state.lock().unwrap();
        self.current_time_locked(&st)
    }

    fn current_beat(&self) -> f64 {
        let st = self.state.lock().unwrap();
        self.current_beat_locked(&st)
    }

    fn beat_length_now(&self) -> f64 {
        let st = self.state.lock().unwrap();
        st.tempo.beat_length_at(self.current_beat_locked(&st))
    }

    fn is_dead(&self) -> bool {
        self.state.lock().unwrap().dead
    }

    fn is_held(&self) -> bool {
        self.state.lock().unwrap().held.is_some()
    }

    fn is_master(&self) -> bool {
        self.parent.is_none()
    }

    /// Current time on the master clock, from anywhere in the tree.
    fn time_in_master(&self) -> f64 {
        match self.parent.as_ref().and_then(Weak::upgrade) {
            None => self.current_time(),
            Some(parent) => parent.time_in_master(),
        }
    }

    /// Product of this clock's and every ancestor's instantaneous rate;
    /// zero while held or dead.
    fn absolute_rate(&self) -> f64 {
        let own = {
            let st = self.state.lock().unwrap();
            if st.dead || st.held.is_some() {
                return 0.0;
            }
            st.tempo.rate_at(self.current_beat_locked(&st))
        };
        match self.parent.as_ref().and_then(Weak::upgrade) {
            None => own,
            Some(parent) => own * parent.absolute_rate(),
        }
    }

    fn child_by_id(&self, id: u64) -> Option<Arc<ClockCore>> {
        self.state
            .lock()
            .unwrap()
            .children
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    fn child_handles(&self) -> Vec<ClockHandle> {
        self.state
            .lock()
            .unwrap()
            .children
            .iter()
            .map(|c| ClockHandle {
                core: Arc::clone(c),
            })
            .collect()
    }

    // ----- wait protocol ------------------------------------------------

    /// A child is settled when its thread is parked waiting for a wake-up,
    /// or it no longer participates in scheduling.
    fn is_settled(child: &ClockCore) -> bool {
        child.keeper.is_ready()
            || child.keeper.is_killed()
            || child.is_dead()
            || child.is_held()
    }

    /// Wait until every child has either parked (with its next wake-up call
    /// registered), died, or been held. Time may not advance before this,
    /// or a child's not-yet-registered wake-up could be slept past.
    fn rendezvous(&self) -> Result<(), Interrupted> {
        loop {
            if self.keeper.is_killed() {
                return Err(Interrupted);
            }
            let children = { self.state.lock().unwrap().children.clone() };
            if children.iter().all(|c| Self::is_settled(c)) {
                return Ok(());
            }
            self.keeper.wait_for_nudge(RENDEZVOUS_POLL);
        }
    }

    fn block_while_held(&self) -> Result<(), Interrupted> {
        loop {
            if self.keeper.is_killed() {
                return Err(Interrupted);
            }
            if self.state.lock().unwrap().held.is_none() {
                return Ok(());
            }
            self.keeper.wait_for_nudge(RENDEZVOUS_POLL);
        }
    }

    /// Drop our pending wake-up call from the parent's queue, waking the
    /// parent so it re-plans without it.
    fn unregister_from_parent(&self) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            let removed = parent.state.lock().unwrap().queue.unregister(self.id);
            if removed {
                parent.keeper.retime();
            }
        }
    }

    /// Block until `delta_beats` of this clock's own beats have elapsed,
    /// servicing child wake-ups that come due along the way.
    fn run_wait(&self, target_beat: f64) -> Result<(), Interrupted> {
        loop {
            let token = self.keeper.signal_token();
            if self.keeper.is_killed() {
                return Err(Interrupted);
            }
            self.rendezvous()?;
            self.block_while_held()?;

            let (cursor, next_beat) = {
                let mut st = self.state.lock().unwrap();
                if st.dead {
                    return Err(Interrupted);
                }
                let cursor = st.tempo.beat();
                if cursor >= target_beat {
                    (cursor, None)
                } else {
                    let next = match st.queue.peek() {
                        Some(call) if call.beat < target_beat => call.beat.max(cursor),
                        _ => target_beat,
                    };
                    (cursor, Some(next))
                }
            };
            let Some(next_beat) = next_beat else {
                return Ok(());
            };

            if next_beat <= cursor {
                // an overdue wake-up call; service it without advancing
                self.arrive(next_beat);
                continue;
            }
            if self.advance_to_beat(next_beat, token)? {
                self.arrive(next_beat);
            }
        }
    }

    /// Service child wake-ups until every child present at entry is dead,
    /// then join their threads. Blocks forever if one never terminates.
    fn run_wait_for_children(&self) -> Result<(), Interrupted> {
        let snapshot: Vec<Arc<ClockCore>> = { self.state.lock().unwrap().children.clone() };
        loop {
            if snapshot
                .iter()
                .all(|c| c.is_dead() || c.keeper.is_killed())
            {
                break;
            }
            let token = self.keeper.signal_token();
            if self.keeper.is_killed() {
                return Err(Interrupted);
            }
            self.rendezvous()?;
            self.block_while_held()?;

            let next_beat = {
                let mut st = self.state.lock().unwrap();
                if st.dead {
                    return Err(Interrupted);
                }
                st.queue.peek().map(|call| call.beat.max(st.tempo.beat()))
            };
            match next_beat {
                // children are executing; nothing is scheduled yet
                None => self.keeper.wait_for_nudge(RENDEZVOUS_POLL),
                Some(next_beat) => {
                    let cursor = { self.state.lock().unwrap().tempo.beat() };
                    if next_beat <= cursor {
                        self.arrive(next_beat);
                    } else if self.advance_to_beat(next_beat, token)? {
                        self.arrive(next_beat);
                    }
                }
            }
        }
        for child in snapshot {
            let handle = child.thread.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        Ok(())
    }

    /// Advance real scheduling to `next_beat`. Returns true on arrival,
    /// false when interrupted for re-planning.
    fn advance_to_beat(&self, next_beat: f64, token: u64) -> Result<bool, Interrupted> {
        if self.is_master() {
            self.master_sleep_to(next_beat, token)
        } else {
            self.child_park_to(next_beat)
        }
    }

    /// Master path: sleep on the wall clock until the cursor's arrival at
    /// `next_beat`, fast-forward permitting. The deadline is absolute
    /// (derived from `start_instant`), so repeated re-planning never drifts.
    fn master_sleep_to(&self, next_beat: f64, token: u64) -> Result<bool, Interrupted> {
        let deadline = {
            let mut st = self.state.lock().unwrap();
            if st.dead {
                return Err(Interrupted);
            }
            if st.held.is_some() {
                return Ok(false);
            }
            let wait_time = st.tempo.time_for_beats(st.tempo.beat(), next_beat);
            let target_time = st.tempo.time() + wait_time;
            if let Some(goal) = st.ff_goal {
                let wall = self.start_instant.elapsed().as_secs_f64();
                let now_time = wall + st.skipped - st.held_time;
                if now_time >= goal {
                    st.ff_goal = None;
                } else if target_time <= goal {
                    // the whole sleep is inside the fast-forward window
                    st.skipped = target_time + st.held_time - wall;
                    return Ok(true);
                } else {
                    st.skipped = goal + st.held_time - wall;
                    st.ff_goal = None;
                }
            }
            let remaining = target_time + st.held_time - st.skipped;
            self.start_instant + Duration::from_secs_f64(remaining.max(0.0))
        };
        match self.keeper.sleep_until(deadline, token) {
            SleepOutcome::Elapsed => Ok(true),
            SleepOutcome::Nudged => Ok(false),
            SleepOutcome::Killed => Err(Interrupted),
        }
    }

    /// Child path: register the wake-up call with the parent, mark ready,
    /// and park until the parent releases us at that beat.
    fn child_park_to(&self, next_beat: f64) -> Result<bool, Interrupted> {
        let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) else {
            return Err(Interrupted);
        };
        {
            let st = self.state.lock().unwrap();
            if st.dead {
                return Err(Interrupted);
            }
            // ready goes up before the call is visible in the parent's
            // queue; a release can then only follow the registration, and
            // release() puts ready back down
            self.keeper.set_ready(true);
            // a held clock parks without a registration; releasing the hold
            // retimes us and we re-register with fresh held-time accounting
            if st.held.is_none() {
                let target_time =
                    st.tempo.time() + st.tempo.time_for_beats(st.tempo.beat(), next_beat);
                let parent_beat = self.parent_offset + target_time + st.held_time;
                let mut pst = parent.state.lock().unwrap();
                if !pst.queue.retime(self.id, parent_beat) {
                    pst.queue.register(self.id, parent_beat, self.fork_seq);
                }
            }
        }
        parent.keeper.retime();
        match self.keeper.park() {
            ParkOutcome::Released => Ok(true),
            ParkOutcome::Retimed => {
                self.keeper.set_ready(false);
                self.unregister_from_parent();
                self.keeper.clear_signals();
                Ok(false)
            }
            ParkOutcome::Killed => Err(Interrupted),
        }
    }

    /// The cursor has reached `next_beat`: advance the envelope cursor and
    /// release every due child, one at a time in queue order.
    fn arrive(&self, next_beat: f64) {
        let (due, behind) = {
            let mut st = self.state.lock().unwrap();
            let delta = next_beat - st.tempo.beat();
            if delta > 0.0 {
                st.tempo.advance(delta);
            }
            let mut due = Vec::new();
            while let Some(call) = st.queue.peek() {
                if call.beat <= st.tempo.beat() + DUE_EPSILON {
                    if let Some(call) = st.queue.pop() {
                        due.push(call);
                    }
                } else {
                    break;
                }
            }
            due.sort_by(|a, b| release_order(a, b, DUE_EPSILON));
            let behind = if self.parent.is_none() {
                self.current_time_locked(&st) - st.tempo.time()
            } else {
                0.0
            };
            (due, behind)
        };
        if behind > BEHIND_WARNING_SECONDS {
            warn!(
                "master clock '{}' is running {:.1} ms behind",
                self.name,
                behind * 1e3
            );
        }
        for call in due {
            let Some(child) = self.child_by_id(call.clock_id) else {
                continue;
            };
            if child.keeper.is_killed() || child.is_dead() || child.is_held() {
                // a held child's call is dropped; releasing the hold
                // re-plans and re-registers it
                continue;
            }
            child.keeper.release();
            // lock-step: let this child run before releasing the next
            while !Self::is_settled(&child) {
                if self.keeper.is_killed() {
                    return;
                }
                self.keeper.wait_for_nudge(RENDEZVOUS_POLL);
            }
        }
    }

    // ----- lifecycle ----------------------------------------------------

    fn fork_child<F>(self: &Arc<Self>, opts: ForkOptions, f: F) -> Result<ClockHandle, ConfigError>
    where
        F: FnOnce(&mut Clock) -> Result<(), Interrupted> + Send + 'static,
    {
        if !(opts.initial_rate.is_finite() && opts.initial_rate > 0.0) {
            return Err(ConfigError::InvalidRate(opts.initial_rate));
        }
        let core = {
            let mut st = self.state.lock().unwrap();
            if st.dead || self.keeper.is_killed() {
                return Err(ConfigError::DeadClock("fork"));
            }
            let seq = st.fork_counter;
            st.fork_counter += 1;
            let name = opts
                .name
                .clone()
                .unwrap_or_else(|| format!("{}/{}", self.name, seq));
            let core = Arc::new(ClockCore {
                id: next_clock_id(),
                name,
                fork_seq: seq,
                seed: derive_seed(self.seed, seq),
                parent: Some(Arc::downgrade(self)),
                // anchor the child's time zero at the live beat, not the
                // cursor, so forks between arrivals line up with now
                parent_offset: self.current_beat_locked(&st),
                keeper: WaitKeeper::new(),
                state: Mutex::new(ClockState {
                    tempo: TempoEnvelope::new(opts.initial_rate)?,
                    held: None,
                    dead: false,
                    held_time: 0.0,
                    queue: WakeUpQueue::new(),
                    children: Vec::new(),
                    fork_counter: 0,
                    skipped: 0.0,
                    ff_goal: None,
                }),
                start_instant: Instant::now(),
                thread: Mutex::new(None),
            });
            st.children.push(Arc::clone(&core));
            core
        };
        debug!("forked clock '{}' from '{}'", core.name, self.name);

        let seed = core.seed;
        let spawn = std::thread::Builder::new().name(core.name.clone()).spawn({
            let core = Arc::clone(&core);
            let parent = Arc::clone(self);
            move || {
                // the guard finalizes the clock even if `f` panics, so the
                // parent's rendezvous never hangs on a vanished thread
                let _guard = FinalizeGuard {
                    core: Arc::clone(&core),
                    parent,
                };
                let mut clock = Clock {
                    core,
                    rng: ClockRng::from_seed(seed),
                };
                if f(&mut clock).is_err() {
                    debug!("clock '{}' unwound on cancellation", clock.core.name);
                }
            }
        });
        match spawn {
            Ok(handle) => {
                *core.thread.lock().unwrap() = Some(handle);
                Ok(ClockHandle { core })
            }
            Err(err) => {
                self.state
                    .lock()
                    .unwrap()
                    .children
                    .retain(|c| c.id != core.id);
                Err(ConfigError::ThreadSpawn(err.to_string()))
            }
        }
    }

    /// Pins the envelope cursor at the live position, so reads taken after
    /// death never fall behind values observed while the clock was alive.
    fn freeze_cursor_locked(&self, st: &mut ClockState) {
        let elapsed = self.current_time_locked(st) - st.tempo.time();
        if elapsed > 0.0 {
            st.tempo.advance_time(elapsed);
        }
    }

    /// Idempotent; marks the whole subtree dead and wakes every blocked
    /// wait in it with a cancellation outcome. Threads are never
    /// terminated, they observe `Interrupted` and unwind.
    fn kill_subtree(&self) {
        let children = {
            let mut st = self.state.lock().unwrap();
            if st.dead {
                return;
            }
            self.freeze_cursor_locked(&mut st);
            st.dead = true;
            st.queue.clear();
            st.children.clone()
        };
        self.unregister_from_parent();
        self.keeper.kill();
        debug!("killed clock '{}'", self.name);
        for child in &children {
            child.kill_subtree();
        }
    }

    /// Freeze this clock and its subtree at the current instant. Holding is
    /// top-down, so descendants anchor against already-frozen parents and
    /// their own held-time stays zero; the hold is absorbed where the
    /// subtree meets still-running time.
    fn hold_subtree(&self) {
        let children = {
            let mut st = self.state.lock().unwrap();
            if st.dead || st.held.is_some() {
                return;
            }
            let anchor = self.current_time_locked(&st);
            st.held = Some(anchor);
            st.children.clone()
        };
        self.unregister_from_parent();
        self.keeper.nudge();
        debug!("held clock '{}'", self.name);
        for child in &children {
            child.hold_subtree();
        }
    }

    /// Resume a held subtree; the wall time spent held is excluded from the
    /// clocks' time accounting, so pending waits keep their remaining
    /// durations.
    fn release_subtree(&self) {
        let children = {
            let mut st = self.state.lock().unwrap();
            let Some(anchor) = st.held else {
                return;
            };
            let raw = self.raw_time_locked(&st);
            st.held_time = raw - anchor;
            st.held = None;
            st.children.clone()
        };
        self.keeper.retime();
        debug!("released clock '{}' from suspension", self.name);
        for child in &children {
            child.release_subtree();
        }
    }

    // ----- tempo mutation -----------------------------------------------

    /// Run a tempo mutation at the live current beat and wake the owning
    /// thread so any in-progress wait re-plans immediately.
    fn mutate_tempo<F>(&self, op: &'static str, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut TempoEnvelope, f64) -> Result<(), ConfigError>,
    {
        {
            let mut st = self.state.lock().unwrap();
            if st.dead {
                return Err(ConfigError::DeadClock(op));
            }
            let beat = self.current_beat_locked(&st);
            f(&mut st.tempo, beat)?;
        }
        self.keeper.retime();
        Ok(())
    }

    // ----- fast-forward (master only) -----------------------------------

    fn require_master(&self, op: &'static str) -> Result<(), ConfigError> {
        if self.parent.is_some() {
            return Err(ConfigError::MasterOnly(op));
        }
        Ok(())
    }

    fn set_ff_goal(&self, op: &'static str, goal: f64) -> Result<(), ConfigError> {
        self.require_master(op)?;
        {
            let mut st = self.state.lock().unwrap();
            if st.dead {
                return Err(ConfigError::DeadClock(op));
            }
            st.ff_goal = Some(goal);
        }
        self.keeper.nudge();
        Ok(())
    }

    fn ff_goal_in_time(&self, op: &'static str, duration: f64) -> Result<(), ConfigError> {
        self.require_master(op)?;
        if !(duration.is_finite() && duration > 0.0) {
            return Err(ConfigError::InvalidDuration(duration));
        }
        let goal = self.current_time() + duration;
        self.set_ff_goal(op, goal)
    }

    fn ff_goal_at_beat(&self, op: &'static str, target_beat: f64) -> Result<(), ConfigError> {
        self.require_master(op)?;
        let goal = {
            let st = self.state.lock().unwrap();
            let beat_now = self.current_beat_locked(&st);
            if !(target_beat.is_finite() && target_beat > beat_now) {
                return Err(ConfigError::InvalidDuration(target_beat - beat_now));
            }
            st.tempo.time() + st.tempo.time_for_beats(st.tempo.beat(), target_beat)
        };
        self.set_ff_goal(op, goal)
    }

    fn stop_fast_forwarding(&self) -> Result<(), ConfigError> {
        self.require_master("stop_fast_forwarding")?;
        self.state.lock().unwrap().ff_goal = None;
        self.keeper.nudge();
        Ok(())
    }

    fn is_fast_forwarding(&self) -> bool {
        self.state.lock().unwrap().ff_goal.is_some()
    }

    // ----- absolute envelope extraction ---------------------------------

    /// Tempo of this clock as the master experienced it, over
    /// `[start_beat, current beat)` of this clock's own beats. Steps
    /// `step_size` beats at a time through the snapshot of every ancestor's
    /// envelope, measures the master time each step took, and refits the
    /// result as beat-length segments merged within `tolerance`. An
    /// approximation by construction, not an algebraic composition.
    fn extract_absolute(
        &self,
        start_beat: f64,
        step_size: f64,
        tolerance: f64,
    ) -> Result<TempoEnvelope, ConfigError> {
        if !(step_size.is_finite() && step_size > 0.0) {
            return Err(ConfigError::InvalidDuration(step_size));
        }
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(ConfigError::InvalidDuration(tolerance));
        }
        let (own_envelope, end_beat) = {
            let st = self.state.lock().unwrap();
            (st.tempo.clone(), st.tempo.beat())
        };
        if self.parent.is_none() {
            // the master's own envelope already is absolute
            return Ok(own_envelope);
        }

        // snapshot the ancestor chain, self first
        let mut chain: Vec<TempoEnvelope> = vec![own_envelope];
        let mut offsets: Vec<f64> = vec![self.parent_offset];
        let mut node = self.parent.as_ref().and_then(Weak::upgrade);
        while let Some(core) = node {
            let st = core.state.lock().unwrap();
            chain.push(st.tempo.clone());
            offsets.push(core.parent_offset);
            drop(st);
            node = core.parent.as_ref().and_then(Weak::upgrade);
        }

        // line every envelope's cursor up with start_beat of this clock
        chain[0].go_to_beat(start_beat);
        for i in 1..chain.len() {
            let position = offsets[i - 1] + chain[i - 1].time();
            chain[i].go_to_beat(position);
        }

        let initial_length: f64 = chain.iter().map(|e| e.beat_length_at(e.beat())).product();
        let seed = EnvelopeSegment::new(start_beat, start_beat, initial_length, initial_length, 0.0);
        let mut out = Envelope::from_segments(vec![seed])?;

        let mut beat = start_beat;
        while beat < end_beat - DUE_EPSILON {
            let step = step_size.min(end_beat - beat);
            // each envelope's time advance is the next one's beat advance
            let mut amount = step;
            for envelope in chain.iter_mut() {
                let (_, time) = envelope.advance(amount);
                amount = time;
            }
            out.append_segment(amount / step, step, 0.0, tolerance);
            beat += step;
        }
        Ok(TempoEnvelope::from_envelope(out))
    }
}

/// Finalizes a forked clock when its thread function returns or panics:
/// kills any children it left running, removes it from the parent's child
/// set and queue, and wakes the parent.
struct FinalizeGuard {
    core: Arc<ClockCore>,
    parent: Arc<ClockCore>,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        let children = {
            let mut st = self.core.state.lock().unwrap();
            if !st.dead {
                self.core.freeze_cursor_locked(&mut st);
                st.dead = true;
            }
            st.queue.clear();
            st.children.clone()
        };
        self.core.keeper.kill();
        for child in &children {
            child.kill_subtree();
        }
        {
            let mut pst = self.parent.state.lock().unwrap();
            pst.children.retain(|c| c.id != self.core.id);
            pst.queue.unregister(self.core.id);
        }
        self.parent.keeper.retime();
        debug!("clock '{}' finished", self.core.name);
    }
}

/// The owning-thread view of a clock. Not `Clone`: exactly one thread waits
/// on and forks from a clock.
pub struct Clock {
    core: Arc<ClockCore>,
    rng: ClockRng,
}

impl Clock {
    /// The master clock, anchored to the wall clock, running at one beat
    /// per second.
    pub fn master() -> Clock {
        let seed = fnv1a64("master");
        let core = Arc::new(ClockCore {
            id: next_clock_id(),
            name: "master".into(),
            fork_seq: 0,
            seed,
            parent: None,
            parent_offset: 0.0,
            keeper: WaitKeeper::new(),
            state: Mutex::new(ClockState {
                tempo: TempoEnvelope::default(),
                held: None,
                dead: false,
                held_time: 0.0,
                queue: WakeUpQueue::new(),
                children: Vec::new(),
                fork_counter: 0,
                skipped: 0.0,
                ff_goal: None,
            }),
            start_instant: Instant::now(),
            thread: Mutex::new(None),
        });
        Clock {
            core,
            rng: ClockRng::from_seed(seed),
        }
    }

    pub fn master_with(config: MasterConfig) -> Result<Clock, ConfigError> {
        let tempo = TempoEnvelope::new(config.initial_rate)?;
        let seed = config.seed.unwrap_or_else(|| fnv1a64(&config.name));
        let core = Arc::new(ClockCore {
            id: next_clock_id(),
            name: config.name,
            fork_seq: 0,
            seed,
            parent: None,
            parent_offset: 0.0,
            keeper: WaitKeeper::new(),
            state: Mutex::new(ClockState {
                tempo,
                held: None,
                dead: false,
                held_time: 0.0,
                queue: WakeUpQueue::new(),
                children: Vec::new(),
                fork_counter: 0,
                skipped: 0.0,
                ff_goal: None,
            }),
            start_instant: Instant::now(),
            thread: Mutex::new(None),
        });
        Ok(Clock {
            core,
            rng: ClockRng::from_seed(seed),
        })
    }

    /// A cloneable cross-thread handle to this clock.
    pub fn handle(&self) -> ClockHandle {
        ClockHandle {
            core: Arc::clone(&self.core),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_master(&self) -> bool {
        self.core.is_master()
    }

    /// Live position in this clock's own beats.
    pub fn beat(&self) -> f64 {
        self.core.current_beat()
    }

    /// Live elapsed time in this clock's time units (the parent's beats;
    /// wall seconds on the master). Excludes time spent held.
    pub fn time(&self) -> f64 {
        self.core.current_time()
    }

    pub fn beat_length(&self) -> f64 {
        self.core.beat_length_now()
    }

    pub fn rate(&self) -> f64 {
        1.0 / self.beat_length()
    }

    pub fn tempo(&self) -> f64 {
        60.0 / self.beat_length()
    }

    pub fn time_in_master(&self) -> f64 {
        self.core.time_in_master()
    }

    pub fn absolute_rate(&self) -> f64 {
        self.core.absolute_rate()
    }

    /// Block until `delta_beats` of this clock's beats have elapsed under
    /// whatever tempo curve is or becomes active. Non-positive and
    /// non-finite deltas are treated as zero (the call still lets due
    /// children run). Fails with [`Interrupted`] if the clock or an
    /// ancestor is killed.
    pub fn wait(&mut self, delta_beats: f64) -> Result<(), Interrupted> {
        let delta = if delta_beats.is_finite() && delta_beats > 0.0 {
            delta_beats
        } else {
            0.0
        };
        let target = { self.core.state.lock().unwrap().tempo.beat() } + delta;
        self.core.run_wait(target)
    }

    /// Block until every child forked before this call has finished.
    pub fn wait_for_children_to_finish(&mut self) -> Result<(), Interrupted> {
        self.core.run_wait_for_children()
    }

    /// Fork a child clock at rate 1 on a new thread running `f`.
    pub fn fork<F>(&mut self, f: F) -> Result<ClockHandle, ConfigError>
    where
        F: FnOnce(&mut Clock) -> Result<(), Interrupted> + Send + 'static,
    {
        self.core.fork_child(ForkOptions::default(), f)
    }

    pub fn fork_with<F>(&mut self, opts: ForkOptions, f: F) -> Result<ClockHandle, ConfigError>
    where
        F: FnOnce(&mut Clock) -> Result<(), Interrupted> + Send + 'static,
    {
        self.core.fork_child(opts, f)
    }

    /// Fire-and-forget plain thread with no clock attached; the tree does
    /// not wait for it.
    pub fn fork_unsynchronized<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("{}/unsync", self.core.name);
        // detached by design; a spawn failure here only loses the side task
        if let Err(err) = std::thread::Builder::new().name(name).spawn(f) {
            warn!("failed to spawn unsynchronized thread: {}", err);
        }
    }

    pub fn set_beat_length(&self, value: f64) -> Result<(), ConfigError> {
        self.core
            .mutate_tempo("set_beat_length", |t, b| t.set_beat_length_at(b, value))
    }

    pub fn set_rate(&self, value: f64) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_rate", |t, b| t.set_rate_at(b, value))
    }

    pub fn set_tempo(&self, value: f64) -> Result<(), ConfigError> {
        self.core
            .mutate_tempo("set_tempo", |t, b| t.set_tempo_at(b, value))
    }

    pub fn set_beat_length_target(
        &self,
        target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_beat_length_target", |t, b| {
            t.set_beat_length_target_at(b, target, duration, curve_shape, units)
        })
    }

    pub fn set_rate_target(
        &self,
        target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_rate_target", |t, b| {
            t.set_rate_target_at(b, target, duration, curve_shape, units)
        })
    }

    pub fn set_tempo_target(
        &self,
        target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_tempo_target", |t, b| {
            t.set_tempo_target_at(b, target, duration, curve_shape, units)
        })
    }

    /// Splice a whole tempo curve in at `start_beat` (the live current beat
    /// when `None`).
    pub fn apply_tempo_envelope(
        &self,
        envelope: &TempoEnvelope,
        start_beat: Option<f64>,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("apply_tempo_envelope", |t, b| {
            t.extend_with(envelope, start_beat.unwrap_or(b));
            Ok(())
        })
    }

    /// Make every sleep free until told otherwise. Master only.
    pub fn fast_forward(&self) -> Result<(), ConfigError> {
        self.core.set_ff_goal("fast_forward", f64::INFINITY)
    }

    pub fn fast_forward_in_time(&self, duration: f64) -> Result<(), ConfigError> {
        self.core.ff_goal_in_time("fast_forward_in_time", duration)
    }

    pub fn fast_forward_to_time(&self, target_time: f64) -> Result<(), ConfigError> {
        let now = self.core.current_time();
        self.core
            .ff_goal_in_time("fast_forward_to_time", target_time - now)
    }

    pub fn fast_forward_in_beats(&self, delta_beats: f64) -> Result<(), ConfigError> {
        let beat = self.core.current_beat();
        self.core
            .ff_goal_at_beat("fast_forward_in_beats", beat + delta_beats)
    }

    pub fn fast_forward_to_beat(&self, target_beat: f64) -> Result<(), ConfigError> {
        self.core
            .ff_goal_at_beat("fast_forward_to_beat", target_beat)
    }

    pub fn stop_fast_forwarding(&self) -> Result<(), ConfigError> {
        self.core.stop_fast_forwarding()
    }

    pub fn is_fast_forwarding(&self) -> bool {
        self.core.is_fast_forwarding()
    }

    /// Kill this clock and its whole subtree; all blocked waits in it fail
    /// with [`Interrupted`].
    pub fn kill(&self) {
        self.core.kill_subtree();
    }

    pub fn rouse_and_hold(&self) {
        self.core.hold_subtree();
    }

    pub fn release_from_suspension(&self) {
        self.core.release_subtree();
    }

    pub fn extract_absolute_tempo_envelope(
        &self,
        start_beat: f64,
        step_size: f64,
        tolerance: f64,
    ) -> Result<TempoEnvelope, ConfigError> {
        self.core.extract_absolute(start_beat, step_size, tolerance)
    }

    pub fn children(&self) -> Vec<ClockHandle> {
        self.core.child_handles()
    }

    /// This clock's deterministic random stream; replays identically for
    /// the same fork structure and seed.
    pub fn random(&mut self) -> f64 {
        self.rng.random()
    }

    pub fn random_range(&mut self, low: f64, high: f64) -> f64 {
        self.rng.random_range(low, high)
    }
}

/// A cloneable, thread-safe handle to a clock: observation, tempo changes,
/// hold and kill from any thread. Waiting and forking stay with the owning
/// [`Clock`].
#[derive(Clone)]
pub struct ClockHandle {
    core: Arc<ClockCore>,
}

impl ClockHandle {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_master(&self) -> bool {
        self.core.is_master()
    }

    pub fn is_dead(&self) -> bool {
        self.core.is_dead()
    }

    pub fn is_held(&self) -> bool {
        self.core.is_held()
    }

    pub fn beat(&self) -> f64 {
        self.core.current_beat()
    }

    pub fn time(&self) -> f64 {
        self.core.current_time()
    }

    pub fn beat_length(&self) -> f64 {
        self.core.beat_length_now()
    }

    pub fn rate(&self) -> f64 {
        1.0 / self.beat_length()
    }

    pub fn tempo(&self) -> f64 {
        60.0 / self.beat_length()
    }

    pub fn time_in_master(&self) -> f64 {
        self.core.time_in_master()
    }

    pub fn absolute_rate(&self) -> f64 {
        self.core.absolute_rate()
    }

    pub fn kill(&self) {
        self.core.kill_subtree();
    }

    pub fn rouse_and_hold(&self) {
        self.core.hold_subtree();
    }

    pub fn release_from_suspension(&self) {
        self.core.release_subtree();
    }

    pub fn set_beat_length(&self, value: f64) -> Result<(), ConfigError> {
        self.core
            .mutate_tempo("set_beat_length", |t, b| t.set_beat_length_at(b, value))
    }

    pub fn set_rate(&self, value: f64) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_rate", |t, b| t.set_rate_at(b, value))
    }

    pub fn set_tempo(&self, value: f64) -> Result<(), ConfigError> {
        self.core
            .mutate_tempo("set_tempo", |t, b| t.set_tempo_at(b, value))
    }

    pub fn set_beat_length_target(
        &self,
        target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_beat_length_target", |t, b| {
            t.set_beat_length_target_at(b, target, duration, curve_shape, units)
        })
    }

    pub fn set_rate_target(
        &self,
        target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_rate_target", |t, b| {
            t.set_rate_target_at(b, target, duration, curve_shape, units)
        })
    }

    pub fn set_tempo_target(
        &self,
        target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("set_tempo_target", |t, b| {
            t.set_tempo_target_at(b, target, duration, curve_shape, units)
        })
    }

    pub fn apply_tempo_envelope(
        &self,
        envelope: &TempoEnvelope,
        start_beat: Option<f64>,
    ) -> Result<(), ConfigError> {
        self.core.mutate_tempo("apply_tempo_envelope", |t, b| {
            t.extend_with(envelope, start_beat.unwrap_or(b));
            Ok(())
        })
    }

    pub fn extract_absolute_tempo_envelope(
        &self,
        start_beat: f64,
        step_size: f64,
        tolerance: f64,
    ) -> Result<TempoEnvelope, ConfigError> {
        self.core.extract_absolute(start_beat, step_size, tolerance)
    }

    pub fn children(&self) -> Vec<ClockHandle> {
        self.core.child_handles()
    }
}
