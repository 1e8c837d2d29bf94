//! Wake-up call queue - which child wakes next, at what parent beat
//!
//! Each waiting child registers one call keyed by its clock id. Backed by a
//! BinaryHeap plus a HashMap using the lazy deletion pattern: the map is the
//! source of truth, and stale heap entries are skipped on peek/pop. Ties on
//! the same beat break by fork sequence number, so siblings forked earlier
//! always wake first and replays are deterministic.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A child's pending wake-up: "release clock `clock_id` when the parent
/// reaches `beat`".
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WakeUpCall {
    pub clock_id: u64,
    pub beat: f64,
    pub fork_seq: u64,
}

/// Release ordering within a batch of due calls. Beats within `epsilon` of
/// each other count as the same musical instant and fall back to fork
/// order, so accumulated float rounding cannot reorder siblings that
/// targeted the same beat.
pub fn release_order(a: &WakeUpCall, b: &WakeUpCall, epsilon: f64) -> Ordering {
    let qa = (a.beat / epsilon).round();
    let qb = (b.beat / epsilon).round();
    qa.total_cmp(&qb).then(a.fork_seq.cmp(&b.fork_seq))
}

#[derive(Clone, Debug)]
struct HeapKey {
    beat: f64,
    fork_seq: u64,
    clock_id: u64,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.beat.to_bits() == other.beat.to_bits()
            && self.fork_seq == other.fork_seq
            && self.clock_id == other.clock_id
    }
}

impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so the ordering is reversed for min-heap
// behavior. total_cmp keeps float ordering deterministic (-0, NaN).
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.beat.total_cmp(&other.beat) {
            Ordering::Equal => match self.fork_seq.cmp(&other.fork_seq) {
                Ordering::Equal => self.clock_id.cmp(&other.clock_id),
                o => o,
            },
            o => o,
        }
        .reverse()
    }
}

/// Min-queue of wake-up calls with remove and retime support.
pub struct WakeUpQueue {
    heap: BinaryHeap<HeapKey>,
    live: HashMap<u64, (f64, u64)>, // clock_id -> (beat, fork_seq)
}

impl Default for WakeUpQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeUpQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Register a child's wake-up call. Returns false if the child already
    /// has one pending.
    pub fn register(&mut self, clock_id: u64, beat: f64, fork_seq: u64) -> bool {
        if self.live.contains_key(&clock_id) {
            return false;
        }
        self.live.insert(clock_id, (beat, fork_seq));
        self.heap.push(HeapKey {
            beat,
            fork_seq,
            clock_id,
        });
        true
    }

    /// Drop a child's pending call. Returns true if one existed.
    pub fn unregister(&mut self, clock_id: u64) -> bool {
        self.live.remove(&clock_id).is_some()
    }

    /// Move an existing call to a new beat, keeping its fork sequence.
    /// Pushes a fresh heap key; the old one goes stale. Returns false if the
    /// child has no pending call.
    pub fn retime(&mut self, clock_id: u64, new_beat: f64) -> bool {
        if let Some((beat, fork_seq)) = self.live.get_mut(&clock_id) {
            *beat = new_beat;
            let seq = *fork_seq;
            self.heap.push(HeapKey {
                beat: new_beat,
                fork_seq: seq,
                clock_id,
            });
            true
        } else {
            false
        }
    }

    pub fn contains(&self, clock_id: u64) -> bool {
        self.live.contains_key(&clock_id)
    }

    /// The earliest pending call, without removing it.
    pub fn peek(&mut self) -> Option<WakeUpCall> {
        self.discard_stale_top();
        let key = self.heap.peek()?;
        let (beat, fork_seq) = self.live.get(&key.clock_id)?;
        Some(WakeUpCall {
            clock_id: key.clock_id,
            beat: *beat,
            fork_seq: *fork_seq,
        })
    }

    /// Remove and return the earliest pending call.
    pub fn pop(&mut self) -> Option<WakeUpCall> {
        loop {
            let key = self.heap.pop()?;
            let Some((beat, fork_seq)) = self.live.get(&key.clock_id) else {
                continue; // stale
            };
            if beat.to_bits() != key.beat.to_bits() || *fork_seq != key.fork_seq {
                continue; // stale (call was retimed)
            }
            let (beat, fork_seq) = self.live.remove(&key.clock_id).unwrap();
            return Some(WakeUpCall {
                clock_id: key.clock_id,
                beat,
                fork_seq,
            });
        }
    }

    fn discard_stale_top(&mut self) {
        while let Some(key) = self.heap.peek() {
            let current = match self.live.get(&key.clock_id) {
                Some((beat, fork_seq)) => {
                    beat.to_bits() == key.beat.to_bits() && *fork_seq == key.fork_seq
                }
                None => false,
            };
            if current {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_beat_order() {
        let mut queue = WakeUpQueue::new();
        assert!(queue.register(1, 0.5, 0));
        assert!(queue.register(2, 0.2, 1));
        assert!(queue.register(3, 0.8, 2));
        assert!(!queue.register(3, 0.1, 3));

        let call = queue.pop().unwrap();
        assert_eq!(call.clock_id, 2);
        assert!((call.beat - 0.2).abs() < 1e-10);

        let call = queue.pop().unwrap();
        assert_eq!(call.clock_id, 1);

        let call = queue.pop().unwrap();
        assert_eq!(call.clock_id, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_unregister_skips_stale_heap_entry() {
        let mut queue = WakeUpQueue::new();
        queue.register(1, 0.5, 0);
        queue.register(2, 0.2, 1);

        assert!(queue.unregister(2));
        assert!(!queue.unregister(2));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.peek().unwrap().clock_id, 1);
        assert_eq!(queue.pop().unwrap().clock_id, 1);
    }

    #[test]
    fn test_retime_moves_call() {
        let mut queue = WakeUpQueue::new();
        queue.register(1, 0.5, 0);
        queue.register(2, 0.2, 1);

        assert!(queue.retime(1, 0.1));
        assert!(!queue.retime(99, 0.1));

        let call = queue.pop().unwrap();
        assert_eq!(call.clock_id, 1);
        assert!((call.beat - 0.1).abs() < 1e-10);
    }

    #[test]
    fn test_equal_beats_break_by_fork_seq() {
        let mut queue = WakeUpQueue::new();
        queue.register(1, 0.5, 2);
        queue.register(2, 0.5, 0);
        queue.register(3, 0.5, 1);

        assert_eq!(queue.pop().unwrap().clock_id, 2);
        assert_eq!(queue.pop().unwrap().clock_id, 3);
        assert_eq!(queue.pop().unwrap().clock_id, 1);
    }

    #[test]
    fn test_release_order_absorbs_sub_epsilon_beat_noise() {
        // three waits of 0.1 land an ulp past a single wait of 0.3
        let stepped = WakeUpCall {
            clock_id: 1,
            beat: 0.1 + 0.1 + 0.1,
            fork_seq: 0,
        };
        let direct = WakeUpCall {
            clock_id: 2,
            beat: 0.3,
            fork_seq: 1,
        };
        assert!(stepped.beat > direct.beat);

        let mut batch = vec![direct, stepped];
        batch.sort_by(|a, b| release_order(a, b, 1e-9));
        assert_eq!(batch[0].clock_id, 1, "fork order lost to rounding noise");
        assert_eq!(batch[1].clock_id, 2);

        // a genuine beat gap still orders by beat, not fork order
        let later = WakeUpCall {
            clock_id: 3,
            beat: 0.4,
            fork_seq: 0,
        };
        assert_eq!(release_order(&direct, &later, 1e-9), Ordering::Less);
    }

    #[test]
    fn test_clear_empties_everything() {
        let mut queue = WakeUpQueue::new();
        queue.register(1, 0.5, 0);
        queue.register(2, 0.2, 1);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
    }
}
