use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::EventLoop;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;

pub(crate) struct TimerEntry {
    pub(crate) name: &'static str,
    pub(crate) cb: TimerCallback,
    pub(crate) deadline_ms: u64,
    /// `None` means one-shot: the timer self-destroys after firing.
    pub(crate) period_ms: Option<u64>,
}

/// The timer wheel: a min-heap ordered by deadline (ties broken by
/// insertion sequence, so firing order is stable) over an id-keyed map.
/// Destroyed timers leave stale heap entries behind; the map is the source
/// of truth and stale pops are discarded.
pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<(u64, u64, TimerId)>>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
    next_seq: u64,
    /// Cached smallest deadline; `None` when invalidated by add/remove/fire.
    cached_deadline: Option<Option<u64>>,
}

impl Timers {
    pub(crate) fn new() -> Timers {
        Timers {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 1,
            next_seq: 0,
            cached_deadline: None,
        }
    }

    pub(crate) fn add(
        &mut self,
        name: &'static str,
        deadline_ms: u64,
        period_ms: Option<u64>,
        cb: TimerCallback,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id.0,
            TimerEntry {
                name,
                cb,
                deadline_ms,
                period_ms,
            },
        );
        self.push_deadline(id, deadline_ms);
        self.cached_deadline = None;
        id
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> bool {
        let removed = self.entries.remove(&id.0).is_some();
        if removed {
            self.cached_deadline = None;
        }
        removed
    }

    pub(crate) fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id.0)
    }

    fn push_deadline(&mut self, id: TimerId, deadline_ms: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((deadline_ms, seq, id)));
    }

    /// Pops the next timer due at or before `now`, skipping entries whose
    /// timer was destroyed or rescheduled since they were pushed.
    pub(crate) fn pop_due(&mut self, now_ms: u64) -> Option<(TimerId, TimerEntry)> {
        while let Some(Reverse((deadline, _, id))) = self.heap.peek().copied() {
            if deadline > now_ms {
                return None;
            }
            self.heap.pop();
            match self.entries.get(&id.0) {
                Some(entry) if entry.deadline_ms == deadline => {
                    self.cached_deadline = None;
                    let entry = self.entries.remove(&id.0).unwrap();
                    return Some((id, entry));
                }
                _ => continue, // stale
            }
        }
        None
    }

    /// Re-arms a periodic timer after it fired.
    pub(crate) fn reschedule(&mut self, id: TimerId, entry: TimerEntry) {
        let deadline = entry.deadline_ms;
        self.entries.insert(id.0, entry);
        self.push_deadline(id, deadline);
        self.cached_deadline = None;
    }

    /// Smallest deadline over active timers, cached between structural
    /// changes.
    pub(crate) fn next_deadline(&mut self) -> Option<u64> {
        if let Some(cached) = self.cached_deadline {
            return cached;
        }
        let deadline = self.entries.values().map(|e| e.deadline_ms).min();
        self.cached_deadline = Some(deadline);
        deadline
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timers")
            .field("active", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn noop() -> TimerCallback {
        Rc::new(RefCell::new(|_: &mut EventLoop| {}))
    }

    #[test]
    fn fires_in_deadline_order_with_stable_ties() {
        let mut timers = Timers::new();
        let a = timers.add("a", 10, None, noop());
        let b = timers.add("b", 5, None, noop());
        let c = timers.add("c", 10, None, noop());

        assert_eq!(timers.next_deadline(), Some(5));
        assert_eq!(timers.pop_due(20).unwrap().0, b);
        assert_eq!(timers.pop_due(20).unwrap().0, a);
        assert_eq!(timers.pop_due(20).unwrap().0, c);
        assert!(timers.pop_due(20).is_none());
    }

    #[test]
    fn removed_timer_never_pops() {
        let mut timers = Timers::new();
        let id = timers.add("t", 1, None, noop());
        assert!(timers.remove(id));
        assert!(timers.pop_due(100).is_none());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn reschedule_invalidates_stale_heap_entries() {
        let mut timers = Timers::new();
        let id = timers.add("t", 10, Some(10), noop());
        let (popped, mut entry) = timers.pop_due(10).unwrap();
        assert_eq!(popped, id);
        entry.deadline_ms = 20;
        timers.reschedule(id, entry);

        // Nothing further is due before the new deadline.
        assert!(timers.pop_due(15).is_none());
        assert_eq!(timers.next_deadline(), Some(20));
        assert!(timers.pop_due(20).is_some());
    }
}
