//! Deadline-ordered binary min-heap with identity lookups.
//!
//! The heap backs the [`crate::Scheduler`]: each entry pairs a deadline
//! with a payload (the sleeper's result channel) and an [`Ident`].
//! Beyond the usual push/pop-min it supports removing an entry by
//! identity and re-stamping an entry's deadline in place, sifting it up
//! or down as needed; that is how an alert jumps a sleeper to the head.
//!
//! Identity lookups are linear scans; entries sharing an ident are
//! legal, but only the first match is affected. Keep idents unique.

use crate::alert::Ident;
use std::time::Instant;

struct HeapEntry<T> {
    deadline: Instant,
    payload: T,
    ident: Ident,
}

/// A min-heap of `(deadline, payload, ident)` entries.
pub struct TimerHeap<T> {
    entries: Vec<HeapEntry<T>>,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerHeap<T> {
    /// Creates an empty heap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of scheduled entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds an entry.
    pub fn schedule(&mut self, payload: T, deadline: Instant, ident: Ident) {
        self.entries.push(HeapEntry {
            deadline,
            payload,
            ident,
        });
        self.sift_up(self.entries.len() - 1);
    }

    /// The earliest deadline, if any.
    #[must_use]
    pub fn first_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.deadline)
    }

    /// Removes and returns the payload with the earliest deadline.
    pub fn pop_first(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let entry = self.entries.pop().expect("checked non-empty");
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(entry.payload)
    }

    /// Removes the first entry matching `ident` and returns its payload.
    pub fn remove_by_ident(&mut self, ident: Ident) -> Option<T> {
        let at = self.entries.iter().position(|entry| entry.ident == ident)?;
        let last = self.entries.len() - 1;
        self.entries.swap(at, last);
        let entry = self.entries.pop().expect("position exists");
        if at < self.entries.len() {
            // The swapped-in entry may violate either direction.
            self.sift_up(at);
            self.sift_down(at);
        }
        Some(entry.payload)
    }

    /// Re-stamps the deadline of the first entry matching `ident`,
    /// restoring heap order in place. Returns false if no entry matches.
    pub fn set_time(&mut self, ident: Ident, deadline: Instant) -> bool {
        let Some(at) = self.entries.iter().position(|entry| entry.ident == ident) else {
            return false;
        };
        let earlier = deadline < self.entries[at].deadline;
        self.entries[at].deadline = deadline;
        if earlier {
            self.sift_up(at);
        } else {
            self.sift_down(at);
        }
        true
    }

    /// Drains every entry, heap order not guaranteed.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..).map(|entry| entry.payload)
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.entries[parent].deadline <= self.entries[at].deadline {
                break;
            }
            self.entries.swap(parent, at);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * at + 1;
            let right = 2 * at + 2;
            let mut smallest = at;
            if left < len && self.entries[left].deadline < self.entries[smallest].deadline {
                smallest = left;
            }
            if right < len && self.entries[right].deadline < self.entries[smallest].deadline {
                smallest = right;
            }
            if smallest == at {
                break;
            }
            self.entries.swap(at, smallest);
            at = smallest;
        }
    }
}

impl<T> std::fmt::Debug for TimerHeap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHeap")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn empty_heap_has_no_deadline() {
        let heap: TimerHeap<u32> = TimerHeap::new();
        assert!(heap.is_empty());
        assert!(heap.first_deadline().is_none());
    }

    #[test]
    fn pops_in_deadline_order() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        for (label, ms) in [(1u32, 1000), (2, 500), (3, 1500), (4, 700), (5, 825), (6, 225)] {
            heap.schedule(label, at(base, ms), Ident::NONE);
        }
        assert_eq!(heap.first_deadline(), Some(at(base, 225)));

        let mut order = Vec::new();
        while let Some(label) = heap.pop_first() {
            order.push(label);
        }
        assert_eq!(order, vec![6, 2, 4, 5, 1, 3]);
    }

    #[test]
    fn remove_by_ident_takes_the_matching_entry() {
        let base = Instant::now();
        let target = 1u8;
        let mut heap = TimerHeap::new();
        heap.schedule("early", at(base, 10), Ident::NONE);
        heap.schedule("target", at(base, 20), Ident::of(&target));
        heap.schedule("late", at(base, 30), Ident::NONE);

        assert_eq!(heap.remove_by_ident(Ident::of(&target)), Some("target"));
        assert_eq!(heap.remove_by_ident(Ident::of(&target)), None);
        assert_eq!(heap.pop_first(), Some("early"));
        assert_eq!(heap.pop_first(), Some("late"));
    }

    #[test]
    fn set_time_moves_an_entry_to_the_head() {
        let base = Instant::now();
        let target = 1u8;
        let mut heap = TimerHeap::new();
        heap.schedule("a", at(base, 100), Ident::NONE);
        heap.schedule("b", at(base, 200), Ident::of(&target));
        heap.schedule("c", at(base, 300), Ident::NONE);

        assert!(heap.set_time(Ident::of(&target), base));
        assert_eq!(heap.first_deadline(), Some(base));
        assert_eq!(heap.pop_first(), Some("b"));
    }

    #[test]
    fn set_time_can_also_push_an_entry_back() {
        let base = Instant::now();
        let target = 1u8;
        let mut heap = TimerHeap::new();
        heap.schedule("a", at(base, 100), Ident::of(&target));
        heap.schedule("b", at(base, 200), Ident::NONE);

        assert!(heap.set_time(Ident::of(&target), at(base, 900)));
        assert_eq!(heap.pop_first(), Some("b"));
        assert_eq!(heap.pop_first(), Some("a"));
    }

    #[test]
    fn set_time_with_unknown_ident_is_a_no_op() {
        let mut heap: TimerHeap<u32> = TimerHeap::new();
        assert!(!heap.set_time(Ident::from_token(9), Instant::now()));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn pops_are_always_sorted(offsets in proptest::collection::vec(0u64..10_000, 1..64)) {
                let base = Instant::now();
                let mut heap = TimerHeap::new();
                for (index, ms) in offsets.iter().enumerate() {
                    heap.schedule(index, at(base, *ms), Ident::from_token(index + 1));
                }

                let mut previous = None;
                while let Some(first) = heap.first_deadline() {
                    heap.pop_first();
                    if let Some(previous) = previous {
                        prop_assert!(previous <= first);
                    }
                    previous = Some(first);
                }
                prop_assert!(heap.is_empty());
            }

            #[test]
            fn set_time_preserves_order(
                offsets in proptest::collection::vec(0u64..10_000, 2..32),
                moved in 0usize..32,
                new_offset in 0u64..10_000,
            ) {
                let base = Instant::now();
                let moved = moved % offsets.len();
                let mut heap = TimerHeap::new();
                for (index, ms) in offsets.iter().enumerate() {
                    heap.schedule(index, at(base, *ms), Ident::from_token(index + 1));
                }

                prop_assert!(heap.set_time(Ident::from_token(moved + 1), at(base, new_offset)));

                let mut previous = None;
                while let Some(first) = heap.first_deadline() {
                    heap.pop_first();
                    if let Some(previous) = previous {
                        prop_assert!(previous <= first);
                    }
                    previous = Some(first);
                }
            }
        }
    }
}
