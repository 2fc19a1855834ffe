// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity presentation buffer pool.
//!
//! Slots are allocated once per configuration. After that only their
//! membership changes. Every slot sits in exactly one place:
//!
//! ```text
//!             submit / queue_slot           advance_current
//!   +------+ -----------------> +--------+ ---------------> +---------+
//!   | free |                    | queued |                  | current |
//!   +------+ <-+                +--------+                  +---------+
//!              |                    | skip_to / discard_*       |
//!              |  reclaim_discards  v                           | replaced
//!              +---------------- +---------+ <------------------+
//!                                | discard |
//!                                +---------+
//! ```
//!
//! `free + queued + discard + 1 == capacity` holds after every operation.
//! The pool itself is not synchronized. The presenter keeps it behind its
//! present lock together with the state variable.

use std::{collections::VecDeque, fmt};

use serde::Serialize;
use tracing::{error, warn};

use crate::interlace::{FieldSync, PresentMethod};

/// Smallest usable pool: one current slot plus one to fill.
pub const MIN_CAPACITY: usize = 2;

/// Index of a slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotIndex(pub usize);

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Presentation metadata of one queued buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlotEntry {
    /// Absolute present time in nanoseconds.
    pub timestamp: u64,
    /// Decode timestamp in seconds, for statistics.
    pub pts: f64,
    /// How the buffer is drawn.
    pub method: PresentMethod,
    /// Parity of the first field to show.
    pub field: FieldSync,
    /// Timing-loop correction in seconds, sampled when the buffer was queued.
    pub correction: f64,
}

/// Rotating set of presentation slots.
#[derive(Debug, Clone)]
pub struct BufferPool {
    entries: Vec<SlotEntry>,
    free: VecDeque<SlotIndex>,
    queued: VecDeque<SlotIndex>,
    discard: VecDeque<SlotIndex>,
    current: SlotIndex,
}

impl BufferPool {
    /// Creates a pool of `capacity` slots, see [`configure`](Self::configure).
    pub fn new(capacity: usize) -> Self {
        let mut pool = Self {
            entries: Vec::new(),
            free: VecDeque::new(),
            queued: VecDeque::new(),
            discard: VecDeque::new(),
            current: SlotIndex(0),
        };
        pool.configure(capacity);
        pool
    }

    /// Resizes the pool and resets all membership.
    ///
    /// Slot 0 becomes current, slots `1..capacity` are free. A capacity
    /// below [`MIN_CAPACITY`] is raised to it.
    pub fn configure(&mut self, capacity: usize) {
        let capacity = if capacity < MIN_CAPACITY {
            warn!("Buffer pool capacity {capacity} raised to {MIN_CAPACITY}");
            MIN_CAPACITY
        } else {
            capacity
        };
        self.entries = vec![SlotEntry::default(); capacity];
        self.flush();
    }

    /// Returns every slot to free and makes slot 0 current.
    pub fn flush(&mut self) {
        self.flush_keeping(SlotIndex(0));
    }

    /// Returns every slot except `current` to free.
    ///
    /// `current` keeps its metadata and becomes the current slot. An out of
    /// range index falls back to slot 0.
    pub fn flush_keeping(&mut self, current: SlotIndex) {
        let current = if current.0 < self.entries.len() {
            current
        } else {
            error!("Cannot keep {current}: pool has {} slots", self.entries.len());
            SlotIndex(0)
        };
        let kept = self.entries[current.0];
        self.entries.fill(SlotEntry::default());
        self.entries[current.0] = kept;
        self.free = (0..self.entries.len())
            .map(SlotIndex)
            .filter(|&slot| slot != current)
            .collect();
        self.queued.clear();
        self.discard.clear();
        self.current = current;
        debug_assert!(self.partition_holds());
    }

    /// Fills the head of the free list and queues it.
    ///
    /// Returns `None` when no slot is free.
    pub fn submit(&mut self, entry: SlotEntry) -> Option<SlotIndex> {
        let slot = self.free.pop_front()?;
        self.entries[slot.0] = entry;
        self.queued.push_back(slot);
        debug_assert!(self.partition_holds());
        Some(slot)
    }

    /// The slot the next submission will use.
    pub fn peek_free(&self) -> Option<SlotIndex> {
        self.free.front().copied()
    }

    /// Queues a specific free slot.
    ///
    /// Returns `false` (and logs) if `slot` is not free.
    pub fn queue_slot(&mut self, slot: SlotIndex, entry: SlotEntry) -> bool {
        let Some(pos) = self.free.iter().position(|&s| s == slot) else {
            error!("Cannot queue {slot}: it is not free");
            return false;
        };
        self.free.remove(pos);
        self.entries[slot.0] = entry;
        self.queued.push_back(slot);
        debug_assert!(self.partition_holds());
        true
    }

    /// Makes the oldest queued slot current.
    ///
    /// The previous current slot moves to the discard tail. With an empty
    /// queue nothing changes and `None` is returned.
    pub fn advance_current(&mut self) -> Option<SlotIndex> {
        let Some(next) = self.queued.pop_front() else {
            error!("advance_current called with an empty queue");
            return None;
        };
        self.discard.push_back(self.current);
        self.current = next;
        debug_assert!(self.partition_holds());
        Some(next)
    }

    /// Moves every queued slot older than `slot` to discard.
    ///
    /// Returns the number of slots skipped. If `slot` is not queued nothing
    /// moves.
    pub fn skip_to(&mut self, slot: SlotIndex) -> usize {
        let Some(pos) = self.queued.iter().position(|&s| s == slot) else {
            error!("Cannot skip to {slot}: it is not queued");
            return 0;
        };
        for skipped in self.queued.drain(..pos) {
            self.discard.push_back(skipped);
        }
        debug_assert!(self.partition_holds());
        pos
    }

    /// Moves the oldest queued slot to discard.
    pub fn discard_oldest(&mut self) -> bool {
        match self.queued.pop_front() {
            Some(slot) => {
                self.discard.push_back(slot);
                true
            }
            None => false,
        }
    }

    /// Returns releasable discard slots to the free list.
    ///
    /// `releasable` is asked once per discard slot. The reclaimed slots are
    /// returned in discard order so the caller can release their backend
    /// resources.
    pub fn reclaim_discards<F>(&mut self, mut releasable: F) -> Vec<SlotIndex>
    where
        F: FnMut(SlotIndex) -> bool,
    {
        let mut reclaimed = Vec::new();
        self.discard.retain(|&slot| {
            if releasable(slot) {
                reclaimed.push(slot);
                false
            } else {
                true
            }
        });
        self.free.extend(reclaimed.iter().copied());
        debug_assert!(self.partition_holds());
        reclaimed
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// The slot currently on screen.
    pub fn current(&self) -> SlotIndex {
        self.current
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of queued slots.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Number of slots waiting to be reclaimed.
    pub fn discard_count(&self) -> usize {
        self.discard.len()
    }

    /// Queued slots, oldest first.
    pub fn queued(&self) -> impl DoubleEndedIterator<Item = SlotIndex> + ExactSizeIterator + '_ {
        self.queued.iter().copied()
    }

    /// Slots waiting to be reclaimed, oldest first.
    pub fn discarded(&self) -> impl Iterator<Item = SlotIndex> + '_ {
        self.discard.iter().copied()
    }

    /// The oldest queued slot.
    pub fn front_queued(&self) -> Option<SlotIndex> {
        self.queued.front().copied()
    }

    /// The newest queued slot.
    pub fn back_queued(&self) -> Option<SlotIndex> {
        self.queued.back().copied()
    }

    /// Metadata of `slot`, `None` if out of range.
    pub fn entry(&self, slot: SlotIndex) -> Option<&SlotEntry> {
        self.entries.get(slot.0)
    }

    /// Metadata of the current slot.
    pub fn current_entry(&self) -> SlotEntry {
        self.entries[self.current.0]
    }

    /// Returns `true` if every slot is in exactly one place.
    pub fn partition_holds(&self) -> bool {
        let capacity = self.entries.len();
        if self.free.len() + self.queued.len() + self.discard.len() + 1 != capacity {
            return false;
        }
        let mut seen = vec![false; capacity];
        let all = self
            .free
            .iter()
            .chain(&self.queued)
            .chain(&self.discard)
            .chain(std::iter::once(&self.current));
        for slot in all {
            match seen.get_mut(slot.0) {
                Some(s) if !*s => *s = true,
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(timestamp: u64) -> SlotEntry {
        SlotEntry {
            timestamp,
            ..Default::default()
        }
    }

    #[test]
    fn configure_starts_with_slot_zero_current() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.current(), SlotIndex(0));
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.peek_free(), Some(SlotIndex(1)));
        assert!(pool.partition_holds());
    }

    #[test]
    fn capacity_is_clamped() {
        let pool = BufferPool::new(0);
        assert_eq!(pool.capacity(), MIN_CAPACITY);
        assert!(pool.partition_holds());
    }

    #[test]
    fn submit_until_backpressure() {
        let mut pool = BufferPool::new(3);
        assert_eq!(pool.submit(at(0)), Some(SlotIndex(1)));
        assert_eq!(pool.submit(at(1)), Some(SlotIndex(2)));
        assert_eq!(pool.submit(at(2)), None);
        assert_eq!(pool.queued_count(), 2);
        assert!(pool.partition_holds());
    }

    #[test]
    fn advance_is_fifo_and_discards_previous() {
        let mut pool = BufferPool::new(4);
        for t in 0..3 {
            pool.submit(at(t));
        }
        assert_eq!(pool.advance_current(), Some(SlotIndex(1)));
        assert_eq!(pool.current_entry().timestamp, 0);
        assert_eq!(pool.advance_current(), Some(SlotIndex(2)));
        assert_eq!(pool.current_entry().timestamp, 1);
        assert_eq!(pool.discard_count(), 2);
        assert!(pool.partition_holds());
    }

    #[test]
    fn advance_on_empty_queue_is_noop() {
        let mut pool = BufferPool::new(3);
        assert_eq!(pool.advance_current(), None);
        assert_eq!(pool.current(), SlotIndex(0));
        assert_eq!(pool.discard_count(), 0);
        assert!(pool.partition_holds());
    }

    #[test]
    fn reclaim_respects_predicate() {
        let mut pool = BufferPool::new(4);
        for t in 0..3 {
            pool.submit(at(t));
        }
        pool.advance_current();
        pool.advance_current();
        pool.advance_current();
        // Discard holds slots 0, 1, 2. Keep slot 1 referenced.
        let reclaimed = pool.reclaim_discards(|slot| slot != SlotIndex(1));
        assert_eq!(reclaimed, vec![SlotIndex(0), SlotIndex(2)]);
        assert_eq!(pool.discard_count(), 1);
        assert_eq!(pool.free_count(), 2);
        assert!(pool.partition_holds());
    }

    #[test]
    fn queue_slot_requires_free_slot() {
        let mut pool = BufferPool::new(3);
        assert!(pool.queue_slot(SlotIndex(2), at(5)));
        assert_eq!(pool.front_queued(), Some(SlotIndex(2)));
        assert!(!pool.queue_slot(SlotIndex(2), at(6)));
        assert!(!pool.queue_slot(SlotIndex(0), at(6)));
        assert!(pool.partition_holds());
    }

    #[test]
    fn skip_to_moves_older_slots() {
        let mut pool = BufferPool::new(5);
        for t in 0..4 {
            pool.submit(at(t));
        }
        assert_eq!(pool.skip_to(SlotIndex(3)), 2);
        assert_eq!(pool.front_queued(), Some(SlotIndex(3)));
        assert_eq!(pool.discard_count(), 2);
        assert_eq!(pool.skip_to(SlotIndex(1)), 0);
        assert!(pool.partition_holds());
    }

    #[test]
    fn discard_helpers() {
        let mut pool = BufferPool::new(4);
        assert!(!pool.discard_oldest());
        for t in 0..3 {
            pool.submit(at(t));
        }
        assert!(pool.discard_oldest());
        assert_eq!(pool.front_queued(), Some(SlotIndex(2)));
        assert_eq!(pool.queued_count(), 2);
        assert_eq!(pool.discard_count(), 1);
        assert!(pool.partition_holds());
    }

    #[test]
    fn flush_resets_membership() {
        let mut pool = BufferPool::new(4);
        for t in 0..3 {
            pool.submit(at(t));
        }
        pool.advance_current();
        pool.flush();
        assert_eq!(pool.queued_count(), 0);
        assert_eq!(pool.discard_count(), 0);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.current(), SlotIndex(0));
        assert!(pool.partition_holds());
    }

    #[test]
    fn flush_keeping_holds_the_shown_slot() {
        let mut pool = BufferPool::new(4);
        for t in 0..3 {
            pool.submit(at(t));
        }
        pool.advance_current();
        pool.advance_current();
        assert_eq!(pool.current(), SlotIndex(2));

        pool.flush_keeping(SlotIndex(2));
        assert_eq!(pool.current(), SlotIndex(2));
        assert_eq!(pool.current_entry().timestamp, 1);
        assert_eq!(pool.queued_count(), 0);
        assert_eq!(pool.discard_count(), 0);
        assert_eq!(pool.peek_free(), Some(SlotIndex(0)));
        assert!(pool.free_count() == 3 && pool.partition_holds());

        pool.flush_keeping(SlotIndex(9));
        assert_eq!(pool.current(), SlotIndex(0));
        assert!(pool.partition_holds());
    }
}
