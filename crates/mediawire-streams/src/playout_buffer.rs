//! Timestamped playout buffer for video.
//!
//! A circular buffer like [`RingBuffer`](crate::ring_buffer::RingBuffer),
//! but reads are by timestamp window instead of FIFO order. The scheduler
//! asks for "the oldest frame near time T" and the buffer answers, throwing
//! away anything that has become too old to play on the way.
//!
//! Removal from the middle keeps the remaining entries in insertion order:
//! entries between the logical start and the hole shift forward by one and
//! the start advances.
//!
//! Timestamps are 32-bit milliseconds and wrap after about 49 days. All
//! comparisons are wrapping, so ordering holds as long as the buffered
//! entries and the target lie within 2^31 ms of each other.

/// `a` is strictly older than `b` in wrapping time.
fn is_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// One buffered payload with its scheduling metadata.
#[derive(Debug, PartialEq, Eq)]
pub struct PlayoutEntry<T> {
    pub payload: T,
    /// Opaque flags carried alongside the payload.
    pub tag: u64,
    pub timestamp: u32,
}

pub struct PlayoutBuffer<T> {
    slots: Vec<Option<PlayoutEntry<T>>>,
    start: usize,
    end: usize,
}

impl<T> PlayoutBuffer<T> {
    /// A buffer of `capacity` slots, one of which is always kept free.
    /// Capacities below 2 are raised to 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            start: 0,
            end: 0,
        }
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    fn prev(&self, index: usize) -> usize {
        (index + self.slots.len() - 1) % self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_full(&self) -> bool {
        self.next(self.end) == self.start
    }

    pub fn size(&self) -> usize {
        (self.end + self.slots.len() - self.start) % self.slots.len()
    }

    /// Append an entry. When full, the oldest entry is evicted and returned.
    pub fn write(&mut self, payload: T, tag: u64, timestamp: u32) -> Option<PlayoutEntry<T>> {
        let evicted = if self.is_full() {
            let old = self.slots[self.start].take();
            self.start = self.next(self.start);
            old
        } else {
            None
        };

        self.slots[self.end] = Some(PlayoutEntry {
            payload,
            tag,
            timestamp,
        });
        self.end = self.next(self.end);
        evicted
    }

    /// Remove the entry at physical `index` and close the hole.
    fn remove_at(&mut self, index: usize) -> Option<PlayoutEntry<T>> {
        let removed = self.slots[index].take();
        let mut hole = index;
        while hole != self.start {
            let prev = self.prev(hole);
            self.slots[hole] = self.slots[prev].take();
            hole = prev;
        }
        self.start = self.next(self.start);
        removed
    }

    /// Remove every entry with `timestamp < threshold`, returned oldest first.
    pub fn evict_older_than(&mut self, threshold: u32) -> Vec<PlayoutEntry<T>> {
        let mut removed = Vec::new();
        let mut index = self.start;
        while index != self.end {
            let stale = matches!(
                &self.slots[index],
                Some(e) if is_before(e.timestamp, threshold)
            );
            if stale {
                // Entries after `index` stay put; the shifted ones were
                // already checked.
                if let Some(entry) = self.remove_at(index) {
                    removed.push(entry);
                }
            }
            index = self.next(index);
        }
        removed
    }

    /// Pop the oldest entry within `tolerance` ms of `target`.
    pub fn take_oldest_in_range(&mut self, target: u32, tolerance: u32) -> Option<PlayoutEntry<T>> {
        let mut best: Option<(usize, u32)> = None;
        let mut index = self.start;
        while index != self.end {
            if let Some(entry) = &self.slots[index] {
                let ts = entry.timestamp;
                let near = (ts.wrapping_sub(target) as i32).unsigned_abs() <= tolerance;
                let better = best.map_or(true, |(_, best_ts)| is_before(ts, best_ts));
                if near && better {
                    best = Some((index, ts));
                }
            }
            index = self.next(index);
        }

        let (found, _) = best?;
        self.slots.swap(found, self.start);
        let entry = self.slots[self.start].take();
        self.start = self.next(self.start);
        entry
    }

    /// Drop stale entries, then pop the oldest entry near `target`.
    ///
    /// Returns the entry and the number of stale entries removed. Stale
    /// entries are removed even when nothing is in range.
    pub fn read_in_range(
        &mut self,
        target: u32,
        tolerance: u32,
        older_than: u32,
    ) -> Option<(PlayoutEntry<T>, usize)> {
        let removed = self.evict_older_than(older_than).len();
        self.take_oldest_in_range(target, tolerance)
            .map(|entry| (entry, removed))
    }

    /// `(min, max)` timestamp over the current contents.
    pub fn range(&self) -> Option<(u32, u32)> {
        let mut bounds: Option<(u32, u32)> = None;
        let mut index = self.start;
        while index != self.end {
            if let Some(entry) = &self.slots[index] {
                let ts = entry.timestamp;
                bounds = Some(match bounds {
                    None => (ts, ts),
                    Some((lo, hi)) => (
                        if is_before(ts, lo) { ts } else { lo },
                        if is_before(hi, ts) { ts } else { hi },
                    ),
                });
            }
            index = self.next(index);
        }
        bounds
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<PlayoutEntry<T>> {
        let mut out = Vec::with_capacity(self.size());
        while !self.is_empty() {
            if let Some(entry) = self.slots[self.start].take() {
                out.push(entry);
            }
            self.start = self.next(self.start);
        }
        out
    }
}
