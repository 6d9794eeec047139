//! Fixed-capacity FIFO used for audio.
//!
//! One slot always stays empty so `start == end` means empty and
//! `next(end) == start` means full; usable capacity is `capacity - 1`.
//! Writing into a full buffer evicts the oldest entry and hands it back.

pub struct RingBuffer<T> {
    slots: Vec<Option<(T, u8)>>,
    start: usize,
    end: usize,
}

impl<T> RingBuffer<T> {
    /// A buffer of `capacity` slots. Capacities below 2 are raised to 2.
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

    /// Append an entry. Returns the evicted oldest entry when full.
    pub fn write(&mut self, item: T, tag: u8) -> Option<(T, u8)> {
        let evicted = if self.is_full() {
            let old = self.slots[self.start].take();
            self.start = self.next(self.start);
            old
        } else {
            None
        };

        self.slots[self.end] = Some((item, tag));
        self.end = self.next(self.end);
        evicted
    }

    /// Remove and return the oldest entry.
    pub fn read(&mut self) -> Option<(T, u8)> {
        if self.is_empty() {
            return None;
        }
        let entry = self.slots[self.start].take();
        self.start = self.next(self.start);
        entry
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<(T, u8)> {
        let mut out = Vec::with_capacity(self.size());
        while let Some(entry) = self.read() {
            out.push(entry);
        }
        out
    }
}
