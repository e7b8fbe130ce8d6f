// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp;

///
/// A contiguous, growable FIFO queue.
///
/// Storage doubles on demand, starting from capacity 0: a fresh buffer owns
/// no storage at all, and the first enqueue grows it to 1.
///
pub(crate) struct RingBuffer<T> {
    storage: Vec<Option<T>>,
    start: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub(crate) fn new() -> RingBuffer<T> {
        RingBuffer {
            storage: Vec::new(),
            start: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn slot(&self, offset: usize) -> usize {
        (self.start + offset) % self.capacity()
    }

    ///
    /// Grows the storage to `new_capacity`, which must not be below the
    /// current capacity. FIFO order is preserved: when the contents wrap, the
    /// segment between `start` and the end of storage moves to the new end,
    /// so the region from `start` onward stays contiguous:
    ///
    ///   [345_012] -> [345________012]
    ///
    pub(crate) fn grow(&mut self, new_capacity: usize) {
        debug_assert!(
            new_capacity >= self.capacity(),
            "cannot shrink from {} to {}",
            self.capacity(),
            new_capacity
        );
        if new_capacity == self.capacity() {
            return;
        }

        let tail = cmp::min(self.capacity() - self.start, self.len);
        self.storage.resize_with(new_capacity, || None);

        if self.start > 0 && tail > 0 {
            let new_start = new_capacity - tail;
            // Walk backwards: the regions may overlap when growing by less
            // than double.
            for offset in (0..tail).rev() {
                self.storage[new_start + offset] = self.storage[self.start + offset].take();
            }
            self.start = new_start;
        }
    }

    pub(crate) fn enqueue(&mut self, value: T) {
        if self.len == self.capacity() {
            let new_capacity = cmp::max(1, self.capacity() * 2);
            self.grow(new_capacity);
        }
        let slot = self.slot(self.len);
        debug_assert!(self.storage[slot].is_none());
        self.storage[slot] = Some(value);
        self.len += 1;
    }

    /// Removes and returns the oldest value, or None if the buffer is empty.
    pub(crate) fn dequeue(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.storage[self.start].take();
        debug_assert!(value.is_some());
        self.len -= 1;
        self.start = self.slot(1);
        value
    }

    /// Removes and returns the newest value, or None if the buffer is empty.
    #[allow(dead_code)]
    pub(crate) fn dequeue_back(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        let slot = self.slot(self.len);
        let value = self.storage[slot].take();
        debug_assert!(value.is_some());
        value
    }
}
