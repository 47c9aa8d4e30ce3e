//! Fixed-capacity table of in-flight accumulations keyed by accumulation number

use std::collections::VecDeque;

/// At most `capacity` accumulations are tracked at once. Opening a new one when
/// full drops the oldest-opened entry, which caps the memory a stalled unit can
/// hold. Nothing here times out a stall on its own.
#[derive(Debug)]
pub struct Slots<T> {
    capacity: usize,
    slots: VecDeque<(u32, T)>,
}

impl<T> Slots<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: VecDeque::with_capacity(capacity),
        }
    }

    /// Get the entry for `acc_n`, creating it with `init` if absent.
    /// Also returns the accumulation number that was evicted to make room, if any.
    pub fn entry(&mut self, acc_n: u32, init: impl FnOnce() -> T) -> (&mut T, Option<u32>) {
        let mut evicted = None;
        let idx = match self.position(acc_n) {
            Some(idx) => idx,
            None => {
                if self.slots.len() >= self.capacity {
                    evicted = self.slots.pop_front().map(|(n, _)| n);
                }
                self.slots.push_back((acc_n, init()));
                self.slots.len() - 1
            }
        };
        (&mut self.slots[idx].1, evicted)
    }

    pub fn get(&self, acc_n: u32) -> Option<&T> {
        self.position(acc_n).map(|idx| &self.slots[idx].1)
    }

    pub fn remove(&mut self, acc_n: u32) -> Option<T> {
        self.position(acc_n)
            .and_then(|idx| self.slots.remove(idx))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn position(&self, acc_n: u32) -> Option<usize> {
        self.slots.iter().position(|(n, _)| *n == acc_n)
    }
}
