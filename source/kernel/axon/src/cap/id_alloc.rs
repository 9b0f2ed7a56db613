// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lowest-free-first capability id allocator.

use alloc::collections::BTreeSet;

use crate::types::CapId;

/// Hands out ids `1..=max`; id 0 stays the invalid sentinel.
#[derive(Debug)]
pub struct IdAllocator {
    /// First id never handed out so far.
    next: u32,
    max: u32,
    /// Released ids below `next`.
    free: BTreeSet<u32>,
}

impl IdAllocator {
    pub const MIN: u32 = 1;

    pub fn new(max: u32) -> Self {
        Self { next: Self::MIN, max: max.max(Self::MIN), free: BTreeSet::new() }
    }

    pub fn alloc(&mut self) -> Option<CapId> {
        if let Some(id) = self.free.pop_first() {
            return Some(CapId::from_raw(id));
        }
        if self.next > self.max {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(CapId::from_raw(id))
    }

    /// Returns `id` to the pool. Freeing an id twice or one never allocated is ignored.
    pub fn free(&mut self, id: CapId) -> bool {
        let raw = id.as_raw();
        if raw < Self::MIN || raw >= self.next {
            return false;
        }
        if raw + 1 == self.next {
            self.next = raw;
            while self.next > Self::MIN && self.free.remove(&(self.next - 1)) {
                self.next -= 1;
            }
            return true;
        }
        self.free.insert(raw)
    }

    pub fn is_allocated(&self, id: CapId) -> bool {
        let raw = id.as_raw();
        raw >= Self::MIN && raw < self.next && !self.free.contains(&raw)
    }

    pub fn in_use(&self) -> usize {
        (self.next - Self::MIN) as usize - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_first() {
        let mut ids = IdAllocator::new(16);
        let a = ids.alloc().expect("a");
        let b = ids.alloc().expect("b");
        let c = ids.alloc().expect("c");
        assert_eq!((a.as_raw(), b.as_raw(), c.as_raw()), (1, 2, 3));
        assert!(ids.free(b));
        assert!(ids.free(a));
        assert_eq!(ids.alloc(), Some(a));
        assert_eq!(ids.alloc(), Some(b));
        assert_eq!(ids.alloc().map(CapId::as_raw), Some(4));
    }

    #[test]
    fn exhaustion_and_double_free() {
        let mut ids = IdAllocator::new(2);
        let a = ids.alloc().expect("a");
        assert!(ids.alloc().is_some());
        assert!(ids.alloc().is_none());
        assert!(ids.free(a));
        assert!(!ids.free(a));
        assert!(!ids.free(CapId::INVALID));
        assert_eq!(ids.in_use(), 1);
    }

    #[test]
    fn freeing_tail_shrinks_watermark() {
        let mut ids = IdAllocator::new(8);
        let a = ids.alloc().expect("a");
        let b = ids.alloc().expect("b");
        assert!(ids.free(a));
        assert!(ids.free(b));
        assert_eq!(ids.in_use(), 0);
        assert!(!ids.is_allocated(a));
        assert_eq!(ids.alloc(), Some(a));
    }
}
