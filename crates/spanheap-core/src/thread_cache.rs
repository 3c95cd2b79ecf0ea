//! Per-thread slot caches.
//!
//! One intrusive singly-linked free list per size class, threaded through
//! the first word of each cached slot. The owning thread is the only
//! writer, so no lock is taken anywhere in this module. Lists drain back
//! to the central lists in class-sized batches once they grow past their
//! high-water mark, and wholesale on thread exit.

use crate::error::Corruption;
use crate::size_class::{SizeClass, NUM_SIZE_CLASSES};

/// Empty-list sentinel. Slot addresses are page-interior and never zero.
const NIL: usize = 0;

#[derive(Clone, Copy)]
struct ClassList {
    head: usize,
    len: usize,
}

pub struct ThreadCache {
    lists: [ClassList; NUM_SIZE_CLASSES],
}

// Slot links live in memory the cache exclusively owns until the slot is
// handed back out; the slot is at least pointer-sized and pointer-aligned.
unsafe fn read_next(slot: usize) -> usize {
    unsafe { (slot as *const usize).read() }
}

unsafe fn write_next(slot: usize, next: usize) {
    unsafe { (slot as *mut usize).write(next) }
}

impl ThreadCache {
    pub fn new() -> Self {
        Self { lists: [ClassList { head: NIL, len: 0 }; NUM_SIZE_CLASSES] }
    }

    /// Pops a cached slot for the class, if any.
    pub fn pop(&mut self, class_id: u8) -> Option<usize> {
        let list = &mut self.lists[class_id as usize];
        if list.head == NIL {
            return None;
        }
        let slot = list.head;
        list.head = unsafe { read_next(slot) };
        list.len -= 1;
        Some(slot)
    }

    /// Caches a freed slot. The list is scanned for the slot first; finding
    /// it means the same object is being freed twice, reported as a
    /// free-list cycle before anything is mutated. When the push takes the
    /// list past its high-water mark, a batch is unlinked and returned for
    /// the caller to hand to the central list.
    pub fn push(
        &mut self,
        class: SizeClass,
        slot: usize,
        batch_multiplier: usize,
    ) -> Result<Option<Vec<usize>>, Corruption> {
        if self.contains(class.id, slot) {
            return Err(Corruption::FreeListCycle { addr: slot });
        }
        let list = &mut self.lists[class.id as usize];
        unsafe { write_next(slot, list.head) };
        list.head = slot;
        list.len += 1;

        let batch = class.batch_size();
        if list.len > batch * batch_multiplier {
            return Ok(Some(self.unlink(class.id, batch)));
        }
        Ok(None)
    }

    /// Seeds the list with a batch fetched from the central list.
    pub fn fill(&mut self, class_id: u8, slots: &[usize]) {
        let list = &mut self.lists[class_id as usize];
        for &slot in slots {
            unsafe { write_next(slot, list.head) };
            list.head = slot;
            list.len += 1;
        }
    }

    /// Whether `slot` is currently cached for the class. The walk is
    /// bounded by the list length, so a corrupted link cannot loop it.
    pub fn contains(&self, class_id: u8, slot: usize) -> bool {
        let list = &self.lists[class_id as usize];
        let mut cur = list.head;
        for _ in 0..list.len {
            if cur == slot {
                return true;
            }
            if cur == NIL {
                break;
            }
            cur = unsafe { read_next(cur) };
        }
        false
    }

    /// Unlinks every cached slot of the class, for flush paths.
    pub fn drain_class(&mut self, class_id: u8) -> Vec<usize> {
        let len = self.lists[class_id as usize].len;
        self.unlink(class_id, len)
    }

    /// Class ids that currently hold at least one slot.
    pub fn occupied_classes(&self) -> Vec<u8> {
        (0..NUM_SIZE_CLASSES as u8)
            .filter(|&id| self.lists[id as usize].len > 0)
            .collect()
    }

    pub fn len(&self, class_id: u8) -> usize {
        self.lists[class_id as usize].len
    }

    fn unlink(&mut self, class_id: u8, n: usize) -> Vec<usize> {
        let list = &mut self.lists[class_id as usize];
        let n = n.min(list.len);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let slot = list.head;
            list.head = unsafe { read_next(slot) };
            list.len -= 1;
            out.push(slot);
        }
        out
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}
