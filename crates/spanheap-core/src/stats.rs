//! Heap observability: atomic counters and a bounded event ring.
//!
//! The allocator cannot call out to a logging framework from inside its own
//! hot paths (the framework would allocate, re-entering the heap), so
//! structured events are buffered in-heap and drained by whoever asks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic operation counters. All relaxed; these are observability,
/// not synchronization.
#[derive(Debug, Default)]
pub struct HeapCounters {
    pub small_allocs: AtomicU64,
    pub large_allocs: AtomicU64,
    pub frees: AtomicU64,
    pub reallocs: AtomicU64,
    pub realloc_in_place: AtomicU64,
    pub pages_reserved: AtomicU64,
    pub pages_released: AtomicU64,
    pub central_fetches: AtomicU64,
    pub central_returns: AtomicU64,
    pub cache_flushes: AtomicU64,
}

impl HeapCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of heap state, safe to hold with no locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub small_allocs: u64,
    pub large_allocs: u64,
    pub frees: u64,
    pub reallocs: u64,
    pub realloc_in_place: u64,
    pub pages_reserved: u64,
    pub pages_released: u64,
    pub central_fetches: u64,
    pub central_returns: u64,
    pub cache_flushes: u64,
    /// Pages currently sitting in the page heap's free lists.
    pub free_pages: usize,
    /// Live span records.
    pub spans: usize,
    pub page_map_hits: u64,
    pub page_map_misses: u64,
    pub page_map_evictions: u64,
}

impl HeapStats {
    /// Pages currently reserved from the source and not yet returned.
    pub fn pages_outstanding(&self) -> u64 {
        self.pages_reserved.saturating_sub(self.pages_released)
    }
}

/// Structured lifecycle events, ring-buffered with a fixed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapEvent {
    RegionReserved { start_page: usize, pages: usize },
    RegionReleased { start_page: usize, pages: usize },
    SpanSplit { start_page: usize, head_pages: usize, tail_pages: usize },
    SpanCoalesced { start_page: usize, pages: usize },
    SpanCarved { start_page: usize, class: u8 },
    SpanRetired { start_page: usize, class: u8 },
}

/// Fixed-capacity ring of recent events. Oldest entries are dropped first.
#[derive(Debug)]
pub struct EventRing {
    buf: VecDeque<HeapEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self { buf: VecDeque::with_capacity(capacity.min(1024)), capacity, dropped: 0 }
    }

    pub fn push(&mut self, event: HeapEvent) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
            self.dropped += 1;
        }
        self.buf.push_back(event);
    }

    /// Removes and returns all buffered events, oldest first.
    pub fn drain(&mut self) -> Vec<HeapEvent> {
        self.buf.drain(..).collect()
    }

    /// Events pushed out of the ring before anyone drained them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
