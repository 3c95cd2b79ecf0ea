//! Page-number to span mapping.
//!
//! Two layers: an authoritative `HashMap` from page number to [`SpanId`],
//! fronted by a small direct-mapped cache sized at 2^12 entries. The cache
//! is lossy (inserts overwrite whatever hashed to the same line) but never
//! wrong: each line carries the full page number as its tag, so a probe
//! either hits the exact page or falls through to the authoritative map.
//!
//! Small spans are registered page by page so interior pointers classify
//! correctly; large and free spans register their boundary pages only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::span::SpanId;

const CACHE_BITS: usize = 12;
const CACHE_SIZE: usize = 1 << CACHE_BITS;

/// One direct-mapped line. Tag 0 means empty; live tags store `page + 1`
/// so page number 0 is representable.
#[derive(Clone, Copy)]
struct CacheLine {
    tag: usize,
    id: SpanId,
}

pub struct PageMap {
    entries: HashMap<usize, SpanId>,
    cache: Box<[Option<CacheLine>; CACHE_SIZE]>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            cache: Box::new([None; CACHE_SIZE]),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn line(page: usize) -> usize {
        page & (CACHE_SIZE - 1)
    }

    /// Registers `page` as belonging to span `id` and warms the cache line.
    pub fn insert(&mut self, page: usize, id: SpanId) {
        self.entries.insert(page, id);
        let slot = &mut self.cache[Self::line(page)];
        if let Some(old) = slot {
            if old.tag != page + 1 {
                *self.evictions.get_mut() += 1;
            }
        }
        *slot = Some(CacheLine { tag: page + 1, id });
    }

    /// Drops the mapping for `page`, invalidating its cache line if the
    /// line still holds this page.
    pub fn remove(&mut self, page: usize) -> Option<SpanId> {
        let removed = self.entries.remove(&page);
        if removed.is_some() {
            let slot = &mut self.cache[Self::line(page)];
            if matches!(slot, Some(line) if line.tag == page + 1) {
                *slot = None;
            }
        }
        removed
    }

    /// Resolves a page number to its span, if any page registration covers
    /// it. Does not warm the cache; lines are filled on insert only.
    pub fn lookup(&self, page: usize) -> Option<SpanId> {
        if let Some(line) = &self.cache[Self::line(page)] {
            if line.tag == page + 1 {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(line.id);
            }
        }
        let found = self.entries.get(&page).copied();
        self.misses.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn cache_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Number of registered pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}
