//! Page-run management: reservations, span splitting and coalescing, and
//! return of whole reservations to the page source.
//!
//! All state lives under one `parking_lot::RwLock`. Allocation and release
//! take the write lock; pointer classification on the free path takes only
//! the read lock. Free runs are kept in per-length buckets (1..=128 pages)
//! with an overflow list for longer runs, searched best-fit.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::config::HeapConfig;
use crate::error::AllocError;
use crate::page_map::PageMap;
use crate::page_source::{PageSource, Reservation};
use crate::span::{Span, SpanId, SpanState, SpanTable};
use crate::stats::{EventRing, HeapEvent};

/// Longest run length with a dedicated free bucket; longer runs go to the
/// overflow list.
const BUCKETED_PAGES: usize = 128;

/// Read-lock view of a span, handed to the free/realloc paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanSnapshot {
    pub id: SpanId,
    pub start_page: usize,
    pub pages: usize,
    pub state: SpanState,
    pub size_class: Option<u8>,
}

/// A run granted by [`PageHeap::allocate_run`].
#[derive(Debug, Clone, Copy)]
pub struct RunGrant {
    pub id: SpanId,
    /// Base address of the run, page aligned.
    pub addr: usize,
}

/// Aggregate page-heap accounting, folded into `HeapStats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageHeapStats {
    pub free_pages: usize,
    pub spans: usize,
    pub pages_reserved: u64,
    pub pages_released: u64,
    pub map_hits: u64,
    pub map_misses: u64,
    pub map_evictions: u64,
}

struct HeapState {
    spans: SpanTable,
    map: PageMap,
    /// `free_buckets[n - 1]` holds free runs of exactly `n` pages.
    free_buckets: Vec<Vec<SpanId>>,
    /// Free runs longer than `BUCKETED_PAGES` pages.
    free_large: Vec<SpanId>,
    /// Reservation start page -> reservation length in pages.
    regions: HashMap<usize, usize>,
    free_pages: usize,
    pages_reserved: u64,
    pages_released: u64,
    source: Box<dyn PageSource>,
    events: EventRing,
}

pub struct PageHeap {
    page_size: usize,
    config: HeapConfig,
    state: RwLock<HeapState>,
}

impl PageHeap {
    pub fn new(source: Box<dyn PageSource>, config: HeapConfig) -> Self {
        let page_size = source.page_size();
        Self {
            page_size,
            config,
            state: RwLock::new(HeapState {
                spans: SpanTable::new(),
                map: PageMap::new(),
                free_buckets: (0..BUCKETED_PAGES).map(|_| Vec::new()).collect(),
                free_large: Vec::new(),
                regions: HashMap::new(),
                free_pages: 0,
                pages_reserved: 0,
                pages_released: 0,
                source,
                events: EventRing::new(config.event_log_capacity),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Resolves an address to the span covering its page. Read lock only.
    /// `None` means the page is not indexed: either foreign memory or the
    /// interior of a large/free span, both of which the caller must treat
    /// as unverifiable.
    pub fn lookup(&self, addr: usize) -> Option<SpanSnapshot> {
        let page = addr / self.page_size;
        let state = self.state.read();
        let id = state.map.lookup(page)?;
        let span = state.spans.get(id)?;
        Some(SpanSnapshot {
            id,
            start_page: span.start_page,
            pages: span.pages,
            state: span.state,
            size_class: span.size_class,
        })
    }

    /// Allocates a run of exactly `pages` pages in the given in-use state.
    ///
    /// Searches existing free runs best-fit, splitting when the fit is not
    /// exact; reserves a fresh region from the page source on a miss. A
    /// failed reservation surfaces as `AllocError::Exhausted` with no
    /// partial grant.
    pub fn allocate_run(
        &self,
        pages: usize,
        run_state: SpanState,
        size_class: Option<u8>,
    ) -> Result<RunGrant, AllocError> {
        debug_assert!(pages >= 1);
        debug_assert!(run_state != SpanState::Free);
        let mut st = self.state.write();
        let id = match Self::find_free_run(&mut st, pages) {
            Some(id) => id,
            None => {
                Self::reserve_region(&mut st, pages.max(self.config.min_reservation_pages))?;
                match Self::find_free_run(&mut st, pages) {
                    Some(id) => id,
                    // The fresh region is at least `pages` long.
                    None => return Err(AllocError::Exhausted { pages }),
                }
            }
        };
        let grant = self.carve(&mut st, id, pages, run_state, size_class);
        Ok(grant)
    }

    /// Returns an in-use span to the free state: unindexes it, coalesces
    /// with free neighbors from the same reservation, and hands whole
    /// reservations back to the page source once retained free pages
    /// exceed the configured ceiling.
    ///
    /// The span id must be live and in-use; the facade validates before
    /// calling.
    pub fn release_span(&self, id: SpanId) {
        let mut st = self.state.write();
        let Some(span) = st.spans.get(id).cloned() else {
            return;
        };
        Self::unregister_pages(&mut st.map, &span, id);
        if let Some(class) = span.size_class {
            st.events.push(HeapEvent::SpanRetired { start_page: span.start_page, class });
        }

        let mut start_page = span.start_page;
        let mut pages = span.pages;
        let region_start = span.region_start;
        st.spans.remove(id);

        // Merge with a free predecessor ending at our start page.
        if start_page > 0 {
            if let Some(prev_id) = st.map.lookup(start_page - 1) {
                if let Some(prev) = st.spans.get(prev_id) {
                    if prev.state == SpanState::Free
                        && prev.region_start == region_start
                        && prev.end_page() == start_page
                    {
                        let prev = prev.clone();
                        Self::detach_free(&mut st, prev_id, &prev);
                        start_page = prev.start_page;
                        pages += prev.pages;
                    }
                }
            }
        }
        // Merge with a free successor starting at our end page.
        if let Some(next_id) = st.map.lookup(start_page + pages) {
            if let Some(next) = st.spans.get(next_id) {
                if next.state == SpanState::Free
                    && next.region_start == region_start
                    && next.start_page == start_page + pages
                {
                    let next = next.clone();
                    Self::detach_free(&mut st, next_id, &next);
                    pages += next.pages;
                }
            }
        }
        if pages > span.pages {
            st.events.push(HeapEvent::SpanCoalesced { start_page, pages });
        }

        Self::attach_free(
            &mut st,
            Span {
                start_page,
                pages,
                state: SpanState::Free,
                size_class: None,
                region_start,
            },
        );

        if st.free_pages > self.config.max_retained_free_pages {
            Self::trim(&mut st);
        }
    }

    /// Forces every fully-free reservation back to the page source.
    pub fn release_unused_memory(&self) {
        let mut st = self.state.write();
        Self::trim(&mut st);
    }

    pub fn stats(&self) -> PageHeapStats {
        let st = self.state.read();
        PageHeapStats {
            free_pages: st.free_pages,
            spans: st.spans.len(),
            pages_reserved: st.pages_reserved,
            pages_released: st.pages_released,
            map_hits: st.map.cache_hits(),
            map_misses: st.map.cache_misses(),
            map_evictions: st.map.cache_evictions(),
        }
    }

    /// Drains the buffered lifecycle events, oldest first.
    pub fn drain_events(&self) -> Vec<HeapEvent> {
        self.state.write().events.drain()
    }

    // Best-fit over the buckets, then the overflow list.
    fn find_free_run(st: &mut HeapState, pages: usize) -> Option<SpanId> {
        if pages <= BUCKETED_PAGES {
            for bucket in pages - 1..BUCKETED_PAGES {
                if let Some(&id) = st.free_buckets[bucket].last() {
                    return Some(id);
                }
            }
        }
        let mut best: Option<(SpanId, usize)> = None;
        for &id in &st.free_large {
            if let Some(span) = st.spans.get(id) {
                if span.pages >= pages && best.map_or(true, |(_, p)| span.pages < p) {
                    best = Some((id, span.pages));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    fn reserve_region(st: &mut HeapState, pages: usize) -> Result<(), AllocError> {
        let region = st.source.reserve(pages)?;
        let page_size = st.source.page_size();
        let start_page = region.addr / page_size;
        st.regions.insert(start_page, region.pages);
        st.pages_reserved += region.pages as u64;
        st.events.push(HeapEvent::RegionReserved { start_page, pages: region.pages });
        Self::attach_free(
            st,
            Span {
                start_page,
                pages: region.pages,
                state: SpanState::Free,
                size_class: None,
                region_start: start_page,
            },
        );
        Ok(())
    }

    // Takes `pages` off the front of free span `id`, re-freeing the tail.
    fn carve(
        &self,
        st: &mut HeapState,
        id: SpanId,
        pages: usize,
        run_state: SpanState,
        size_class: Option<u8>,
    ) -> RunGrant {
        let span = st.spans.get(id).cloned().unwrap_or_else(|| {
            unreachable!("free-list id always resolves under the write lock")
        });
        Self::detach_free(st, id, &span);

        if span.pages > pages {
            st.events.push(HeapEvent::SpanSplit {
                start_page: span.start_page,
                head_pages: pages,
                tail_pages: span.pages - pages,
            });
            Self::attach_free(
                st,
                Span {
                    start_page: span.start_page + pages,
                    pages: span.pages - pages,
                    state: SpanState::Free,
                    size_class: None,
                    region_start: span.region_start,
                },
            );
        }

        let head = Span {
            start_page: span.start_page,
            pages,
            state: run_state,
            size_class,
            region_start: span.region_start,
        };
        let head_id = st.spans.insert(head.clone());
        Self::register_pages(&mut st.map, &head, head_id);
        if let Some(class) = size_class {
            st.events.push(HeapEvent::SpanCarved { start_page: head.start_page, class });
        }
        RunGrant { id: head_id, addr: head.start_page * self.page_size }
    }

    // Inserts a FREE span record, indexes its boundaries, and files it in
    // the free structures.
    fn attach_free(st: &mut HeapState, span: Span) {
        let pages = span.pages;
        let id = st.spans.insert(span.clone());
        Self::register_pages(&mut st.map, &span, id);
        if pages <= BUCKETED_PAGES {
            st.free_buckets[pages - 1].push(id);
        } else {
            st.free_large.push(id);
        }
        st.free_pages += pages;
    }

    // Removes a FREE span from the free structures, its boundary index
    // entries, and the span table.
    fn detach_free(st: &mut HeapState, id: SpanId, span: &Span) {
        let list = if span.pages <= BUCKETED_PAGES {
            &mut st.free_buckets[span.pages - 1]
        } else {
            &mut st.free_large
        };
        if let Some(pos) = list.iter().position(|&x| x == id) {
            list.swap_remove(pos);
        }
        Self::unregister_pages(&mut st.map, span, id);
        st.spans.remove(id);
        st.free_pages -= span.pages;
    }

    // Small spans index every page so interior pointers classify; large
    // and free spans index their boundary pages only.
    fn register_pages(map: &mut PageMap, span: &Span, id: SpanId) {
        match span.state {
            SpanState::InUseSmall => {
                for page in span.start_page..span.end_page() {
                    map.insert(page, id);
                }
            }
            SpanState::InUseLarge | SpanState::Free => {
                map.insert(span.start_page, id);
                if span.pages > 1 {
                    map.insert(span.end_page() - 1, id);
                }
            }
        }
    }

    fn unregister_pages(map: &mut PageMap, span: &Span, _id: SpanId) {
        match span.state {
            SpanState::InUseSmall => {
                for page in span.start_page..span.end_page() {
                    map.remove(page);
                }
            }
            SpanState::InUseLarge | SpanState::Free => {
                map.remove(span.start_page);
                if span.pages > 1 {
                    map.remove(span.end_page() - 1);
                }
            }
        }
    }

    // Releases every free span that exactly covers its reservation.
    fn trim(st: &mut HeapState) {
        let mut whole: Vec<(SpanId, Span)> = Vec::new();
        for bucket in st.free_buckets.iter().chain(std::iter::once(&st.free_large)) {
            for &id in bucket {
                if let Some(span) = st.spans.get(id) {
                    if span.start_page == span.region_start
                        && st.regions.get(&span.region_start) == Some(&span.pages)
                    {
                        whole.push((id, span.clone()));
                    }
                }
            }
        }
        for (id, span) in whole {
            Self::detach_free(st, id, &span);
            st.regions.remove(&span.region_start);
            st.pages_released += span.pages as u64;
            st.events
                .push(HeapEvent::RegionReleased { start_page: span.start_page, pages: span.pages });
            let page_size = st.source.page_size();
            st.source.release(Reservation {
                addr: span.start_page * page_size,
                pages: span.pages,
            });
        }
    }
}

impl Drop for PageHeap {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let page_size = st.source.page_size();
        let regions: Vec<(usize, usize)> = st.regions.drain().collect();
        for (start_page, pages) in regions {
            st.source.release(Reservation { addr: start_page * page_size, pages });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_source::{QuotaPageSource, SystemPageSource};

    fn heap(quota_pages: usize) -> PageHeap {
        let source = QuotaPageSource::new(SystemPageSource::new(), quota_pages);
        let config = HeapConfig { min_reservation_pages: 16, ..HeapConfig::default() };
        PageHeap::new(Box::new(source), config)
    }

    #[test]
    fn allocate_splits_and_lookup_classifies() {
        let heap = heap(64);
        let a = heap.allocate_run(3, SpanState::InUseLarge, None).unwrap();
        let snap = heap.lookup(a.addr).unwrap();
        assert_eq!(snap.pages, 3);
        assert_eq!(snap.state, SpanState::InUseLarge);
        assert_eq!(snap.start_page * heap.page_size(), a.addr);
        // Interior page of a large span is not indexed.
        assert!(heap.lookup(a.addr + heap.page_size()).is_none());
        // Last page is.
        assert!(heap.lookup(a.addr + 2 * heap.page_size()).is_some());
    }

    #[test]
    fn small_spans_index_every_page() {
        let heap = heap(64);
        let a = heap.allocate_run(4, SpanState::InUseSmall, Some(7)).unwrap();
        for page in 0..4 {
            let snap = heap.lookup(a.addr + page * heap.page_size()).unwrap();
            assert_eq!(snap.id, a.id);
            assert_eq!(snap.size_class, Some(7));
        }
    }

    #[test]
    fn release_coalesces_adjacent_runs() {
        let heap = heap(64);
        let a = heap.allocate_run(2, SpanState::InUseLarge, None).unwrap();
        let b = heap.allocate_run(2, SpanState::InUseLarge, None).unwrap();
        let c = heap.allocate_run(2, SpanState::InUseLarge, None).unwrap();
        // a and b are adjacent carves from the same region.
        assert_eq!(b.addr, a.addr + 2 * heap.page_size());
        heap.release_span(a.id);
        heap.release_span(b.id);
        // The merged run serves a 4-page request at a's address.
        let d = heap.allocate_run(4, SpanState::InUseLarge, None).unwrap();
        assert_eq!(d.addr, a.addr);
        heap.release_span(c.id);
        heap.release_span(d.id);
    }

    #[test]
    fn exhaustion_is_reported_not_granted() {
        let heap = heap(16);
        let a = heap.allocate_run(16, SpanState::InUseLarge, None).unwrap();
        assert!(matches!(
            heap.allocate_run(1, SpanState::InUseLarge, None),
            Err(AllocError::Exhausted { .. })
        ));
        heap.release_span(a.id);
        // Freed pages make the next request succeed again.
        heap.allocate_run(1, SpanState::InUseLarge, None).unwrap();
    }

    #[test]
    fn whole_regions_return_to_source_under_pressure() {
        let source = QuotaPageSource::new(SystemPageSource::new(), 64);
        let config = HeapConfig {
            min_reservation_pages: 16,
            max_retained_free_pages: 8,
            ..HeapConfig::default()
        };
        let heap = PageHeap::new(Box::new(source), config);
        let a = heap.allocate_run(16, SpanState::InUseLarge, None).unwrap();
        heap.release_span(a.id);
        let stats = heap.stats();
        assert_eq!(stats.pages_released, 16);
        assert_eq!(stats.free_pages, 0);
    }

    #[test]
    fn release_unused_memory_forces_trim() {
        let heap = heap(64);
        let a = heap.allocate_run(16, SpanState::InUseLarge, None).unwrap();
        heap.release_span(a.id);
        assert_eq!(heap.stats().pages_released, 0);
        heap.release_unused_memory();
        let stats = heap.stats();
        assert_eq!(stats.pages_released, 16);
        assert_eq!(stats.free_pages, 0);
    }

    #[test]
    fn events_record_region_and_split_lifecycle() {
        let heap = heap(64);
        let a = heap.allocate_run(2, SpanState::InUseLarge, None).unwrap();
        heap.release_span(a.id);
        let events = heap.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, HeapEvent::RegionReserved { pages: 16, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, HeapEvent::SpanSplit { head_pages: 2, .. })));
        assert!(events.iter().any(|e| matches!(e, HeapEvent::SpanCoalesced { .. })));
    }
}
