//! The allocator facade.
//!
//! `Heap` is a cheap `Arc` handle over shared engine state: the size-class
//! table, the page heap, and one central free list per class. Per-thread
//! caches live in thread-local storage keyed by heap id; the thread-exit
//! destructor flushes every cache whose heap is still alive, so slots
//! parked in a dying thread return to circulation instead of leaking.
//!
//! Small requests run thread-cache -> central list -> page heap; requests
//! above `MAX_SMALL_SIZE` go straight to the page heap as whole-page spans.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::central_list::CentralFreeList;
use crate::config::HeapConfig;
use crate::error::{AllocError, Corruption, HeapError};
use crate::page_heap::PageHeap;
use crate::page_source::{PageSource, SystemPageSource};
use crate::size_class::SizeClassTable;
use crate::span::SpanState;
use crate::stats::{HeapCounters, HeapEvent, HeapStats};
use crate::thread_cache::ThreadCache;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

struct HeapInner {
    id: u64,
    page_size: usize,
    config: HeapConfig,
    classes: SizeClassTable,
    page_heap: PageHeap,
    central: Vec<CentralFreeList>,
    counters: HeapCounters,
}

/// Shared handle to one allocator instance.
#[derive(Clone)]
pub struct Heap {
    inner: Arc<HeapInner>,
}

struct CacheSlot {
    heap: Weak<HeapInner>,
    cache: ThreadCache,
}

struct Registry {
    slots: HashMap<u64, CacheSlot>,
}

impl Drop for Registry {
    fn drop(&mut self) {
        for slot in self.slots.values_mut() {
            // A dead heap's memory is already unmapped; its cached slot
            // addresses must not be touched.
            if let Some(inner) = slot.heap.upgrade() {
                flush_cache(&inner, &mut slot.cache);
            }
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry { slots: HashMap::new() });
}

fn with_cache<R>(inner: &Arc<HeapInner>, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    REGISTRY.with(|r| {
        let mut reg = r.borrow_mut();
        let slot = reg.slots.entry(inner.id).or_insert_with(|| CacheSlot {
            heap: Arc::downgrade(inner),
            cache: ThreadCache::new(),
        });
        f(&mut slot.cache)
    })
}

// Drains every occupied class list back to the central lists. Corruption
// surfacing here means the batch was already reported against some earlier
// free; the remaining slots of that class are dropped rather than re-fed.
fn flush_cache(inner: &HeapInner, cache: &mut ThreadCache) {
    for class_id in cache.occupied_classes() {
        let slots = cache.drain_class(class_id);
        let _ = inner.central[class_id as usize].return_batch(&slots, &inner.page_heap);
    }
    HeapCounters::bump(&inner.counters.cache_flushes);
}

impl Heap {
    /// Builds a heap over the operating system's pages.
    pub fn new(config: HeapConfig) -> Self {
        Self::with_source(Box::new(SystemPageSource::new()), config)
    }

    /// Builds a heap over an arbitrary page source (tests use a
    /// quota-limited one).
    pub fn with_source(source: Box<dyn PageSource>, config: HeapConfig) -> Self {
        let page_size = source.page_size();
        let classes = SizeClassTable::new(page_size);
        let central = classes
            .iter()
            .map(|&class| CentralFreeList::new(class, page_size))
            .collect();
        Self {
            inner: Arc::new(HeapInner {
                id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
                page_size,
                config,
                classes,
                page_heap: PageHeap::new(source, config),
                central,
                counters: HeapCounters::default(),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Allocates `size` bytes. Zero-size requests are served from the
    /// minimal class: non-null, and freeable like any other allocation.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let inner = &self.inner;
        if let Some(class) = inner.classes.class_for(size) {
            let slot = with_cache(inner, |cache| -> Result<usize, AllocError> {
                if let Some(slot) = cache.pop(class.id) {
                    return Ok(slot);
                }
                let mut batch = Vec::with_capacity(class.batch_size());
                inner.central[class.id as usize].fetch_batch(
                    class.batch_size(),
                    &inner.page_heap,
                    &mut batch,
                )?;
                HeapCounters::bump(&inner.counters.central_fetches);
                let slot = match batch.pop() {
                    Some(slot) => slot,
                    None => return Err(AllocError::Exhausted { pages: class.pages_per_span }),
                };
                cache.fill(class.id, &batch);
                Ok(slot)
            })?;
            HeapCounters::bump(&inner.counters.small_allocs);
            // Slots are interior to mapped pages, never address zero.
            Ok(unsafe { NonNull::new_unchecked(slot as *mut u8) })
        } else {
            let pages = size.div_ceil(inner.page_size);
            let grant = inner.page_heap.allocate_run(pages, SpanState::InUseLarge, None)?;
            HeapCounters::bump(&inner.counters.large_allocs);
            Ok(unsafe { NonNull::new_unchecked(grant.addr as *mut u8) })
        }
    }

    /// Allocates `count * size` zeroed bytes. The multiplication is
    /// checked; on overflow nothing is allocated.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::Overflow { count, size })?;
        let ptr = self.allocate(total)?;
        // Recycled slots carry stale bytes; fresh pages are zero already,
        // but distinguishing the two costs more than the memset.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// Resizes an allocation.
    ///
    /// Null grows from nothing (plain allocate); zero `new_size` frees and
    /// returns `Ok(None)`. The pointer is unchanged when the new size maps
    /// to the same small class, or the same page count for a span-backed
    /// allocation. Otherwise allocate-copy-free, preserving
    /// `min(old_usable, new_size)` bytes.
    pub fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let inner = &self.inner;
        if ptr.is_null() {
            return Ok(Some(self.allocate(new_size)?));
        }
        if new_size == 0 {
            self.release(ptr)?;
            return Ok(None);
        }
        HeapCounters::bump(&inner.counters.reallocs);

        let addr = ptr as usize;
        let snap = inner
            .page_heap
            .lookup(addr)
            .ok_or(Corruption::InvalidPointer { addr })?;
        let old_usable = match snap.state {
            SpanState::InUseSmall => match snap.size_class {
                Some(id) => {
                    let slot_size = inner.classes.class(id).slot_size;
                    if (addr - snap.start_page * inner.page_size) % slot_size != 0 {
                        return Err(Corruption::InvalidPointer { addr }.into());
                    }
                    slot_size
                }
                None => return Err(Corruption::InvalidPointer { addr }.into()),
            },
            SpanState::InUseLarge => {
                if addr != snap.start_page * inner.page_size {
                    return Err(Corruption::NotSpanStart { addr }.into());
                }
                snap.pages * inner.page_size
            }
            SpanState::Free => return Err(Corruption::NotInUse { addr }.into()),
        };

        let in_place = match (snap.state, inner.classes.class_for(new_size)) {
            (SpanState::InUseSmall, Some(new_class)) => Some(new_class.id) == snap.size_class,
            (SpanState::InUseLarge, None) => {
                new_size.div_ceil(inner.page_size) == snap.pages
            }
            _ => false,
        };
        if in_place {
            HeapCounters::bump(&inner.counters.realloc_in_place);
            // Safe per the null check above.
            return Ok(Some(unsafe { NonNull::new_unchecked(ptr) }));
        }

        let new_ptr = self.allocate(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_usable.min(new_size));
        }
        self.release(ptr)?;
        Ok(Some(new_ptr))
    }

    /// Frees an allocation. Null is a no-op. Every corruption category is
    /// detected before any state is mutated:
    /// pointers that resolve to no span, or to an unindexed interior page,
    /// are invalid; a span-backed pointer that is not the span's start is
    /// `NotSpanStart`; a span already free is `NotInUse`; a small slot
    /// already sitting in the freeing thread's list is a free-list cycle.
    pub fn release(&self, ptr: *mut u8) -> Result<(), Corruption> {
        if ptr.is_null() {
            return Ok(());
        }
        let inner = &self.inner;
        let addr = ptr as usize;
        let snap = inner
            .page_heap
            .lookup(addr)
            .ok_or(Corruption::InvalidPointer { addr })?;
        match snap.state {
            SpanState::Free => Err(Corruption::NotInUse { addr }),
            SpanState::InUseLarge => {
                if addr != snap.start_page * inner.page_size {
                    return Err(Corruption::NotSpanStart { addr });
                }
                inner.page_heap.release_span(snap.id);
                HeapCounters::bump(&inner.counters.frees);
                Ok(())
            }
            SpanState::InUseSmall => {
                let class = match snap.size_class {
                    Some(id) => inner.classes.class(id),
                    None => return Err(Corruption::InvalidPointer { addr }),
                };
                let offset = addr - snap.start_page * inner.page_size;
                if offset % class.slot_size != 0 {
                    return Err(Corruption::InvalidPointer { addr });
                }
                let shed = with_cache(inner, |cache| {
                    cache.push(class, addr, inner.config.thread_cache_batch_multiplier)
                })?;
                if let Some(batch) = shed {
                    inner.central[class.id as usize].return_batch(&batch, &inner.page_heap)?;
                    HeapCounters::bump(&inner.counters.central_returns);
                }
                HeapCounters::bump(&inner.counters.frees);
                Ok(())
            }
        }
    }

    /// Bytes actually reserved for the allocation backing `ptr`; zero for
    /// null or unrecognized pointers.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let inner = &self.inner;
        match inner.page_heap.lookup(ptr as usize) {
            Some(snap) => match snap.state {
                SpanState::InUseSmall => snap
                    .size_class
                    .map_or(0, |id| inner.classes.class(id).slot_size),
                SpanState::InUseLarge => snap.pages * inner.page_size,
                SpanState::Free => 0,
            },
            None => 0,
        }
    }

    /// Drains this thread's cache for this heap back to the central lists.
    pub fn flush_thread_cache(&self) -> Result<(), Corruption> {
        let inner = &self.inner;
        with_cache(inner, |cache| -> Result<(), Corruption> {
            for class_id in cache.occupied_classes() {
                let slots = cache.drain_class(class_id);
                inner.central[class_id as usize].return_batch(&slots, &inner.page_heap)?;
                HeapCounters::bump(&inner.counters.central_returns);
            }
            Ok(())
        })?;
        HeapCounters::bump(&inner.counters.cache_flushes);
        Ok(())
    }

    /// Hands every fully-free reservation back to the page source.
    pub fn release_unused_memory(&self) {
        self.inner.page_heap.release_unused_memory();
    }

    pub fn stats(&self) -> HeapStats {
        let c = &self.inner.counters;
        let ph = self.inner.page_heap.stats();
        HeapStats {
            small_allocs: c.small_allocs.load(Ordering::Relaxed),
            large_allocs: c.large_allocs.load(Ordering::Relaxed),
            frees: c.frees.load(Ordering::Relaxed),
            reallocs: c.reallocs.load(Ordering::Relaxed),
            realloc_in_place: c.realloc_in_place.load(Ordering::Relaxed),
            pages_reserved: ph.pages_reserved,
            pages_released: ph.pages_released,
            central_fetches: c.central_fetches.load(Ordering::Relaxed),
            central_returns: c.central_returns.load(Ordering::Relaxed),
            cache_flushes: c.cache_flushes.load(Ordering::Relaxed),
            free_pages: ph.free_pages,
            spans: ph.spans,
            page_map_hits: ph.map_hits,
            page_map_misses: ph.map_misses,
            page_map_evictions: ph.map_evictions,
        }
    }

    /// Drains the buffered page-heap lifecycle events.
    pub fn drain_events(&self) -> Vec<HeapEvent> {
        self.inner.page_heap.drain_events()
    }
}
