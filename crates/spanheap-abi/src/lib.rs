//! ABI layer for the spanheap allocator.
//!
//! Exposes prefixed C-style entry points (`spanheap_malloc` and friends),
//! a [`GlobalAlloc`] adapter, and the fatal-corruption boundary: the engine
//! reports corruption as values; this crate is where a detected corruption
//! becomes a categorized message on stderr followed by process abort.
//!
//! Unprefixed `malloc`/`free`/… symbols are gated behind the `c_api`
//! feature so test binaries never shadow the system allocator (which would
//! recurse through the test harness's own allocations).
//!
//! A thread-local re-entry guard keeps the engine's internal allocations
//! (its own maps and vectors, served by the Rust global allocator) from
//! recursing back into the engine when the adapter is installed as the
//! global allocator; nested requests are passed through to [`System`].

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ffi::c_void;
use std::sync::OnceLock;

use spanheap_core::error::Corruption;
use spanheap_core::{Heap, HeapConfig, MIN_SIZE};

static GLOBAL_HEAP: OnceLock<Heap> = OnceLock::new();

/// The process-wide heap behind the C entry points, built lazily from
/// `SPANHEAP_*` environment configuration.
pub fn global_heap() -> &'static Heap {
    GLOBAL_HEAP.get_or_init(|| Heap::new(HeapConfig::from_env()))
}

/// Corruption is unrecoverable: the heap's internal invariants can no
/// longer be trusted, so the process stops here rather than continuing on
/// corrupted state.
fn fatal(corruption: Corruption) -> ! {
    eprintln!("{}", corruption);
    std::process::abort();
}

thread_local! {
    static REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct ReentryGuard;

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        REENTRY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[inline]
fn enter_reentry_guard() -> Option<ReentryGuard> {
    REENTRY_DEPTH.with(|depth| {
        if depth.get() > 0 {
            None
        } else {
            depth.set(depth.get() + 1);
            Some(ReentryGuard)
        }
    })
}

/// `malloc` semantics: null on exhaustion, non-null for zero sizes.
#[no_mangle]
pub extern "C" fn spanheap_malloc(size: usize) -> *mut c_void {
    match enter_reentry_guard() {
        Some(_guard) => match global_heap().allocate(size) {
            Ok(p) => p.as_ptr().cast(),
            Err(_) => std::ptr::null_mut(),
        },
        // Re-entered from inside the engine: serve from the system heap.
        None => unsafe { libc::malloc(size) },
    }
}

/// `calloc` semantics: zeroed memory, null on overflow or exhaustion with
/// nothing allocated.
#[no_mangle]
pub extern "C" fn spanheap_calloc(count: usize, size: usize) -> *mut c_void {
    match enter_reentry_guard() {
        Some(_guard) => match global_heap().allocate_zeroed(count, size) {
            Ok(p) => p.as_ptr().cast(),
            Err(_) => std::ptr::null_mut(),
        },
        None => unsafe { libc::calloc(count, size) },
    }
}

/// `realloc` semantics: null pointer allocates, zero size frees and
/// returns null. Corruption detected while validating the pointer is
/// fatal.
#[no_mangle]
pub extern "C" fn spanheap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match enter_reentry_guard() {
        Some(_guard) => {
            let heap = global_heap();
            let ptr = ptr.cast::<u8>();
            // A foreign pointer (from the system heap via a re-entered
            // call) keeps its original allocator.
            if !ptr.is_null() && heap.usable_size(ptr) == 0 {
                return unsafe { libc::realloc(ptr.cast(), size) };
            }
            match heap.reallocate(ptr, size) {
                Ok(Some(p)) => p.as_ptr().cast(),
                Ok(None) => std::ptr::null_mut(),
                Err(spanheap_core::HeapError::Alloc(_)) => std::ptr::null_mut(),
                Err(spanheap_core::HeapError::Corruption(c)) => fatal(c),
            }
        }
        None => unsafe { libc::realloc(ptr, size) },
    }
}

/// `free` semantics: null is a no-op; invalid and double frees abort with
/// their categorized diagnostic.
#[no_mangle]
pub extern "C" fn spanheap_free(ptr: *mut c_void) {
    match enter_reentry_guard() {
        Some(_guard) => {
            if let Err(c) = global_heap().release(ptr.cast()) {
                fatal(c);
            }
        }
        None => unsafe { libc::free(ptr) },
    }
}

/// `malloc_usable_size` semantics: zero for null or unrecognized pointers.
#[no_mangle]
pub extern "C" fn spanheap_usable_size(ptr: *const c_void) -> usize {
    global_heap().usable_size(ptr.cast())
}

/// Returns retained free reservations to the operating system.
#[no_mangle]
pub extern "C" fn spanheap_release_memory() {
    global_heap().release_unused_memory();
}

/// Rust [`GlobalAlloc`] adapter over the process-wide heap.
///
/// Alignments above the class granularity (16 bytes) are delegated to
/// [`System`]; the dealloc path sorts pointers back to their origin by
/// asking the heap whether it recognizes them.
pub struct SpanHeapAlloc;

unsafe impl GlobalAlloc for SpanHeapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_SIZE {
            return unsafe { System.alloc(layout) };
        }
        match enter_reentry_guard() {
            Some(_guard) => match global_heap().allocate(layout.size()) {
                Ok(p) => p.as_ptr(),
                Err(_) => std::ptr::null_mut(),
            },
            None => unsafe { System.alloc(layout) },
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_SIZE {
            return unsafe { System.alloc_zeroed(layout) };
        }
        match enter_reentry_guard() {
            Some(_guard) => match global_heap().allocate_zeroed(1, layout.size()) {
                Ok(p) => p.as_ptr(),
                Err(_) => std::ptr::null_mut(),
            },
            None => unsafe { System.alloc_zeroed(layout) },
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() > MIN_SIZE {
            return unsafe { System.dealloc(ptr, layout) };
        }
        match enter_reentry_guard() {
            Some(_guard) => {
                let heap = global_heap();
                if heap.usable_size(ptr) > 0 {
                    if let Err(c) = heap.release(ptr) {
                        fatal(c);
                    }
                } else {
                    // Allocated by System during a re-entered call.
                    unsafe { System.dealloc(ptr, layout) };
                }
            }
            None => unsafe { System.dealloc(ptr, layout) },
        }
    }
}

/// Unprefixed C allocator symbols.
#[cfg(feature = "c_api")]
pub mod c_api {
    use super::*;

    #[no_mangle]
    pub extern "C" fn malloc(size: usize) -> *mut c_void {
        spanheap_malloc(size)
    }

    #[no_mangle]
    pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
        spanheap_calloc(count, size)
    }

    #[no_mangle]
    pub extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        spanheap_realloc(ptr, size)
    }

    #[no_mangle]
    pub extern "C" fn free(ptr: *mut c_void) {
        spanheap_free(ptr)
    }

    #[no_mangle]
    pub extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        spanheap_usable_size(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_round_trip() {
        let p = spanheap_malloc(100);
        assert!(!p.is_null());
        assert!(spanheap_usable_size(p) >= 100);
        unsafe { std::ptr::write_bytes(p.cast::<u8>(), 0x7F, 100) };
        spanheap_free(p);
    }

    #[test]
    fn malloc_zero_is_non_null() {
        let p = spanheap_malloc(0);
        assert!(!p.is_null());
        spanheap_free(p);
    }

    #[test]
    fn calloc_zeroes_and_rejects_overflow() {
        let p = spanheap_calloc(100, 10);
        assert!(!p.is_null());
        for i in 0..1000 {
            assert_eq!(unsafe { p.cast::<u8>().add(i).read() }, 0);
        }
        spanheap_free(p);

        assert!(spanheap_calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn realloc_covers_the_c_contract() {
        // Null grows from nothing.
        let p = spanheap_realloc(std::ptr::null_mut(), 64);
        assert!(!p.is_null());
        unsafe { p.cast::<u8>().write(0x11) };
        // Growth preserves content.
        let q = spanheap_realloc(p, 100_000);
        assert!(!q.is_null());
        assert_eq!(unsafe { q.cast::<u8>().read() }, 0x11);
        // Zero size frees.
        assert!(spanheap_realloc(q, 0).is_null());
    }

    #[test]
    fn free_null_is_a_no_op() {
        spanheap_free(std::ptr::null_mut());
    }

    #[test]
    fn global_alloc_adapter_round_trips() {
        let layout = Layout::from_size_align(256, 8).unwrap();
        let p = unsafe { SpanHeapAlloc.alloc(layout) };
        assert!(!p.is_null());
        unsafe { std::ptr::write_bytes(p, 0x42, 256) };
        unsafe { SpanHeapAlloc.dealloc(p, layout) };

        // Over-aligned layouts take the system path and still round-trip.
        let aligned = Layout::from_size_align(64, 64).unwrap();
        let q = unsafe { SpanHeapAlloc.alloc(aligned) };
        assert!(!q.is_null());
        assert_eq!(q as usize % 64, 0);
        unsafe { SpanHeapAlloc.dealloc(q, aligned) };
    }

    #[test]
    fn adapter_alloc_zeroed_is_zero() {
        let layout = Layout::from_size_align(512, 16).unwrap();
        let p = unsafe { SpanHeapAlloc.alloc_zeroed(layout) };
        assert!(!p.is_null());
        for i in 0..512 {
            assert_eq!(unsafe { p.add(i).read() }, 0);
        }
        unsafe { SpanHeapAlloc.dealloc(p, layout) };
    }
}
