//! Conformance suite for the allocator engine.
//!
//! Exercises the public `Heap` contract: alignment and data integrity
//! across the size spectrum, calloc boundary behavior, the realloc
//! no-move guarantees, page-map integrity under eviction pressure, and
//! the corruption categories with their stable diagnostic messages.

use spanheap_core::{AllocError, Corruption, Heap, HeapConfig, MAX_SMALL_SIZE};

fn heap() -> Heap {
    Heap::new(HeapConfig::default())
}

// Deterministic byte pattern helpers.
unsafe fn fill(ptr: *mut u8, n: usize) {
    for i in 0..n {
        unsafe { ptr.add(i).write((i & 0xff) as u8) };
    }
}

unsafe fn valid(ptr: *const u8, n: usize) -> bool {
    (0..n).all(|i| unsafe { ptr.add(i).read() } == (i & 0xff) as u8)
}

/// The "interesting size" walk: every size up to 100, then the sizes
/// just below, at, and just above each power of two up to ~128 KiB.
fn next_size(size: usize) -> Option<usize> {
    if size < 100 {
        return Some(size + 1);
    }
    if size < 100_000 {
        let mut power = 1;
        while power < size {
            power <<= 1;
        }
        if size < power - 1 {
            return Some(power - 1);
        }
        if size == power - 1 {
            return Some(power);
        }
        return Some(power + 1);
    }
    None
}

fn interesting_sizes() -> Vec<usize> {
    let mut sizes = vec![0];
    let mut s = 0;
    while let Some(n) = next_size(s) {
        sizes.push(n);
        s = n;
    }
    sizes
}

#[test]
fn malloc_alignment_and_pattern_round_trip() {
    let h = heap();
    let mut size = 1;
    while size < 1 << 20 {
        let p = h.allocate(size).unwrap();
        assert_eq!(p.as_ptr() as usize & 1, 0, "size {} not 2-byte aligned", size);
        assert!(h.usable_size(p.as_ptr()) >= size);
        unsafe {
            fill(p.as_ptr(), size);
            assert!(valid(p.as_ptr(), size), "pattern damaged at size {}", size);
        }
        h.release(p.as_ptr()).unwrap();
        size *= 2;
    }
}

#[test]
fn calloc_boundary_grid() {
    let h = heap();
    let cases: &[(usize, usize)] = &[
        (0, 0),
        (0, 1),
        (1, 1),
        (1 << 10, 0),
        (1 << 20, 0),
        (0, 1 << 10),
        (0, 1 << 20),
        (1 << 20, 2),
        (2, 1 << 20),
        (1000, 1000),
    ];
    for &(n, s) in cases {
        let p = h.allocate_zeroed(n, s).unwrap();
        for i in 0..n * s {
            assert_eq!(
                unsafe { p.as_ptr().add(i).read() },
                0,
                "calloc({}, {}) byte {} not zero",
                n,
                s,
                i
            );
        }
        h.release(p.as_ptr()).unwrap();
    }
}

#[test]
fn calloc_overflow_fails_cleanly() {
    let h = heap();
    for &(n, s) in &[(usize::MAX, 2), (usize::MAX / 2 + 2, 2), (3, usize::MAX / 2)] {
        assert_eq!(
            h.allocate_zeroed(n, s),
            Err(AllocError::Overflow { count: n, size: s })
        );
    }
}

// Reallocating by a small delta in either direction must hand back the
// identical pointer. The larger the start size, the larger the delta
// that must not move.
#[test]
fn realloc_small_delta_does_not_move() {
    let h = heap();
    let start_sizes: [usize; 4] = [100, 1000, 10_000, 100_000];
    let deltas: [isize; 8] = [1, -2, 4, -8, 16, -32, 64, -128];

    for (s, &start) in start_sizes.iter().enumerate() {
        let p = h.allocate(start).unwrap();
        for &d in deltas.iter().take(s * 2) {
            let size = (start as isize + d) as usize;
            let q = h.reallocate(p.as_ptr(), size).unwrap().unwrap();
            assert_eq!(p, q, "realloc({} -> {}) moved", start, size);
        }
        for &d in deltas.iter().take(s * 2) {
            let size = (start as isize - d) as usize;
            let q = h.reallocate(p.as_ptr(), size).unwrap().unwrap();
            assert_eq!(p, q, "realloc({} -> {}) moved", start, size);
        }
        h.release(p.as_ptr()).unwrap();
    }
}

#[test]
fn realloc_preserves_prefix_across_interesting_sizes() {
    let h = heap();
    let sizes = interesting_sizes();
    for &src_size in &sizes {
        for &dst_size in &sizes {
            let src = h.allocate(src_size).unwrap();
            unsafe { fill(src.as_ptr(), src_size) };
            match h.reallocate(src.as_ptr(), dst_size).unwrap() {
                Some(dst) => {
                    unsafe {
                        assert!(
                            valid(dst.as_ptr(), src_size.min(dst_size)),
                            "prefix lost in realloc {} -> {}",
                            src_size,
                            dst_size
                        );
                        fill(dst.as_ptr(), dst_size);
                        assert!(valid(dst.as_ptr(), dst_size));
                    }
                    h.release(dst.as_ptr()).unwrap();
                }
                None => assert_eq!(dst_size, 0),
            }
        }
    }
}

// Overflows the page-map cache (2^12 entries) by a factor of four and
// checks no entry is lost or cross-wired: every marker written deep into
// an object must survive a realloc that moves it.
#[test]
fn page_map_survives_eviction_pressure() {
    const NUM_ENTRIES: usize = 1 << 14;
    const MARKER_OFFSET: usize = 1000; // in i32 units, byte 4000

    let h = heap();
    let mut ptrs = Vec::with_capacity(NUM_ENTRIES);
    for i in 0..NUM_ENTRIES {
        let p = h.allocate(8192).unwrap().as_ptr() as *mut i32;
        unsafe { p.add(MARKER_OFFSET).write(i as i32) };
        ptrs.push(p);
    }
    for p in ptrs.iter_mut() {
        *p = h
            .reallocate(*p as *mut u8, 9000)
            .unwrap()
            .unwrap()
            .as_ptr() as *mut i32;
    }
    let mut sum: i64 = 0;
    for &p in &ptrs {
        sum += unsafe { p.add(MARKER_OFFSET).read() } as i64;
        h.release(p as *mut u8).unwrap();
    }
    let n = NUM_ENTRIES as i64;
    assert_eq!(sum, n / 2 * (n - 1));
    assert!(h.stats().page_map_evictions > 0, "pressure never evicted anything");
}

#[test]
fn free_offset_into_large_object_first_page_is_fatal() {
    let h = heap();
    let page = h.page_size();
    let p = h.allocate(10 * page + 1).unwrap();
    let mut offset = 1;
    while offset < page {
        let bad = unsafe { p.as_ptr().add(offset) };
        assert_eq!(
            h.release(bad),
            Err(Corruption::NotSpanStart { addr: bad as usize }),
            "offset {}",
            offset
        );
        assert_eq!(
            h.release(bad).unwrap_err().to_string(),
            "Pointer is not pointing to the start of a span"
        );
        offset <<= 1;
    }
    h.release(p.as_ptr()).unwrap();
}

#[test]
fn free_page_aligned_pointer_inside_large_object_is_fatal() {
    let h = heap();
    let page = h.page_size();
    let max = 10 * page;
    let p = h.allocate(max + 1).unwrap();
    // Interior pages are not indexed: generic invalid-pointer error.
    let mut offset = page;
    while offset < max {
        let bad = unsafe { p.as_ptr().add(offset) };
        assert!(h.release(bad).is_err(), "offset {}", offset);
        offset += page;
    }
    // The last page is indexed, so it classifies precisely.
    let last = unsafe { p.as_ptr().add(max) };
    assert_eq!(
        h.release(last),
        Err(Corruption::NotSpanStart { addr: last as usize })
    );
    h.release(p.as_ptr()).unwrap();
}

#[test]
fn double_free_large_object_is_fatal() {
    let h = heap();
    let p = h.allocate(10 * h.page_size() + 1).unwrap();
    h.release(p.as_ptr()).unwrap();
    let err = h.release(p.as_ptr()).unwrap_err();
    assert_eq!(err, Corruption::NotInUse { addr: p.as_ptr() as usize });
    assert_eq!(err.to_string(), "Object was not in-use");
}

#[test]
fn double_free_small_object_is_fatal_across_classes() {
    let h = heap();
    let mut size = 1;
    while size <= h.page_size() {
        let p = h.allocate(size).unwrap();
        h.release(p.as_ptr()).unwrap();
        let err = h.release(p.as_ptr()).unwrap_err();
        assert_eq!(
            err,
            Corruption::FreeListCycle { addr: p.as_ptr() as usize },
            "size {}",
            size
        );
        assert_eq!(err.to_string(), "Circular loop in list detected");
        size <<= 1;
    }
}

#[test]
fn free_of_foreign_memory_is_fatal() {
    let h = heap();
    let foreign = Box::new([0u8; 64]);
    let addr = foreign.as_ptr() as usize;
    assert_eq!(
        h.release(addr as *mut u8),
        Err(Corruption::InvalidPointer { addr })
    );
    assert_eq!(
        h.release(addr as *mut u8).unwrap_err().to_string(),
        "Attempt to free invalid pointer"
    );
}

#[test]
fn usable_size_covers_request_and_is_stable() {
    let h = heap();
    for &size in &[1, 16, 100, 1024, MAX_SMALL_SIZE, MAX_SMALL_SIZE + 1, 100_000] {
        let p = h.allocate(size).unwrap();
        let usable = h.usable_size(p.as_ptr());
        assert!(usable >= size, "usable {} < requested {}", usable, size);
        // Writing the full usable size must be safe.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0x5A, usable) };
        h.release(p.as_ptr()).unwrap();
    }
    assert_eq!(h.usable_size(std::ptr::null()), 0);
}
