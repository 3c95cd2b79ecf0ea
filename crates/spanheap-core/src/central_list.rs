//! Shared per-class slot pools.
//!
//! One `CentralFreeList` per size class, each behind its own
//! `parking_lot::Mutex`. Thread caches move slots in and out in batches;
//! the list grows by carving class-sized spans from the page heap and
//! retires a span back to the page heap once every one of its slots has
//! come home. Per-span credit accounting doubles as corruption detection:
//! a span cannot receive more returns than it has slots.
//!
//! Lock order: a central mutex may be held while taking the page-heap
//! lock, never the reverse.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::{AllocError, Corruption};
use crate::page_heap::PageHeap;
use crate::size_class::SizeClass;
use crate::span::{SpanId, SpanState};

struct SpanAccount {
    id: SpanId,
    /// One-past-the-end address of the span.
    limit: usize,
    /// Total slots the span was carved into.
    capacity: usize,
    /// Slots currently sitting in this central list.
    in_central: usize,
}

struct CentralState {
    free_slots: Vec<usize>,
    /// Span base address -> accounting record.
    spans: BTreeMap<usize, SpanAccount>,
}

pub struct CentralFreeList {
    class: SizeClass,
    page_size: usize,
    state: Mutex<CentralState>,
}

impl CentralFreeList {
    pub fn new(class: SizeClass, page_size: usize) -> Self {
        Self {
            class,
            page_size,
            state: Mutex::new(CentralState { free_slots: Vec::new(), spans: BTreeMap::new() }),
        }
    }

    /// Moves up to `n` slots into `out`, carving new spans from the page
    /// heap as needed. Returns `Exhausted` only when not a single slot
    /// could be produced; a partial batch is an `Ok`.
    pub fn fetch_batch(
        &self,
        n: usize,
        page_heap: &PageHeap,
        out: &mut Vec<usize>,
    ) -> Result<(), AllocError> {
        let mut st = self.state.lock();
        let fetched_at_entry = out.len();
        while out.len() - fetched_at_entry < n {
            match st.free_slots.pop() {
                Some(slot) => {
                    let account = Self::account_for(&mut st, slot).unwrap_or_else(|| {
                        unreachable!("central slot always has an owning span")
                    });
                    account.in_central -= 1;
                    out.push(slot);
                }
                None => {
                    if let Err(e) = Self::grow(&mut st, self.class, self.page_size, page_heap) {
                        if out.len() == fetched_at_entry {
                            return Err(e);
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Credits `slots` back to their owning spans and retires any span
    /// whose slots have all returned. A slot that does not belong to any
    /// span of this class, or a span credited past its capacity, is
    /// corruption; nothing is mutated for the offending slot.
    pub fn return_batch(&self, slots: &[usize], page_heap: &PageHeap) -> Result<(), Corruption> {
        let mut st = self.state.lock();
        for &slot in slots {
            let account = Self::account_for(&mut st, slot)
                .ok_or(Corruption::InvalidPointer { addr: slot })?;
            if account.in_central == account.capacity {
                return Err(Corruption::FreeListCycle { addr: slot });
            }
            account.in_central += 1;
            st.free_slots.push(slot);
        }

        let full: Vec<(usize, usize, SpanId)> = st
            .spans
            .iter()
            .filter(|(_, a)| a.in_central == a.capacity)
            .map(|(&base, a)| (base, a.limit, a.id))
            .collect();
        for (base, limit, id) in full {
            st.free_slots.retain(|&s| s < base || s >= limit);
            st.spans.remove(&base);
            page_heap.release_span(id);
        }
        Ok(())
    }

    /// Slots currently parked in this list.
    pub fn free_slot_count(&self) -> usize {
        self.state.lock().free_slots.len()
    }

    /// Spans this list currently owns.
    pub fn span_count(&self) -> usize {
        self.state.lock().spans.len()
    }

    fn account_for(st: &mut CentralState, slot: usize) -> Option<&mut SpanAccount> {
        let (_, account) = st.spans.range_mut(..=slot).next_back()?;
        if slot < account.limit {
            Some(account)
        } else {
            None
        }
    }

    // Carves one class-sized span and floods its slots into the list.
    fn grow(
        st: &mut CentralState,
        class: SizeClass,
        page_size: usize,
        page_heap: &PageHeap,
    ) -> Result<(), AllocError> {
        let grant = page_heap.allocate_run(class.pages_per_span, SpanState::InUseSmall, Some(class.id))?;
        let capacity = class.slots_per_span(page_size);
        let limit = grant.addr + class.pages_per_span * page_size;
        st.spans.insert(
            grant.addr,
            SpanAccount { id: grant.id, limit, capacity, in_central: capacity },
        );
        for i in 0..capacity {
            st.free_slots.push(grant.addr + i * class.slot_size);
        }
        Ok(())
    }
}
