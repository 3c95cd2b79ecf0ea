//! Span records and the generational span table.
//!
//! A span is a contiguous run of pages with a single lifecycle state. Spans
//! are referenced by [`SpanId`], a slot index paired with a generation
//! counter; recycling a slot bumps the generation so stale ids resolve to
//! nothing instead of to an unrelated span.

/// Lifecycle state of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    /// Owned by the page heap, available for allocation or coalescing.
    Free,
    /// Serving one large object directly.
    InUseLarge,
    /// Carved into fixed-size slots for a size class.
    InUseSmall,
}

/// A contiguous run of pages.
#[derive(Debug, Clone)]
pub struct Span {
    /// First page number covered by the span.
    pub start_page: usize,
    /// Length in pages, always >= 1.
    pub pages: usize,
    pub state: SpanState,
    /// Size class id when `state == InUseSmall`.
    pub size_class: Option<u8>,
    /// First page of the reservation this span was carved from. Coalescing
    /// never crosses a reservation boundary, so this is stable for the
    /// span's whole life.
    pub region_start: usize,
}

impl Span {
    /// One-past-the-end page number.
    pub fn end_page(&self) -> usize {
        self.start_page + self.pages
    }

    /// Whether `page` falls inside this span.
    pub fn contains_page(&self, page: usize) -> bool {
        page >= self.start_page && page < self.end_page()
    }
}

/// Handle to a span slot. Stale after the slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId {
    index: u32,
    generation: u32,
}

enum Slot {
    Live { generation: u32, span: Span },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slab of span records with generation-checked handles.
pub struct SpanTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    live: usize,
}

impl SpanTable {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free_head: None, live: 0 }
    }

    /// Inserts a span and returns its handle.
    pub fn insert(&mut self, span: Span) -> SpanId {
        self.live += 1;
        match self.free_head {
            Some(index) => {
                let generation = match self.slots[index as usize] {
                    Slot::Vacant { generation, next_free } => {
                        self.free_head = next_free;
                        generation
                    }
                    Slot::Live { .. } => unreachable!("free list points at live slot"),
                };
                self.slots[index as usize] = Slot::Live { generation, span };
                SpanId { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Live { generation: 0, span });
                SpanId { index, generation: 0 }
            }
        }
    }

    /// Removes a span, returning its record. The slot is recycled with a
    /// bumped generation so `id` is dead from here on.
    pub fn remove(&mut self, id: SpanId) -> Option<Span> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Live { generation, .. } if *generation == id.generation => {
                let next_gen = generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Vacant { generation: next_gen, next_free: self.free_head },
                );
                self.free_head = Some(id.index);
                self.live -= 1;
                match old {
                    Slot::Live { span, .. } => Some(span),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, id: SpanId) -> Option<&Span> {
        match self.slots.get(id.index as usize)? {
            Slot::Live { generation, span } if *generation == id.generation => Some(span),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SpanId) -> Option<&mut Span> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Live { generation, span } if *generation == id.generation => Some(span),
            _ => None,
        }
    }

    /// Number of live spans.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl Default for SpanTable {
    fn default() -> Self {
        Self::new()
    }
}
