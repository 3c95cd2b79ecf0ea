//! Allocator error taxonomy.
//!
//! Two tiers: [`AllocError`] covers recoverable failures that propagate to
//! the caller (page-source exhaustion, size-arithmetic overflow), while
//! [`Corruption`] covers heap-corruption conditions that are unrecoverable
//! by design. The engine reports corruption as an ordinary `Err` value so
//! tests can assert on the category; the ABI boundary is the only place
//! that converts it into process termination.

use thiserror::Error;

/// Recoverable allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The page source could not satisfy a reservation.
    #[error("out of memory: page source cannot reserve {pages} pages")]
    Exhausted {
        /// Number of pages the failing reservation asked for.
        pages: usize,
    },
    /// `count * size` overflowed; nothing was allocated.
    #[error("allocation size overflow: {count} * {size}")]
    Overflow { count: usize, size: usize },
}

/// Unrecoverable heap-corruption conditions.
///
/// The `Display` strings are a stable diagnostic surface: conformance tests
/// assert on them verbatim, so they must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
    /// The pointer lands inside a known span but is not the span's
    /// allocation address.
    #[error("Pointer is not pointing to the start of a span")]
    NotSpanStart { addr: usize },
    /// The span addressed by the pointer is already free.
    #[error("Object was not in-use")]
    NotInUse { addr: usize },
    /// The slot is already present in a free list.
    #[error("Circular loop in list detected")]
    FreeListCycle { addr: usize },
    /// The pointer does not resolve to any span the allocator can validate.
    #[error("Attempt to free invalid pointer")]
    InvalidPointer { addr: usize },
}

impl Corruption {
    /// The pointer value the corruption was detected on.
    pub fn addr(&self) -> usize {
        match *self {
            Corruption::NotSpanStart { addr }
            | Corruption::NotInUse { addr }
            | Corruption::FreeListCycle { addr }
            | Corruption::InvalidPointer { addr } => addr,
        }
    }
}

/// Umbrella error for operations that can fail either way (`reallocate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Corruption(#[from] Corruption),
}
