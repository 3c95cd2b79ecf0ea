//! spanheap-core: a span/size-class memory allocator engine.
//!
//! The engine provides `malloc`/`calloc`/`realloc`/`free` semantics with
//! per-thread caching. Requests up to 32 KiB are binned into size classes
//! and served from lock-free per-thread free lists, refilled in batches
//! from per-class central lists; larger requests become whole-page spans
//! from a shared page heap that splits, coalesces, and returns entire
//! reservations to the operating system.
//!
//! Corruption (invalid frees, double frees) is detected before any state
//! is mutated and reported as [`error::Corruption`] values with stable
//! diagnostic messages; converting those into process termination is the
//! ABI layer's job, not the engine's.

pub mod central_list;
pub mod config;
pub mod error;
pub mod heap;
pub mod page_heap;
pub mod page_map;
pub mod page_source;
pub mod size_class;
pub mod span;
pub mod stats;
pub mod thread_cache;

pub use config::HeapConfig;
pub use error::{AllocError, Corruption, HeapError};
pub use heap::Heap;
pub use page_source::{PageSource, QuotaPageSource, Reservation, SystemPageSource};
pub use size_class::{MAX_SMALL_SIZE, MIN_SIZE, NUM_SIZE_CLASSES};
pub use stats::{HeapEvent, HeapStats};
