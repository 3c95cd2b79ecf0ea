//! Size class bins for small allocations.
//!
//! Defines size classes from 16 bytes to 32KB. Requests are rounded up to
//! the nearest class boundary; sizes above [`MAX_SMALL_SIZE`] bypass the
//! class machinery and are served as whole-page spans.

/// Minimum allocation size (bytes).
pub const MIN_SIZE: usize = 16;

/// Maximum size for small allocations (bytes). Above this, use the span path.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Number of size class bins.
pub const NUM_SIZE_CLASSES: usize = 32;

/// Size class table following a geometric progression.
///
/// Bins 0-7: 16-byte increments (16..128)
/// Bins 8-15: 32-byte increments (160..384)
/// Bins 16-23: wider steps (448..1536)
/// Bins 24-31: large small classes up to 32KB
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, // 16-byte steps
    160, 192, 224, 256, 288, 320, 352, 384, // 32-byte steps
    448, 512, 640, 768, 896, 1024, 1280, 1536, // wider steps
    2048, 2560, 3072, 4096, 8192, 16384, 24576, 32768, // large small classes
];

/// A span carved for a size class should hold at least this many objects.
const MIN_OBJECTS_PER_SPAN: usize = 4;

/// Target bytes moved per thread-cache/central-list batch transfer.
const BATCH_TARGET_BYTES: usize = 64 * 1024;

/// Describes a single size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Bin index.
    pub id: u8,
    /// Fixed slot size for objects in this class (bytes).
    pub slot_size: usize,
    /// Pages requested from the page heap per span carved for this class.
    pub pages_per_span: usize,
}

impl SizeClass {
    /// Number of slots a freshly carved span yields.
    pub fn slots_per_span(&self, page_size: usize) -> usize {
        (self.pages_per_span * page_size) / self.slot_size
    }

    /// Objects moved per batch between thread cache and central list.
    pub fn batch_size(&self) -> usize {
        (BATCH_TARGET_BYTES / self.slot_size).clamp(2, 128)
    }
}

/// The full table, resolved against a concrete page size at heap startup.
#[derive(Debug)]
pub struct SizeClassTable {
    classes: [SizeClass; NUM_SIZE_CLASSES],
}

impl SizeClassTable {
    /// Builds the table for the given backing page size.
    pub fn new(page_size: usize) -> Self {
        let mut classes = [SizeClass { id: 0, slot_size: 0, pages_per_span: 0 }; NUM_SIZE_CLASSES];
        for (i, &slot_size) in SIZE_TABLE.iter().enumerate() {
            let target = slot_size * MIN_OBJECTS_PER_SPAN;
            let pages_per_span = target.div_ceil(page_size).max(1);
            classes[i] = SizeClass { id: i as u8, slot_size, pages_per_span };
        }
        Self { classes }
    }

    /// Maps a requested size to its class.
    ///
    /// Total and deterministic over `[0, MAX_SMALL_SIZE]`; zero-size requests
    /// map to the minimal class so `malloc(0)` stays distinguishable and
    /// non-null. Returns `None` above [`MAX_SMALL_SIZE`].
    pub fn class_for(&self, size: usize) -> Option<SizeClass> {
        let size = size.max(MIN_SIZE);
        if size > MAX_SMALL_SIZE {
            return None;
        }
        // Linear scan is fine for 32 entries; the hot path caches the result.
        self.classes.iter().find(|c| size <= c.slot_size).copied()
    }

    /// Class descriptor by bin index.
    pub fn class(&self, id: u8) -> SizeClass {
        self.classes[id as usize]
    }

    /// Iterator over all classes in ascending slot-size order.
    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter()
    }
}
