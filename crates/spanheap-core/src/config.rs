//! Heap tuning knobs.
//!
//! Every knob has a compiled-in default; `SPANHEAP_*` environment variables
//! override them with loose parsing (unparseable values fall back to the
//! default rather than failing heap construction).

/// Tunable heap parameters, fixed at heap construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Minimum pages per page-source reservation. Small span requests are
    /// batched up to this so region count stays low.
    pub min_reservation_pages: usize,
    /// Free pages the page heap may retain before it starts handing whole
    /// reservations back to the page source.
    pub max_retained_free_pages: usize,
    /// Per-class thread-cache list length ceiling, as a multiple of the
    /// class batch size.
    pub thread_cache_batch_multiplier: usize,
    /// Capacity of the in-heap event ring.
    pub event_log_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_reservation_pages: 128,
            max_retained_free_pages: 512,
            thread_cache_batch_multiplier: 4,
            event_log_capacity: 256,
        }
    }
}

impl HeapConfig {
    /// Builds a config from the environment, starting from defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("SPANHEAP_RESERVE_PAGES") {
            cfg.min_reservation_pages = v.max(1);
        }
        if let Some(v) = env_usize("SPANHEAP_RETAIN_PAGES") {
            cfg.max_retained_free_pages = v;
        }
        if let Some(v) = env_usize("SPANHEAP_CACHE_MULTIPLIER") {
            cfg.thread_cache_batch_multiplier = v.clamp(1, 64);
        }
        if let Some(v) = env_usize("SPANHEAP_EVENT_LOG") {
            cfg.event_log_capacity = v;
        }
        cfg
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = HeapConfig::default();
        assert!(cfg.min_reservation_pages >= 1);
        assert!(cfg.thread_cache_batch_multiplier >= 1);
        assert!(cfg.event_log_capacity > 0);
    }

    #[test]
    fn env_parsing_is_loose() {
        // Unset and garbage both fall through to None.
        assert_eq!(env_usize("SPANHEAP_TEST_UNSET_KNOB"), None);
        std::env::set_var("SPANHEAP_TEST_BAD_KNOB", "not-a-number");
        assert_eq!(env_usize("SPANHEAP_TEST_BAD_KNOB"), None);
        std::env::set_var("SPANHEAP_TEST_GOOD_KNOB", " 128 ");
        assert_eq!(env_usize("SPANHEAP_TEST_GOOD_KNOB"), Some(128));
        std::env::remove_var("SPANHEAP_TEST_BAD_KNOB");
        std::env::remove_var("SPANHEAP_TEST_GOOD_KNOB");
    }
}
