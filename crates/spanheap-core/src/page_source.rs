//! Backing-store abstraction.
//!
//! The page heap reserves and releases page runs through the [`PageSource`]
//! trait and never names the operating system directly. [`SystemPageSource`]
//! is the production implementation over anonymous `mmap`;
//! [`QuotaPageSource`] wraps any source with a byte budget so exhaustion
//! paths can be exercised deterministically.

use crate::error::AllocError;

/// A reservation handed out by a page source: a page-aligned region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Base address, aligned to the source's page size.
    pub addr: usize,
    /// Length in pages.
    pub pages: usize,
}

/// Supplies page-aligned memory regions to the page heap.
///
/// Regions are released wholesale at the same granularity they were
/// reserved; the page heap guarantees it never hands back a partial region.
pub trait PageSource: Send + Sync {
    /// Backing page size in bytes. Constant for the source's lifetime.
    fn page_size(&self) -> usize;

    /// Reserves a region of at least `pages` pages.
    fn reserve(&mut self, pages: usize) -> Result<Reservation, AllocError>;

    /// Releases a region previously returned by [`reserve`](Self::reserve).
    fn release(&mut self, region: Reservation);
}

/// Anonymous-mmap page source.
pub struct SystemPageSource {
    page_size: usize,
}

impl SystemPageSource {
    pub fn new() -> Self {
        // sysconf cannot fail for _SC_PAGESIZE on any supported platform,
        // but fall back to 4096 rather than trusting a negative return.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if raw > 0 { raw as usize } else { 4096 };
        Self { page_size }
    }
}

impl Default for SystemPageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for SystemPageSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&mut self, pages: usize) -> Result<Reservation, AllocError> {
        let bytes = pages
            .checked_mul(self.page_size)
            .ok_or(AllocError::Exhausted { pages })?;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AllocError::Exhausted { pages });
        }
        Ok(Reservation { addr: ptr as usize, pages })
    }

    fn release(&mut self, region: Reservation) {
        // munmap failure here would mean the region was already gone; there
        // is no caller to report to, so the error is dropped.
        unsafe {
            libc::munmap(region.addr as *mut libc::c_void, region.pages * self.page_size);
        }
    }
}

/// Decorator that enforces a page budget over an inner source.
pub struct QuotaPageSource<S> {
    inner: S,
    remaining_pages: usize,
}

impl<S: PageSource> QuotaPageSource<S> {
    pub fn new(inner: S, quota_pages: usize) -> Self {
        Self { inner, remaining_pages: quota_pages }
    }

    /// Pages still available under the quota.
    pub fn remaining_pages(&self) -> usize {
        self.remaining_pages
    }
}

impl<S: PageSource> PageSource for QuotaPageSource<S> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn reserve(&mut self, pages: usize) -> Result<Reservation, AllocError> {
        if pages > self.remaining_pages {
            return Err(AllocError::Exhausted { pages });
        }
        let region = self.inner.reserve(pages)?;
        self.remaining_pages -= region.pages;
        Ok(region)
    }

    fn release(&mut self, region: Reservation) {
        self.remaining_pages += region.pages;
        self.inner.release(region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_source_round_trip() {
        let mut src = SystemPageSource::new();
        let page = src.page_size();
        assert!(page.is_power_of_two());
        let region = src.reserve(4).unwrap();
        assert_eq!(region.addr % page, 0);
        assert_eq!(region.pages, 4);
        // Anonymous pages arrive zeroed and writable.
        unsafe {
            let p = region.addr as *mut u8;
            assert_eq!(*p, 0);
            *p = 0xAB;
            assert_eq!(*p, 0xAB);
        }
        src.release(region);
    }

    #[test]
    fn quota_enforced_and_restored() {
        let mut src = QuotaPageSource::new(SystemPageSource::new(), 8);
        let a = src.reserve(5).unwrap();
        assert_eq!(src.remaining_pages(), 3);
        assert_eq!(src.reserve(4).unwrap_err(), AllocError::Exhausted { pages: 4 });
        let b = src.reserve(3).unwrap();
        assert_eq!(src.remaining_pages(), 0);
        src.release(a);
        src.release(b);
        assert_eq!(src.remaining_pages(), 8);
    }
}
