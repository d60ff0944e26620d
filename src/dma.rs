//! DMA Buffer Management
//!
//! A [`DmaBuffer`] owns one page-aligned memory region together with its
//! IOMMU mapping: construction allocates pages and maps them so the device
//! sees the region at a stable IOVA, drop tears both down in reverse order
//! (IOMMU-unmap before page-free). Queue rings and per-command scratch pages
//! are all carried by this type.

use std::ptr::{read_volatile, write_bytes, write_volatile};
use std::sync::Arc;

use crate::device::Passthrough;
use crate::error::Error;

/// A typed, page-backed, IOMMU-mapped buffer of `count` elements.
pub struct DmaBuffer<T, D: Passthrough> {
    dev: Arc<D>,
    ptr: *mut T,
    iova: u64,
    len: usize,
    count: usize,
}

impl<T, D: Passthrough> DmaBuffer<T, D> {
    /// Allocate and map a buffer of `count` elements of `T`.
    ///
    /// The underlying region is page-aligned, zeroed, and a multiple of the
    /// page size. If the IOMMU mapping fails the pages are released before
    /// the error is returned.
    pub fn new(dev: &Arc<D>, count: usize) -> Result<Self, Error> {
        let unit = size_of::<T>();
        let (vaddr, len) = dev.alloc(count, unit)?;

        let iova = match dev.map(vaddr, len) {
            Ok(iova) => iova,
            Err(e) => {
                log::debug!("failed to map dma buffer at {vaddr:p}");
                dev.free(vaddr, len);
                return Err(e);
            }
        };

        // Zero so ring consumers start from a known phase state.
        // SAFETY: The allocator returned at least `len` valid bytes.
        unsafe { write_bytes(vaddr, 0, len) };

        Ok(Self {
            dev: Arc::clone(dev),
            ptr: vaddr.cast(),
            iova,
            len,
            count,
        })
    }

    /// Virtual base address of the region.
    #[inline]
    #[must_use]
    pub fn vaddr(&self) -> *mut T {
        self.ptr
    }

    /// IOVA the device sees the region at.
    #[inline]
    #[must_use]
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Byte length of the region (a multiple of the page size).
    #[inline]
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// Number of elements the buffer was sized for.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Volatile read of the element at `index`.
    #[inline]
    #[must_use]
    pub fn read_volatile(&self, index: usize) -> T {
        debug_assert!(index < self.count, "dma read index out of bounds");
        // SAFETY: ptr is valid for `count` elements, index is within bounds
        unsafe { read_volatile(self.ptr.add(index)) }
    }

    /// Volatile write of the element at `index`.
    #[inline]
    pub fn write_volatile(&self, index: usize, value: &T)
    where
        T: Copy,
    {
        debug_assert!(index < self.count, "dma write index out of bounds");
        // SAFETY: ptr is valid for `count` elements, index is within bounds
        unsafe { write_volatile(self.ptr.add(index), *value) }
    }
}

impl<T, D: Passthrough> Drop for DmaBuffer<T, D> {
    fn drop(&mut self) {
        let vaddr = self.ptr.cast::<u8>();
        if self.dev.unmap(vaddr).is_err() {
            log::debug!("failed to unmap dma buffer at {vaddr:p}");
        }
        self.dev.free(vaddr, self.len);
    }
}

// SAFETY: The buffer exclusively owns its region; the raw pointer does not
// alias once the device handle is shareable across threads.
unsafe impl<T: Send, D: Passthrough + Send + Sync> Send for DmaBuffer<T, D> {}
