//! Physical Region Page (PRP) Builder
//!
//! NVMe describes data buffers through PRP entries: 64-bit little-endian
//! IOVAs, one per memory page.
//!
//! - 1 page: PRP1 only
//! - 2 pages: PRP1 + PRP2 (direct addresses)
//! - more: PRP1 + a PRP list page pointed to by PRP2
//!
//! Every request context carries one dedicated scratch page, so a command
//! can describe up to `PRPS_PER_PAGE` pages beyond the first without any
//! allocation on the I/O path.

use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::command::NvmeCommand;
use crate::error::Error;
use crate::PAGE_SIZE;

/// Number of PRP entries per list page (4096 / 8 = 512)
pub const PRPS_PER_PAGE: usize = PAGE_SIZE / 8;

/// A page of little-endian PRP entries for multi-page transfers.
#[repr(C, align(4096))]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PrpListPage {
    /// PRP entries (512 per page)
    pub entries: [U64; PRPS_PER_PAGE],
}

impl Default for PrpListPage {
    fn default() -> Self {
        Self::new()
    }
}

impl PrpListPage {
    /// Create a new zeroed PRP list page.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [U64::ZERO; PRPS_PER_PAGE],
        }
    }
}

/// Encode the data pointers for a transfer already mapped at `iova`.
///
/// PRP1 may carry an offset within its page; every subsequent entry is
/// page-aligned. Transfers needing more than one list page are rejected:
/// the page-per-slot layout provides exactly one list page per command.
///
/// # Safety contract
///
/// `list_vaddr` must point to the request's scratch page; it is only
/// dereferenced when the transfer spans more than two pages.
pub fn map_prp(
    sqe: &mut NvmeCommand,
    iova: u64,
    len: usize,
    list_vaddr: *mut PrpListPage,
    list_iova: u64,
) -> Result<(), Error> {
    let page = PAGE_SIZE as u64;
    let offset = iova & (page - 1);
    let first_page_len = page - offset;

    // Single page: PRP2 stays clear.
    if len as u64 <= first_page_len {
        sqe.set_prp(iova, 0);
        return Ok(());
    }

    let remaining = len as u64 - first_page_len;
    let next_page = (iova & !(page - 1)) + page;

    // Two pages: PRP2 addresses the second page directly.
    if remaining <= page {
        sqe.set_prp(iova, next_page);
        return Ok(());
    }

    let pages_needed = remaining.div_ceil(page) as usize;
    if pages_needed > PRPS_PER_PAGE {
        log::debug!("transfer of {len} bytes exceeds one prp list page");
        return Err(Error::InvalidArgument);
    }

    // SAFETY: list_vaddr is the request's scratch page, valid for writes.
    let list = unsafe { &mut *list_vaddr };
    for (i, entry) in list.entries.iter_mut().take(pages_needed).enumerate() {
        entry.set(next_page + (i as u64) * page);
    }

    sqe.set_prp(iova, list_iova);
    Ok(())
}

// Size assertion: the list page must tile scratch memory exactly.
const _: () = {
    assert!(core::mem::size_of::<PrpListPage>() == 4096);
};
