//! NVMe Queue Management
//!
//! Submission and completion rings, plus the per-queue pool of request
//! contexts. Each submission queue owns one scratch page per slot, so every
//! in-flight command has a PRP list page of its own; contexts are recycled
//! through an index-linked LIFO free list. One ring slot stays reserved to
//! keep full and empty distinguishable.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use crate::command::{NvmeCommand, NvmeCompletion};
use crate::device::{Mmio, Passthrough};
use crate::dma::DmaBuffer;
use crate::error::Error;
use crate::prp::PrpListPage;
use crate::PAGE_SHIFT;

/// Callback invoked with completions rerouted to an asynchronous-event
/// handler.
pub type CqeHandler = fn(&NvmeCompletion);

/// Per-request opaque slot.
#[derive(Clone, Copy)]
pub(crate) enum Opaque {
    /// Nothing attached.
    None,
    /// Asynchronous-event handler for a perpetual AER request.
    AerHandler(CqeHandler),
}

/// One in-flight command: identifier, dedicated scratch page, free-list
/// linkage. Contexts live exactly as long as their submission queue.
struct Request {
    /// Command identifier, equal to the context's pool index.
    cid: u16,
    /// Scratch page for this command's PRP list.
    page_vaddr: *mut PrpListPage,
    /// IOVA of the scratch page.
    page_iova: u64,
    /// Next context on the free list.
    next_free: Option<u16>,
    /// Attached handler or nothing.
    opaque: Opaque,
}

/// NVMe Completion Queue
///
/// Ring of 16-byte completion entries. The device posts entries with a phase
/// bit that flips on every ring wrap; the consumer advances `head` and
/// mirrors the flip, so a phase mismatch means "nothing new".
pub struct CompletionQueue<D: Passthrough> {
    id: u16,
    qsize: u16,
    ring: DmaBuffer<NvmeCompletion, D>,
    db_offset: usize,
    efd: Option<i32>,
    head: u16,
    phase: bool,
}

impl<D: Passthrough> CompletionQueue<D> {
    /// Allocate the ring and bind the doorbell offset.
    pub(crate) fn new(
        dev: &Arc<D>,
        id: u16,
        qsize: u16,
        db_offset: usize,
    ) -> Result<Self, Error> {
        let ring = DmaBuffer::new(dev, qsize as usize)?;
        Ok(Self {
            id,
            qsize,
            ring,
            db_offset,
            efd: None,
            head: 0,
            phase: true,
        })
    }

    /// Get the queue ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Get the queue depth.
    #[inline]
    #[must_use]
    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    /// IOVA of the ring, for device configuration.
    #[inline]
    #[must_use]
    pub fn iova(&self) -> u64 {
        self.ring.iova()
    }

    /// Current head index.
    #[inline]
    #[must_use]
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Currently expected phase bit.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> bool {
        self.phase
    }

    /// Wake token associated with this queue, if any.
    #[inline]
    #[must_use]
    pub fn event_fd(&self) -> Option<i32> {
        self.efd
    }

    /// Attach a wake token so an event-driven caller can park on the queue.
    #[inline]
    pub fn set_event_fd(&mut self, efd: Option<i32>) {
        self.efd = efd;
    }

    /// Check whether the head entry is valid for the current ring pass.
    #[must_use]
    pub fn has_completion(&self) -> bool {
        fence(Ordering::Acquire);
        self.ring.read_volatile(self.head as usize).phase() == self.phase
    }

    /// Pop the next completion entry, advancing head and toggling phase at
    /// ring wraps. The caller rings the doorbell after consuming entries.
    pub fn pop(&mut self) -> Option<NvmeCompletion> {
        if !self.has_completion() {
            return None;
        }

        let entry = self.ring.read_volatile(self.head as usize);

        self.head = (self.head + 1) % self.qsize;
        if self.head == 0 {
            self.phase = !self.phase;
        }

        Some(entry)
    }

    /// Write the current head to the queue's doorbell.
    #[inline]
    pub fn ring_doorbell(&self, db: &impl Mmio) {
        db.write32(self.db_offset, self.head as u32);
    }
}

/// NVMe Submission Queue
///
/// Ring of 64-byte command entries bound to one completion queue, plus the
/// request pool: `qsize - 1` contexts, each with a dedicated scratch page
/// carved out of one contiguous page-per-slot allocation.
pub struct SubmissionQueue<D: Passthrough> {
    id: u16,
    qsize: u16,
    ring: DmaBuffer<NvmeCommand, D>,
    pages: DmaBuffer<PrpListPage, D>,
    db_offset: usize,
    cq_id: u16,
    tail: u16,
    rqs: Box<[Request]>,
    free_head: Option<u16>,
}

impl<D: Passthrough> SubmissionQueue<D> {
    /// Allocate ring and scratch memory, build the request pool, and bind
    /// the doorbell offset. `_flags` is reserved for queue creation flags.
    pub(crate) fn new(
        dev: &Arc<D>,
        id: u16,
        qsize: u16,
        cq_id: u16,
        db_offset: usize,
        _flags: u32,
    ) -> Result<Self, Error> {
        let pages: DmaBuffer<PrpListPage, D> = DmaBuffer::new(dev, qsize as usize)?;

        // Free list grows downward: head is the last context, tail index 0.
        let mut rqs = Vec::with_capacity((qsize - 1) as usize);
        for i in 0..qsize - 1 {
            rqs.push(Request {
                cid: i,
                // SAFETY: `pages` holds `qsize` list pages, i < qsize
                page_vaddr: unsafe { pages.vaddr().add(i as usize) },
                page_iova: pages.iova() + ((i as u64) << PAGE_SHIFT),
                next_free: if i > 0 { Some(i - 1) } else { None },
                opaque: Opaque::None,
            });
        }

        let ring = DmaBuffer::new(dev, qsize as usize)?;

        Ok(Self {
            id,
            qsize,
            ring,
            pages,
            db_offset,
            cq_id,
            tail: 0,
            rqs: rqs.into_boxed_slice(),
            free_head: Some(qsize - 2),
        })
    }

    /// Get the queue ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Get the queue depth.
    #[inline]
    #[must_use]
    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    /// IOVA of the ring, for device configuration.
    #[inline]
    #[must_use]
    pub fn iova(&self) -> u64 {
        self.ring.iova()
    }

    /// Id of the completion queue bound at configuration time.
    #[inline]
    #[must_use]
    pub fn cq_id(&self) -> u16 {
        self.cq_id
    }

    /// Current tail index.
    #[inline]
    #[must_use]
    pub fn tail(&self) -> u16 {
        self.tail
    }

    /// Pop a request context off the free list.
    ///
    /// Returns the context's command identifier, or `None` when every
    /// context is in flight.
    pub fn acquire(&mut self) -> Option<u16> {
        let idx = self.free_head?;
        let rq = &mut self.rqs[idx as usize];
        self.free_head = rq.next_free.take();
        Some(rq.cid)
    }

    /// Push a request context back onto the free list.
    pub fn release(&mut self, cid: u16) {
        let rq = &mut self.rqs[cid as usize];
        debug_assert!(rq.next_free.is_none());
        rq.next_free = self.free_head;
        self.free_head = Some(cid);
    }

    /// Number of contexts currently on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while let Some(idx) = cursor {
            count += 1;
            cursor = self.rqs[idx as usize].next_free;
        }
        count
    }

    /// Scratch page of the context identified by `cid` (AER tag stripped by
    /// the caller).
    #[inline]
    #[must_use]
    pub fn rq_page(&self, cid: u16) -> (*mut PrpListPage, u64) {
        let rq = &self.rqs[cid as usize];
        debug_assert!(
            rq.page_iova >= self.pages.iova()
                && rq.page_iova < self.pages.iova() + self.pages.byte_len() as u64
        );
        (rq.page_vaddr, rq.page_iova)
    }

    pub(crate) fn set_opaque(&mut self, cid: u16, opaque: Opaque) {
        self.rqs[cid as usize].opaque = opaque;
    }

    pub(crate) fn opaque(&self, cid: u16) -> &Opaque {
        &self.rqs[cid as usize].opaque
    }

    /// Copy `sqe` into the ring slot at `tail`, advance tail modulo `qsize`,
    /// and ring the doorbell. The entry store is release-ordered with
    /// respect to the doorbell write.
    pub fn exec(&mut self, sqe: &NvmeCommand, db: &impl Mmio) {
        self.ring.write_volatile(self.tail as usize, sqe);
        fence(Ordering::Release);
        self.tail = (self.tail + 1) % self.qsize;
        db.write32(self.db_offset, self.tail as u32);
    }
}

// SAFETY: The queue exclusively owns its rings and contexts; scratch-page
// pointers never alias another queue's memory.
unsafe impl<D: Passthrough + Send + Sync> Send for SubmissionQueue<D> {}
