//! NVMe Controller Lifecycle
//!
//! Brings a controller from reset to operational: CAP decoding, admin queue
//! construction, CC/CSTS handshakes, queue-count negotiation, I/O queue-pair
//! creation, and synchronous one-shot command execution with asynchronous
//! event notifications interleaved on the admin queue.
//!
//! The controller is the sole owner of its BAR windows and queue arrays;
//! queues are reached through indexed handles, never through back-pointers.

use std::cmp::min;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use tock_registers::interfaces::{ReadWriteable, Readable};
use tock_registers::registers::InMemoryRegister;

use crate::command::{
    AQA, CAP, CAP_CSS_ADMIN, CAP_CSS_CSI, CC, CC_CSS_ADMIN, CC_CSS_CSI, CC_CSS_NVM, CID_AER, CSTS,
    DOORBELL_BASE, NvmeCommand, NvmeCompletion, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC,
    REG_CSTS,
};
use crate::device::{BarProt, Mmio, Passthrough};
use crate::error::Error;
use crate::prp;
use crate::queue::{CompletionQueue, CqeHandler, Opaque, SubmissionQueue};
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Admin queue depth used for CQ[0]/SQ[0].
pub const NVME_AQ_QSIZE: u16 = 32;

/// Length of each mapped BAR window (registers and doorbells).
const BAR_WINDOW_LEN: usize = 0x1000;

/// Controller options supplied at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlOpts {
    /// Requested count of I/O submission queues (0-based).
    pub nsqr: u16,
    /// Requested count of I/O completion queues (0-based).
    pub ncqr: u16,
}

impl CtrlOpts {
    /// Defaults applied when the caller passes no options.
    pub const DEFAULT: CtrlOpts = CtrlOpts { nsqr: 63, ncqr: 63 };
}

impl Default for CtrlOpts {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Controller lifecycle states.
///
/// `Administrative` is the terminal operational state of admin-only
/// controllers (PCI sub-class 0x03): no queue-count negotiation, no I/O
/// queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlState {
    /// BARs mapped, CAP validated.
    Opened,
    /// CC.EN cleared and CSTS.RDY observed 0.
    Reset,
    /// Admin queue pair built and AQA/ASQ/ACQ programmed.
    AdminConfigured,
    /// CC.EN set and CSTS.RDY observed 1.
    Enabled,
    /// Queue counts negotiated; I/O queue pairs may be created.
    Running,
    /// Admin-only controller, fully operational.
    Administrative,
    /// Every queue and both BAR windows released.
    Closed,
}

/// A userspace NVMe controller.
///
/// Single-threaded cooperative: no internal locking. One instance owns the
/// device transitively; [`Controller::close`] (also run on drop) releases
/// every queue and both BAR windows idempotently.
pub struct Controller<D: Passthrough> {
    dev: Arc<D>,
    regs: Option<D::Bar>,
    doorbells: Option<D::Bar>,
    sq: Vec<Option<SubmissionQueue<D>>>,
    cq: Vec<Option<CompletionQueue<D>>>,
    opts: CtrlOpts,
    state: CtrlState,
    administrative: bool,
    /// Doorbell stride in bytes (4 << CAP.DSTRD).
    dstrd: usize,
    /// Ready-wait deadline in milliseconds (500 * (CAP.TO + 1)).
    timeout_ms: u64,
    /// Negotiated I/O submission queue count (0-based).
    nsqa: u16,
    /// Negotiated I/O completion queue count (0-based).
    ncqa: u16,
}

impl<D: Passthrough> Controller<D> {
    /// Open a controller on an already-opened passthrough handle.
    ///
    /// Verifies the NVMe class code, maps the register and doorbell windows,
    /// and validates CAP against the host page size. The controller is left
    /// in [`CtrlState::Opened`]; call [`Controller::init`] or the individual
    /// bring-up steps to make it operational.
    pub fn open(dev: Arc<D>, opts: Option<CtrlOpts>) -> Result<Self, Error> {
        let opts = opts.unwrap_or(CtrlOpts::DEFAULT);

        let class = dev.class_code()?;
        info!("pci class code is {class:#08x}");
        if class & 0xFFFF00 != 0x010800 {
            debug!("device class {class:#08x} is not NVMe");
            return Err(Error::InvalidArgument);
        }
        let administrative = (class & 0xFF) == 0x03;

        let regs = dev.map_bar(0, BAR_WINDOW_LEN, 0, BarProt::ReadWrite)?;

        let cap: InMemoryRegister<u64, CAP::Register> = InMemoryRegister::new(regs.read64(REG_CAP));
        let mpsmin = cap.read(CAP::MPSMIN);
        if 1usize << (12 + mpsmin) > PAGE_SIZE {
            debug!("controller minimum page size too large");
            dev.unmap_bar(0, regs, BAR_WINDOW_LEN, 0);
            return Err(Error::InvalidArgument);
        }
        let dstrd = 4usize << cap.read(CAP::DSTRD);
        let timeout_ms = 500 * (cap.read(CAP::TO) + 1);

        let doorbells = match dev.map_bar(0, BAR_WINDOW_LEN, DOORBELL_BASE, BarProt::Write) {
            Ok(db) => db,
            Err(e) => {
                dev.unmap_bar(0, regs, BAR_WINDOW_LEN, 0);
                return Err(e);
            }
        };

        // nsqr/ncqr are 0-based and do not count the admin queue, hence +2.
        let mut sq = Vec::new();
        sq.resize_with(opts.nsqr as usize + 2, || None);
        let mut cq = Vec::new();
        cq.resize_with(opts.ncqr as usize + 2, || None);

        Ok(Self {
            dev,
            regs: Some(regs),
            doorbells: Some(doorbells),
            sq,
            cq,
            opts,
            state: CtrlState::Opened,
            administrative,
            dstrd,
            timeout_ms,
            nsqa: 0,
            ncqa: 0,
        })
    }

    /// Open the device at `bdf` through the passthrough facility and hand it
    /// to [`Controller::open`].
    pub fn open_bdf(bdf: &str, opts: Option<CtrlOpts>) -> Result<Self, Error> {
        let dev = D::open(bdf)?;
        Self::open(Arc::new(dev), opts)
    }

    /// Full bring-up: reset, admin queue construction, enable, and queue
    /// count negotiation.
    pub fn init(&mut self) -> Result<(), Error> {
        self.reset()?;
        self.configure_adminq()?;
        self.enable()?;
        self.negotiate_queue_counts()
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> CtrlState {
        self.state
    }

    /// Whether the controller only accepts admin commands.
    #[inline]
    #[must_use]
    pub fn is_administrative(&self) -> bool {
        self.administrative
    }

    /// Negotiated `(nsqa, ncqa)` I/O queue counts (0-based).
    #[inline]
    #[must_use]
    pub fn negotiated(&self) -> (u16, u16) {
        (self.nsqa, self.ncqa)
    }

    /// Submission queue `qid`, if configured.
    #[inline]
    #[must_use]
    pub fn sq(&self, qid: u16) -> Option<&SubmissionQueue<D>> {
        self.sq.get(qid as usize).and_then(Option::as_ref)
    }

    /// Mutable access to submission queue `qid`, if configured.
    #[inline]
    #[must_use]
    pub fn sq_mut(&mut self, qid: u16) -> Option<&mut SubmissionQueue<D>> {
        self.sq.get_mut(qid as usize).and_then(Option::as_mut)
    }

    /// Completion queue `qid`, if configured.
    #[inline]
    #[must_use]
    pub fn cq(&self, qid: u16) -> Option<&CompletionQueue<D>> {
        self.cq.get(qid as usize).and_then(Option::as_ref)
    }

    /// Mutable access to completion queue `qid`, if configured.
    #[inline]
    #[must_use]
    pub fn cq_mut(&mut self, qid: u16) -> Option<&mut CompletionQueue<D>> {
        self.cq.get_mut(qid as usize).and_then(Option::as_mut)
    }

    /// Clear CC.EN and wait until the controller reports not ready.
    ///
    /// In-flight commands are aborted by the device; discard and reconfigure
    /// every queue before enabling again.
    pub fn reset(&mut self) -> Result<(), Error> {
        if self.state == CtrlState::Closed {
            return Err(Error::InvalidArgument);
        }
        {
            let regs = self.regs.as_ref().ok_or(Error::InvalidArgument)?;
            let cc = regs.read32(REG_CC);
            regs.write32(REG_CC, cc & !0x1);
        }
        self.wait_rdy(0)?;
        self.state = CtrlState::Reset;
        Ok(())
    }

    /// Build the admin queue pair and program AQA/ASQ/ACQ.
    pub fn configure_adminq(&mut self) -> Result<(), Error> {
        if self.state != CtrlState::Reset {
            return Err(Error::InvalidArgument);
        }

        self.configure_cq(0, NVME_AQ_QSIZE)?;
        if let Err(e) = self.configure_sq(0, NVME_AQ_QSIZE, 0, 0) {
            self.discard_cq(0);
            return Err(e);
        }

        let (sq_iova, cq_iova) = match (&self.sq[0], &self.cq[0]) {
            (Some(sq), Some(cq)) => (sq.iova(), cq.iova()),
            _ => return Err(Error::InvalidArgument),
        };

        let regs = self.regs.as_ref().ok_or(Error::InvalidArgument)?;
        let aqa: InMemoryRegister<u32, AQA::Register> = InMemoryRegister::new(0);
        aqa.modify(
            AQA::ASQS.val(u32::from(NVME_AQ_QSIZE - 1))
                + AQA::ACQS.val(u32::from(NVME_AQ_QSIZE - 1)),
        );
        regs.write32(REG_AQA, aqa.get());
        regs.write_hl64(REG_ASQ, sq_iova);
        regs.write_hl64(REG_ACQ, cq_iova);

        self.state = CtrlState::AdminConfigured;
        Ok(())
    }

    /// Set CC.EN with the negotiated configuration and wait for ready.
    ///
    /// Command set selection follows CAP.CSS in priority order: CSI, then
    /// admin-only, then NVM. Queue entry sizes are fixed at 64-byte SQEs and
    /// 16-byte CQEs.
    pub fn enable(&mut self) -> Result<(), Error> {
        if self.state != CtrlState::AdminConfigured {
            return Err(Error::InvalidArgument);
        }
        {
            let regs = self.regs.as_ref().ok_or(Error::InvalidArgument)?;
            let cap: InMemoryRegister<u64, CAP::Register> =
                InMemoryRegister::new(regs.read64(REG_CAP));
            let css = cap.read(CAP::CSS);

            let cc: InMemoryRegister<u32, CC::Register> = InMemoryRegister::new(0);
            cc.modify(
                CC::MPS.val((PAGE_SHIFT - 12) as u32)
                    + CC::AMS.val(0)
                    + CC::SHN.val(0)
                    + CC::IOSQES.val(6)
                    + CC::IOCQES.val(4)
                    + CC::EN.val(1),
            );
            if css & CAP_CSS_CSI != 0 {
                cc.modify(CC::CSS.val(CC_CSS_CSI));
            } else if css & CAP_CSS_ADMIN != 0 {
                cc.modify(CC::CSS.val(CC_CSS_ADMIN));
            } else {
                cc.modify(CC::CSS.val(CC_CSS_NVM));
            }
            regs.write32(REG_CC, cc.get());
        }
        self.wait_rdy(1)?;
        self.state = CtrlState::Enabled;
        Ok(())
    }

    /// Issue Set Features (Number of Queues) and clamp the negotiated counts
    /// to the requested ones.
    ///
    /// Administrative controllers skip the command entirely and transition
    /// straight to their terminal state.
    pub fn negotiate_queue_counts(&mut self) -> Result<(), Error> {
        if self.state != CtrlState::Enabled {
            return Err(Error::InvalidArgument);
        }
        if self.administrative {
            self.state = CtrlState::Administrative;
            return Ok(());
        }

        let mut sqe = NvmeCommand::set_features_num_queues(self.opts.nsqr, self.opts.ncqr);
        let cqe = self.exec_sync(0, &mut sqe, None)?;
        if !cqe.is_success() {
            debug!(
                "set features (number of queues) failed with status {:#x}",
                cqe.status.get() >> 1
            );
            return Err(Error::DeviceFailure);
        }

        let dw0 = cqe.result.get();
        self.nsqa = min(self.opts.nsqr, (dw0 & 0xFFFF) as u16);
        self.ncqa = min(self.opts.ncqr, (dw0 >> 16) as u16);
        self.state = CtrlState::Running;
        Ok(())
    }

    /// Configure completion queue `qid` locally and create it on the device.
    ///
    /// Rolls the local configuration back if the admin command fails or
    /// completes with non-zero status.
    pub fn create_iocq_oneshot(&mut self, qid: u16, qsize: u16) -> Result<(), Error> {
        if self.state != CtrlState::Running {
            return Err(Error::InvalidArgument);
        }
        self.configure_cq(qid, qsize)?;
        let iova = match self.cq.get(qid as usize).and_then(Option::as_ref) {
            Some(cq) => cq.iova(),
            None => return Err(Error::InvalidArgument),
        };

        let mut sqe = NvmeCommand::create_io_cq(qid, qsize, iova);
        match self.exec_sync(0, &mut sqe, None) {
            Ok(cqe) if cqe.is_success() => Ok(()),
            Ok(cqe) => {
                debug!(
                    "create i/o cq {qid} failed with status {:#x}",
                    cqe.status.get() >> 1
                );
                self.discard_cq(qid);
                Err(Error::DeviceFailure)
            }
            Err(e) => {
                self.discard_cq(qid);
                Err(e)
            }
        }
    }

    /// Configure submission queue `qid` locally, bound to `cq_id`, and
    /// create it on the device.
    ///
    /// Rolls the local configuration back if the admin command fails or
    /// completes with non-zero status.
    pub fn create_iosq_oneshot(
        &mut self,
        qid: u16,
        qsize: u16,
        cq_id: u16,
        flags: u32,
    ) -> Result<(), Error> {
        if self.state != CtrlState::Running {
            return Err(Error::InvalidArgument);
        }
        self.configure_sq(qid, qsize, cq_id, flags)?;
        let iova = match self.sq.get(qid as usize).and_then(Option::as_ref) {
            Some(sq) => sq.iova(),
            None => return Err(Error::InvalidArgument),
        };

        let mut sqe = NvmeCommand::create_io_sq(qid, qsize, cq_id, iova);
        match self.exec_sync(0, &mut sqe, None) {
            Ok(cqe) if cqe.is_success() => Ok(()),
            Ok(cqe) => {
                debug!(
                    "create i/o sq {qid} failed with status {:#x}",
                    cqe.status.get() >> 1
                );
                self.discard_sq(qid);
                Err(Error::DeviceFailure)
            }
            Err(e) => {
                self.discard_sq(qid);
                Err(e)
            }
        }
    }

    /// Create the I/O queue pair `qid`: completion queue first, then the
    /// submission queue bound to it. A submission-queue failure rolls back
    /// the completion queue as well.
    pub fn create_ioqpair(&mut self, qid: u16, qsize: u16, flags: u32) -> Result<(), Error> {
        self.create_iocq_oneshot(qid, qsize)?;
        if let Err(e) = self.create_iosq_oneshot(qid, qsize, qid, flags) {
            self.discard_cq(qid);
            return Err(e);
        }
        Ok(())
    }

    /// Discard submission queue `qid`. No-op when the queue was never
    /// configured or has already been discarded.
    pub fn discard_sq(&mut self, qid: u16) {
        if let Some(slot) = self.sq.get_mut(qid as usize) {
            slot.take();
        }
    }

    /// Discard completion queue `qid`. No-op when the queue was never
    /// configured or has already been discarded.
    pub fn discard_cq(&mut self, qid: u16) {
        if let Some(slot) = self.cq.get_mut(qid as usize) {
            slot.take();
        }
    }

    /// Execute one command synchronously on submission queue `qid`.
    ///
    /// Acquires a request context (propagating [`Error::Busy`] when the pool
    /// is dry), ephemerally maps `buf` and encodes its PRPs into `sqe`, then
    /// polls the bound completion queue. Admin-queue AER completions are
    /// rerouted to the registered handler; completions with an unexpected
    /// identifier are logged and skipped. The matching completion is
    /// returned with its status untouched -- interpreting it is the caller's
    /// business.
    pub fn exec_sync(
        &mut self,
        qid: u16,
        sqe: &mut NvmeCommand,
        buf: Option<&mut [u8]>,
    ) -> Result<NvmeCompletion, Error> {
        match self.state {
            CtrlState::Enabled | CtrlState::Running | CtrlState::Administrative => {}
            _ => return Err(Error::InvalidArgument),
        }
        let db = self.doorbells.as_ref().ok_or(Error::InvalidArgument)?;
        let sq = self
            .sq
            .get_mut(qid as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument)?;
        let cq = self
            .cq
            .get_mut(sq.cq_id() as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument)?;

        let cid = sq.acquire().ok_or(Error::Busy)?;

        let mut mapped = false;
        if let Some(buf) = buf {
            if !buf.is_empty() {
                let iova = match self.dev.map_ephemeral(buf.as_mut_ptr(), buf.len()) {
                    Ok(iova) => iova,
                    Err(e) => {
                        sq.release(cid);
                        return Err(e);
                    }
                };
                mapped = true;
                let (list_vaddr, list_iova) = sq.rq_page(cid);
                if let Err(e) = prp::map_prp(sqe, iova, buf.len(), list_vaddr, list_iova) {
                    let _ = self.dev.free_ephemeral(1);
                    sq.release(cid);
                    return Err(e);
                }
            }
        }

        sqe.set_cid(cid);
        sq.exec(sqe, db);

        let cqe = loop {
            let Some(cqe) = cq.pop() else {
                std::hint::spin_loop();
                continue;
            };
            cq.ring_doorbell(db);

            let rcid = cqe.cid.get();
            if qid == 0 && rcid & CID_AER != 0 {
                aen_dispatch(sq, db, &cqe);
                continue;
            }
            if rcid != cid {
                error!("spurious cqe (cq {} cid {rcid})", cq.id());
                continue;
            }
            break cqe;
        };

        sq.release(cid);
        if mapped {
            self.dev.free_ephemeral(1)?;
        }
        Ok(cqe)
    }

    /// Arm asynchronous event notifications on the admin queue.
    ///
    /// Dedicates one admin request context to a perpetual Asynchronous Event
    /// Request; completions are delivered to `handler` (or logged when none
    /// is given) and the request is re-posted immediately. The context stays
    /// out of the pool until controller reset.
    pub fn aen_enable(&mut self, handler: Option<CqeHandler>) -> Result<(), Error> {
        match self.state {
            CtrlState::Enabled | CtrlState::Running | CtrlState::Administrative => {}
            _ => return Err(Error::InvalidArgument),
        }
        let db = self.doorbells.as_ref().ok_or(Error::InvalidArgument)?;
        let sq = self
            .sq
            .get_mut(0)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument)?;

        let cid = sq.acquire().ok_or(Error::Busy)?;
        sq.set_opaque(
            cid,
            match handler {
                Some(h) => Opaque::AerHandler(h),
                None => Opaque::None,
            },
        );

        let mut sqe = NvmeCommand::async_event();
        sqe.set_cid(cid | CID_AER);
        sq.exec(&sqe, db);
        Ok(())
    }

    /// Dispatch an AER completion picked up outside [`Controller::exec_sync`]
    /// and re-arm the request.
    pub fn aen_handle(&mut self, cqe: &NvmeCompletion) -> Result<(), Error> {
        let db = self.doorbells.as_ref().ok_or(Error::InvalidArgument)?;
        let sq = self
            .sq
            .get_mut(0)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument)?;
        aen_dispatch(sq, db, cqe);
        Ok(())
    }

    /// Release every queue, both BAR windows, and the device handle.
    /// Idempotent; also run on drop.
    pub fn close(&mut self) {
        for slot in &mut self.sq {
            slot.take();
        }
        for slot in &mut self.cq {
            slot.take();
        }
        if let Some(regs) = self.regs.take() {
            self.dev.unmap_bar(0, regs, BAR_WINDOW_LEN, 0);
        }
        if let Some(db) = self.doorbells.take() {
            self.dev.unmap_bar(0, db, BAR_WINDOW_LEN, DOORBELL_BASE);
        }
        if self.state != CtrlState::Closed {
            self.dev.close();
            self.state = CtrlState::Closed;
        }
    }

    /// Poll CSTS until RDY equals `ready`, bounded by the CAP.TO deadline.
    fn wait_rdy(&self, ready: u32) -> Result<(), Error> {
        let regs = self.regs.as_ref().ok_or(Error::InvalidArgument)?;
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);

        loop {
            let csts: InMemoryRegister<u32, CSTS::Register> =
                InMemoryRegister::new(regs.read32(REG_CSTS));
            if csts.read(CSTS::RDY) == ready {
                return Ok(());
            }
            if csts.is_set(CSTS::CFS) {
                debug!("controller fatal status while waiting for CSTS.RDY == {ready}");
                return Err(Error::DeviceFailure);
            }
            if Instant::now() >= deadline {
                debug!("timed out waiting for CSTS.RDY == {ready}");
                return Err(Error::Timeout);
            }
            std::hint::spin_loop();
        }
    }

    /// Configure completion queue `qid` locally: ring allocation plus
    /// doorbell binding.
    fn configure_cq(&mut self, qid: u16, qsize: u16) -> Result<(), Error> {
        if qid > self.ncqa || self.cq.get(qid as usize).is_none() {
            debug!("cq id {qid} invalid; max id is {}", self.ncqa);
            return Err(Error::InvalidArgument);
        }
        if qsize < 2 {
            debug!("qsize must be at least 2");
            return Err(Error::InvalidArgument);
        }

        let db_offset = (2 * qid as usize + 1) * self.dstrd;
        let cq = CompletionQueue::new(&self.dev, qid, qsize, db_offset)?;
        self.cq[qid as usize] = Some(cq);
        Ok(())
    }

    /// Configure submission queue `qid` locally: ring and scratch
    /// allocation, request pool, doorbell binding, CQ binding.
    fn configure_sq(&mut self, qid: u16, qsize: u16, cq_id: u16, flags: u32) -> Result<(), Error> {
        if qid > self.nsqa || self.sq.get(qid as usize).is_none() {
            debug!("sq id {qid} invalid; max id is {}", self.nsqa);
            return Err(Error::InvalidArgument);
        }
        if qsize < 2 {
            debug!("qsize must be at least 2");
            return Err(Error::InvalidArgument);
        }
        if self.cq.get(cq_id as usize).and_then(Option::as_ref).is_none() {
            debug!("sq {qid} bound to unconfigured cq {cq_id}");
            return Err(Error::InvalidArgument);
        }

        let db_offset = 2 * qid as usize * self.dstrd;
        let sq = SubmissionQueue::new(&self.dev, qid, qsize, cq_id, db_offset, flags)?;
        self.sq[qid as usize] = Some(sq);
        Ok(())
    }
}

impl<D: Passthrough> Drop for Controller<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Route an AER completion to the request's handler and re-post the request
/// with the same context, AER tag set.
fn aen_dispatch<D: Passthrough>(
    sq: &mut SubmissionQueue<D>,
    db: &impl Mmio,
    cqe: &NvmeCompletion,
) {
    debug_assert!(cqe.cid.get() & CID_AER != 0);
    let cid = cqe.cid.get() & !CID_AER;

    match *sq.opaque(cid) {
        Opaque::AerHandler(handler) => {
            let mut copy = *cqe;
            copy.cid.set(cid);
            handler(&copy);
        }
        Opaque::None => {
            info!(
                "unhandled aen {:#010x} (type {:#x} info {:#x} lid {:#x})",
                cqe.result.get(),
                cqe.aen_type(),
                cqe.aen_info(),
                cqe.aen_lid()
            );
        }
    }

    let mut sqe = NvmeCommand::async_event();
    sqe.set_cid(cid | CID_AER);
    sq.exec(&sqe, db);
}
