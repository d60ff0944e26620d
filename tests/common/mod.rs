//! Mock passthrough device obeying the NVMe register contract.
//!
//! Implements the collaborator traits against plain host memory: BAR windows
//! are register files backed by a shared state block, the IOMMU is a bump
//! allocator with reverse translation, and doorbell writes synchronously
//! consume SQEs and post phase-correct CQEs, the way a (very fast) device
//! would. Knobs control Set Features replies, Create I/O SQ/CQ status,
//! identify payloads, deferred AER delivery, and a never-ready mode.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use nvme_pt::command::{REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS};
use nvme_pt::{BarProt, Error, IommuMapper, Mmio, PAGE_SIZE, PageAllocator, PciDevice};

/// CAP value with MQES=63, NVM command set, and the given TO/DSTRD/MPSMIN.
pub fn cap_value(to: u64, dstrd: u64, mpsmin: u64) -> u64 {
    63 | (to << 24) | (dstrd << 32) | (1 << 37) | (mpsmin << 48)
}

#[derive(Clone, Copy)]
struct Mapping {
    vaddr: usize,
    iova: u64,
    len: usize,
    ephemeral: bool,
}

#[derive(Clone, Copy)]
struct MockCq {
    iova: u64,
    qsize: u16,
    tail: u16,
    phase: u16,
}

#[derive(Clone, Copy)]
struct MockSq {
    iova: u64,
    qsize: u16,
    seen_tail: u16,
    cqid: u16,
}

/// Fields of a submission entry the mock device cares about.
struct RawSqe {
    cdw0: u32,
    prp1: u64,
    cdw10: u32,
    cdw11: u32,
}

struct MockState {
    class: u32,
    cap: u64,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    never_ready: bool,
    closed: bool,
    bar_maps: usize,

    allocs: Vec<(usize, usize)>,
    maps: Vec<Mapping>,
    next_iova: u64,

    aq_seen_tail: u16,
    aq_cq_tail: u16,
    aq_cq_phase: u16,
    aer_pending: VecDeque<u16>,
    aer_event: Option<u32>,
    spurious_cid: Option<u16>,
    num_queues_reply: u32,
    create_cq_status: u16,
    create_sq_status: u16,
    identify_payload: Vec<u8>,

    iocqs: HashMap<u16, MockCq>,
    iosqs: HashMap<u16, MockSq>,
}

impl MockState {
    fn new(cap: u64) -> Self {
        Self {
            class: 0x010802,
            cap,
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            never_ready: false,
            closed: false,
            bar_maps: 0,
            allocs: Vec::new(),
            maps: Vec::new(),
            next_iova: 0x1000_0000,
            aq_seen_tail: 0,
            aq_cq_tail: 0,
            aq_cq_phase: 1,
            aer_pending: VecDeque::new(),
            aer_event: None,
            spurious_cid: None,
            num_queues_reply: 0,
            create_cq_status: 0,
            create_sq_status: 0,
            identify_payload: vec![0; 4096],
            iocqs: HashMap::new(),
            iosqs: HashMap::new(),
        }
    }

    fn translate(&self, iova: u64) -> Option<*mut u8> {
        self.translate_len(iova).map(|(p, _)| p)
    }

    /// Translate an IOVA and report how many mapped bytes follow it.
    fn translate_len(&self, iova: u64) -> Option<(*mut u8, usize)> {
        self.maps
            .iter()
            .find(|m| iova >= m.iova && iova < m.iova + m.len as u64)
            .map(|m| {
                let off = (iova - m.iova) as usize;
                ((m.vaddr + off) as *mut u8, m.len - off)
            })
    }

    fn read_sqe(&self, base_iova: u64, idx: u16) -> RawSqe {
        let p = self
            .translate(base_iova + idx as u64 * 64)
            .expect("sq ring not device-visible");
        let mut b = [0u8; 64];
        // SAFETY: the ring slot is 64 valid bytes of mapped queue memory
        unsafe { std::ptr::copy_nonoverlapping(p, b.as_mut_ptr(), 64) };
        RawSqe {
            cdw0: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            prp1: u64::from_le_bytes(b[24..32].try_into().unwrap()),
            cdw10: u32::from_le_bytes(b[40..44].try_into().unwrap()),
            cdw11: u32::from_le_bytes(b[44..48].try_into().unwrap()),
        }
    }

    fn write_cqe(&self, base_iova: u64, slot: u16, dw0: u32, sq_head: u16, cid: u16, status: u16) {
        let p = self
            .translate(base_iova + slot as u64 * 16)
            .expect("cq ring not device-visible");
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&dw0.to_le_bytes());
        b[8..10].copy_from_slice(&sq_head.to_le_bytes());
        b[12..14].copy_from_slice(&cid.to_le_bytes());
        b[14..16].copy_from_slice(&status.to_le_bytes());
        // SAFETY: the ring slot is 16 valid bytes of mapped queue memory
        unsafe { std::ptr::copy_nonoverlapping(b.as_ptr(), p, 16) };
    }

    fn aq_qsize(&self) -> u16 {
        (self.aqa & 0xFFF) as u16 + 1
    }

    /// Post onto the admin completion queue with the device-side phase.
    fn post_admin_cqe(&mut self, dw0: u32, cid: u16, status15: u16) {
        let qsize = self.aq_qsize();
        let status = (status15 << 1) | self.aq_cq_phase;
        self.write_cqe(self.acq, self.aq_cq_tail, dw0, self.aq_seen_tail, cid, status);
        self.aq_cq_tail = (self.aq_cq_tail + 1) % qsize;
        if self.aq_cq_tail == 0 {
            self.aq_cq_phase ^= 1;
        }
    }

    fn process_admin(&mut self, new_tail: u16) {
        let qsize = self.aq_qsize();
        while self.aq_seen_tail != new_tail {
            let idx = self.aq_seen_tail;
            let sqe = self.read_sqe(self.asq, idx);
            self.aq_seen_tail = (idx + 1) % qsize;
            self.handle_admin(&sqe);
        }
    }

    fn handle_admin(&mut self, sqe: &RawSqe) {
        let opcode = (sqe.cdw0 & 0xFF) as u8;
        let cid = (sqe.cdw0 >> 16) as u16;

        // Async event requests park until an event is delivered.
        if opcode == 0x0C {
            self.aer_pending.push_back(cid);
            return;
        }

        // A queued event lands ahead of the synchronous completion.
        if let Some(dw0) = self.aer_event.take() {
            if let Some(aer_cid) = self.aer_pending.pop_front() {
                self.post_admin_cqe(dw0, aer_cid, 0);
            }
        }
        if let Some(bogus) = self.spurious_cid.take() {
            self.post_admin_cqe(0, bogus, 0);
        }

        match opcode {
            // Identify: fill the caller's buffer through PRP1.
            0x06 => {
                let (dst, avail) = self
                    .translate_len(sqe.prp1)
                    .expect("identify buffer not device-visible");
                let payload = self.identify_payload.clone();
                let len = payload.len().min(avail);
                // SAFETY: the destination was mapped for at least `len` bytes
                unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, len) };
                self.post_admin_cqe(0, cid, 0);
            }
            // Set Features: answer Number of Queues with the configured dw0.
            0x09 => {
                let reply = if sqe.cdw10 & 0xFF == 0x07 {
                    self.num_queues_reply
                } else {
                    0
                };
                self.post_admin_cqe(reply, cid, 0);
            }
            // Create I/O CQ
            0x05 => {
                let qid = (sqe.cdw10 & 0xFFFF) as u16;
                let qsize = ((sqe.cdw10 >> 16) & 0xFFFF) as u16 + 1;
                let status = self.create_cq_status;
                if status == 0 {
                    self.iocqs.insert(
                        qid,
                        MockCq {
                            iova: sqe.prp1,
                            qsize,
                            tail: 0,
                            phase: 1,
                        },
                    );
                }
                self.post_admin_cqe(0, cid, status);
            }
            // Create I/O SQ
            0x01 => {
                let qid = (sqe.cdw10 & 0xFFFF) as u16;
                let qsize = ((sqe.cdw10 >> 16) & 0xFFFF) as u16 + 1;
                let cqid = (sqe.cdw11 >> 16) as u16;
                let status = self.create_sq_status;
                if status == 0 {
                    self.iosqs.insert(
                        qid,
                        MockSq {
                            iova: sqe.prp1,
                            qsize,
                            seen_tail: 0,
                            cqid,
                        },
                    );
                }
                self.post_admin_cqe(0, cid, status);
            }
            _ => self.post_admin_cqe(0, cid, 0),
        }
    }

    fn process_io(&mut self, qid: u16, new_tail: u16) {
        let Some(sq) = self.iosqs.get(&qid).copied() else {
            return;
        };
        let mut seen = sq.seen_tail;
        while seen != new_tail {
            let sqe = self.read_sqe(sq.iova, seen);
            seen = (seen + 1) % sq.qsize;
            let cid = (sqe.cdw0 >> 16) as u16;
            self.post_io_cqe(sq.cqid, cid, seen);
        }
        if let Some(entry) = self.iosqs.get_mut(&qid) {
            entry.seen_tail = seen;
        }
    }

    fn post_io_cqe(&mut self, cqid: u16, cid: u16, sq_head: u16) {
        let Some(mut cq) = self.iocqs.get(&cqid).copied() else {
            return;
        };
        self.write_cqe(cq.iova, cq.tail, 0, sq_head, cid, cq.phase);
        cq.tail = (cq.tail + 1) % cq.qsize;
        if cq.tail == 0 {
            cq.phase ^= 1;
        }
        self.iocqs.insert(cqid, cq);
    }

    /// Doorbell window write: consume new SQEs or note the CQ head update.
    fn doorbell_write(&mut self, offset: usize, value: u32) {
        let stride = 4usize << ((self.cap >> 32) & 0xF);
        let idx = offset / stride;
        let qid = (idx / 2) as u16;
        if idx % 2 == 1 {
            // CQ head updates need no reaction from the mock.
            return;
        }
        if qid == 0 {
            self.process_admin(value as u16);
        } else {
            self.process_io(qid, value as u16);
        }
    }

    /// Register window write.
    fn reg_write(&mut self, offset: usize, value: u32) {
        match offset {
            REG_CC => {
                self.cc = value;
                if value & 0x1 != 0 {
                    if !self.never_ready {
                        self.csts |= 0x1;
                    }
                } else {
                    self.csts &= !0x1;
                    // Controller reset forgets queue state and parked AERs.
                    self.aq_seen_tail = 0;
                    self.aq_cq_tail = 0;
                    self.aq_cq_phase = 1;
                    self.aer_pending.clear();
                    self.iocqs.clear();
                    self.iosqs.clear();
                }
            }
            REG_AQA => self.aqa = value,
            REG_ASQ => self.asq = (self.asq & !0xFFFF_FFFF) | value as u64,
            o if o == REG_ASQ + 4 => {
                self.asq = (self.asq & 0xFFFF_FFFF) | ((value as u64) << 32)
            }
            REG_ACQ => self.acq = (self.acq & !0xFFFF_FFFF) | value as u64,
            o if o == REG_ACQ + 4 => {
                self.acq = (self.acq & 0xFFFF_FFFF) | ((value as u64) << 32)
            }
            _ => {}
        }
    }

    fn reg_read32(&self, offset: usize) -> u32 {
        match offset {
            REG_CAP => self.cap as u32,
            o if o == REG_CAP + 4 => (self.cap >> 32) as u32,
            REG_CC => self.cc,
            REG_CSTS => self.csts,
            REG_AQA => self.aqa,
            _ => 0,
        }
    }
}

/// Which window a mock BAR mapping exposes.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Window {
    Regs,
    Doorbells,
}

pub struct MockBar {
    state: Arc<Mutex<MockState>>,
    window: Window,
}

impl Mmio for MockBar {
    fn read32(&self, offset: usize) -> u32 {
        let st = self.state.lock().unwrap();
        match self.window {
            Window::Regs => st.reg_read32(offset),
            Window::Doorbells => 0,
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        let st = self.state.lock().unwrap();
        match self.window {
            Window::Regs => match offset {
                REG_CAP => st.cap,
                REG_ASQ => st.asq,
                REG_ACQ => st.acq,
                _ => 0,
            },
            Window::Doorbells => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut st = self.state.lock().unwrap();
        match self.window {
            Window::Regs => st.reg_write(offset, value),
            Window::Doorbells => st.doorbell_write(offset, value),
        }
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Mock with CAP = (TO=4, DSTRD=0, MPSMIN=0, CSS=NVM) and class 0x010802.
    pub fn new() -> Arc<Self> {
        Self::with_cap(cap_value(4, 0, 0))
    }

    pub fn with_cap(cap: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState::new(cap))),
        })
    }

    pub fn set_class(&self, class: u32) {
        self.state.lock().unwrap().class = class;
    }

    pub fn set_never_ready(&self, never: bool) {
        self.state.lock().unwrap().never_ready = never;
    }

    pub fn set_num_queues_reply(&self, dw0: u32) {
        self.state.lock().unwrap().num_queues_reply = dw0;
    }

    pub fn set_create_cq_status(&self, status: u16) {
        self.state.lock().unwrap().create_cq_status = status;
    }

    pub fn set_create_sq_status(&self, status: u16) {
        self.state.lock().unwrap().create_sq_status = status;
    }

    pub fn set_identify_payload(&self, payload: Vec<u8>) {
        self.state.lock().unwrap().identify_payload = payload;
    }

    /// Deliver `dw0` through a parked AER before the next sync completion.
    pub fn queue_aer_event(&self, dw0: u32) {
        self.state.lock().unwrap().aer_event = Some(dw0);
    }

    /// Post a completion with a bogus identifier before the next sync
    /// completion.
    pub fn inject_spurious_cqe(&self, cid: u16) {
        self.state.lock().unwrap().spurious_cid = Some(cid);
    }

    pub fn reg_cc(&self) -> u32 {
        self.state.lock().unwrap().cc
    }

    pub fn reg_csts(&self) -> u32 {
        self.state.lock().unwrap().csts
    }

    pub fn reg_asq(&self) -> u64 {
        self.state.lock().unwrap().asq
    }

    pub fn reg_acq(&self) -> u64 {
        self.state.lock().unwrap().acq
    }

    pub fn reg_aqa(&self) -> u32 {
        self.state.lock().unwrap().aqa
    }

    pub fn active_mappings(&self) -> usize {
        self.state.lock().unwrap().maps.len()
    }

    pub fn active_allocs(&self) -> usize {
        self.state.lock().unwrap().allocs.len()
    }

    pub fn bar_maps(&self) -> usize {
        self.state.lock().unwrap().bar_maps
    }

    pub fn has_iocq(&self, qid: u16) -> bool {
        self.state.lock().unwrap().iocqs.contains_key(&qid)
    }

    pub fn has_iosq(&self, qid: u16) -> bool {
        self.state.lock().unwrap().iosqs.contains_key(&qid)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl PciDevice for MockDevice {
    type Bar = MockBar;

    fn open(_bdf: &str) -> Result<Self, Error> {
        Ok(Self {
            state: Arc::new(Mutex::new(MockState::new(cap_value(4, 0, 0)))),
        })
    }

    fn class_code(&self) -> Result<u32, Error> {
        Ok(self.state.lock().unwrap().class)
    }

    fn map_bar(
        &self,
        _index: u32,
        _len: usize,
        offset: usize,
        _prot: BarProt,
    ) -> Result<MockBar, Error> {
        let window = match offset {
            0 => Window::Regs,
            0x1000 => Window::Doorbells,
            _ => return Err(Error::MmioUnavailable),
        };
        let mut st = self.state.lock().unwrap();
        st.bar_maps += 1;
        Ok(MockBar {
            state: Arc::clone(&self.state),
            window,
        })
    }

    fn unmap_bar(&self, _index: u32, _bar: MockBar, _len: usize, _offset: usize) {
        self.state.lock().unwrap().bar_maps -= 1;
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

impl IommuMapper for MockDevice {
    fn map(&self, vaddr: *mut u8, len: usize) -> Result<u64, Error> {
        let mut st = self.state.lock().unwrap();
        let iova = st.next_iova;
        st.next_iova += len.next_multiple_of(PAGE_SIZE) as u64;
        st.maps.push(Mapping {
            vaddr: vaddr as usize,
            iova,
            len,
            ephemeral: false,
        });
        Ok(iova)
    }

    fn unmap(&self, vaddr: *mut u8) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        match st
            .maps
            .iter()
            .position(|m| m.vaddr == vaddr as usize && !m.ephemeral)
        {
            Some(pos) => {
                st.maps.remove(pos);
                Ok(())
            }
            None => Err(Error::IoMappingFailed),
        }
    }

    fn map_ephemeral(&self, vaddr: *mut u8, len: usize) -> Result<u64, Error> {
        let mut st = self.state.lock().unwrap();
        let iova = st.next_iova;
        st.next_iova += len.next_multiple_of(PAGE_SIZE) as u64;
        st.maps.push(Mapping {
            vaddr: vaddr as usize,
            iova,
            len,
            ephemeral: true,
        });
        Ok(iova)
    }

    fn free_ephemeral(&self, count: usize) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        for _ in 0..count {
            let pos = st
                .maps
                .iter()
                .rposition(|m| m.ephemeral)
                .ok_or(Error::IoMappingFailed)?;
            st.maps.remove(pos);
        }
        Ok(())
    }
}

impl PageAllocator for MockDevice {
    fn alloc(&self, count: usize, unit: usize) -> Result<(*mut u8, usize), Error> {
        let len = (count * unit).next_multiple_of(PAGE_SIZE);
        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| Error::IoMappingFailed)?;
        // SAFETY: len is non-zero and the layout is valid
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::IoMappingFailed);
        }
        self.state.lock().unwrap().allocs.push((ptr as usize, len));
        Ok((ptr, len))
    }

    fn free(&self, vaddr: *mut u8, len: usize) {
        let mut st = self.state.lock().unwrap();
        if let Some(pos) = st.allocs.iter().position(|&(v, _)| v == vaddr as usize) {
            st.allocs.remove(pos);
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE).expect("allocation layout");
        // SAFETY: vaddr/len were produced by alloc with the same layout
        unsafe { dealloc(vaddr, layout) };
    }
}
