//! NVMe Command and Register Definitions
//!
//! Type-safe definitions for NVMe commands, completions, and controller
//! registers. Register bitfields use tock-registers; on-the-wire structures
//! are packed little-endian via zerocopy so no host endianness leaks into
//! what the device sees.

use tock_registers::register_bitfields;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// -- NVMe Controller Register Offsets

/// Controller Capabilities (CAP)
pub const REG_CAP: usize = 0x00;
/// Version (VS)
pub const REG_VS: usize = 0x08;
/// Controller Configuration (CC)
pub const REG_CC: usize = 0x14;
/// Controller Status (CSTS)
pub const REG_CSTS: usize = 0x1C;
/// Admin Queue Attributes (AQA)
pub const REG_AQA: usize = 0x24;
/// Admin Submission Queue Base Address (ASQ)
pub const REG_ASQ: usize = 0x28;
/// Admin Completion Queue Base Address (ACQ)
pub const REG_ACQ: usize = 0x30;

/// Doorbells start at offset 0x1000 in BAR0; the pair for queue `i` sits at
/// `0x1000 + 2 * i * stride` (SQ tail) and `0x1000 + (2 * i + 1) * stride`
/// (CQ head), where stride is `4 << CAP.DSTRD`.
pub const DOORBELL_BASE: usize = 0x1000;

// -- Register Bitfields

register_bitfields![u64,
    /// Controller Capabilities (64-bit)
    pub CAP [
        /// Maximum Queue Entries Supported (0-based, actual = MQES + 1)
        MQES OFFSET(0) NUMBITS(16) [],
        /// Contiguous Queues Required
        CQR OFFSET(16) NUMBITS(1) [],
        /// Arbitration Mechanism Supported
        AMS OFFSET(17) NUMBITS(2) [],
        /// Timeout (in 500ms units)
        TO OFFSET(24) NUMBITS(8) [],
        /// Doorbell Stride (4 << DSTRD bytes)
        DSTRD OFFSET(32) NUMBITS(4) [],
        /// NVM Subsystem Reset Supported
        NSSRS OFFSET(36) NUMBITS(1) [],
        /// Command Sets Supported
        CSS OFFSET(37) NUMBITS(8) [],
        /// Memory Page Size Minimum (2^(12+MPSMIN))
        MPSMIN OFFSET(48) NUMBITS(4) [],
        /// Memory Page Size Maximum (2^(12+MPSMAX))
        MPSMAX OFFSET(52) NUMBITS(4) [],
    ]
];

register_bitfields![u32,
    /// Controller Configuration (32-bit)
    pub CC [
        /// Enable
        EN OFFSET(0) NUMBITS(1) [],
        /// I/O Command Set Selected
        CSS OFFSET(4) NUMBITS(3) [],
        /// Memory Page Size (2^(12+MPS))
        MPS OFFSET(7) NUMBITS(4) [],
        /// Arbitration Mechanism Selected
        AMS OFFSET(11) NUMBITS(3) [],
        /// Shutdown Notification
        SHN OFFSET(14) NUMBITS(2) [],
        /// I/O Submission Queue Entry Size (2^IOSQES)
        IOSQES OFFSET(16) NUMBITS(4) [],
        /// I/O Completion Queue Entry Size (2^IOCQES)
        IOCQES OFFSET(20) NUMBITS(4) [],
    ],

    /// Controller Status (32-bit)
    pub CSTS [
        /// Ready
        RDY OFFSET(0) NUMBITS(1) [],
        /// Controller Fatal Status
        CFS OFFSET(1) NUMBITS(1) [],
        /// Shutdown Status
        SHST OFFSET(2) NUMBITS(2) [],
    ],

    /// Admin Queue Attributes (32-bit)
    pub AQA [
        /// Admin Submission Queue Size (0-based)
        ASQS OFFSET(0) NUMBITS(12) [],
        /// Admin Completion Queue Size (0-based)
        ACQS OFFSET(16) NUMBITS(12) [],
    ]
];

// -- CAP.CSS capability flags and CC.CSS selector values

/// CAP.CSS: NVM command set supported
pub const CAP_CSS_NVM: u64 = 1 << 0;
/// CAP.CSS: one or more I/O command sets supported (CSI)
pub const CAP_CSS_CSI: u64 = 1 << 6;
/// CAP.CSS: admin-only controller
pub const CAP_CSS_ADMIN: u64 = 1 << 7;

/// CC.CSS selector: NVM command set
pub const CC_CSS_NVM: u32 = 0;
/// CC.CSS selector: all supported I/O command sets
pub const CC_CSS_CSI: u32 = 6;
/// CC.CSS selector: admin command set only
pub const CC_CSS_ADMIN: u32 = 7;

// -- Command identifier tagging

/// Reserved high bit of the command identifier marking Asynchronous Event
/// Requests. The remaining bits are the request-pool index.
pub const CID_AER: u16 = 1 << 15;

// -- NVMe Command Opcodes

/// Admin command opcodes
pub mod admin_opcode {
    /// Create I/O Submission Queue
    pub const CREATE_IO_SQ: u8 = 0x01;
    /// Delete I/O Completion Queue
    pub const DELETE_IO_CQ: u8 = 0x04;
    /// Create I/O Completion Queue
    pub const CREATE_IO_CQ: u8 = 0x05;
    /// Identify
    pub const IDENTIFY: u8 = 0x06;
    /// Abort
    pub const ABORT: u8 = 0x08;
    /// Set Features
    pub const SET_FEATURES: u8 = 0x09;
    /// Get Features
    pub const GET_FEATURES: u8 = 0x0A;
    /// Asynchronous Event Request
    pub const ASYNC_EVENT: u8 = 0x0C;
}

/// NVM command opcodes (I/O commands)
pub mod nvm_opcode {
    /// Flush
    pub const FLUSH: u8 = 0x00;
    /// Write
    pub const WRITE: u8 = 0x01;
    /// Read
    pub const READ: u8 = 0x02;
}

/// Identify CNS values
pub mod identify_cns {
    /// Identify Namespace
    pub const NAMESPACE: u8 = 0x00;
    /// Identify Controller
    pub const CONTROLLER: u8 = 0x01;
}

/// Feature identifiers
pub mod feature_id {
    /// Number of Queues
    pub const NUM_QUEUES: u32 = 0x07;
}

/// Queue flags carried in Create I/O CQ/SQ commands (CDW11)
pub mod queue_flags {
    /// Physically contiguous queue memory
    pub const PHYS_CONTIG: u32 = 1 << 0;
}

// -- NVMe Submission Queue Entry (64 bytes)

/// NVMe Submission Queue Entry (Command)
///
/// All fields are little-endian on the wire. The command identifier in
/// CDW0[31:16] is stamped from the request pool at execution time, so values
/// set by builders are placeholders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvmeCommand {
    /// Command Dword 0 (Opcode, Fused, PSDT, CID)
    pub cdw0: U32,
    /// Namespace Identifier
    pub nsid: U32,
    /// Command Dword 2 (Reserved)
    pub cdw2: U32,
    /// Command Dword 3 (Reserved)
    pub cdw3: U32,
    /// Metadata Pointer
    pub mptr: U64,
    /// Data Pointer 1 (PRP1)
    pub prp1: U64,
    /// Data Pointer 2 (PRP2)
    pub prp2: U64,
    /// Command Dword 10
    pub cdw10: U32,
    /// Command Dword 11
    pub cdw11: U32,
    /// Command Dword 12
    pub cdw12: U32,
    /// Command Dword 13
    pub cdw13: U32,
    /// Command Dword 14
    pub cdw14: U32,
    /// Command Dword 15
    pub cdw15: U32,
}

impl NvmeCommand {
    /// Create a new command with the given opcode.
    #[inline]
    #[must_use]
    pub fn new(opcode: u8) -> Self {
        Self {
            cdw0: U32::new(opcode as u32),
            ..Self::default()
        }
    }

    /// Get the opcode from CDW0.
    #[inline]
    #[must_use]
    pub fn opcode(&self) -> u8 {
        (self.cdw0.get() & 0xFF) as u8
    }

    /// Get the command identifier from CDW0.
    #[inline]
    #[must_use]
    pub fn cid(&self) -> u16 {
        (self.cdw0.get() >> 16) as u16
    }

    /// Overwrite the command identifier in CDW0.
    #[inline]
    pub fn set_cid(&mut self, cid: u16) {
        let cdw0 = self.cdw0.get();
        self.cdw0.set((cdw0 & 0xFFFF) | ((cid as u32) << 16));
    }

    /// Set PRP1 and PRP2.
    #[inline]
    pub fn set_prp(&mut self, prp1: u64, prp2: u64) {
        self.prp1.set(prp1);
        self.prp2.set(prp2);
    }

    /// Create an Identify Controller command. The data pointer is filled in
    /// when the transfer buffer is mapped.
    #[must_use]
    pub fn identify_controller() -> Self {
        let mut cmd = Self::new(admin_opcode::IDENTIFY);
        cmd.cdw10.set(identify_cns::CONTROLLER as u32);
        cmd
    }

    /// Create an Identify Namespace command.
    #[must_use]
    pub fn identify_namespace(nsid: u32) -> Self {
        let mut cmd = Self::new(admin_opcode::IDENTIFY);
        cmd.nsid.set(nsid);
        cmd.cdw10.set(identify_cns::NAMESPACE as u32);
        cmd
    }

    /// Create a Create I/O Completion Queue command for a ring already
    /// resident at `prp1`.
    #[must_use]
    pub fn create_io_cq(qid: u16, qsize: u16, prp1: u64) -> Self {
        let mut cmd = Self::new(admin_opcode::CREATE_IO_CQ);
        cmd.prp1.set(prp1);
        // CDW10: QSIZE[31:16] (0-based), QID[15:0]
        cmd.cdw10.set((((qsize - 1) as u32) << 16) | (qid as u32));
        cmd.cdw11.set(queue_flags::PHYS_CONTIG);
        cmd
    }

    /// Create a Create I/O Submission Queue command bound to `cqid`.
    #[must_use]
    pub fn create_io_sq(qid: u16, qsize: u16, cqid: u16, prp1: u64) -> Self {
        let mut cmd = Self::new(admin_opcode::CREATE_IO_SQ);
        cmd.prp1.set(prp1);
        cmd.cdw10.set((((qsize - 1) as u32) << 16) | (qid as u32));
        // CDW11: CQID[31:16], QPRIO[2:1], PC[0]
        cmd.cdw11
            .set(((cqid as u32) << 16) | queue_flags::PHYS_CONTIG);
        cmd
    }

    /// Create a Set Features (Number of Queues) command. `nsqr` and `ncqr`
    /// are the 0-based requested I/O queue counts.
    #[must_use]
    pub fn set_features_num_queues(nsqr: u16, ncqr: u16) -> Self {
        let mut cmd = Self::new(admin_opcode::SET_FEATURES);
        cmd.cdw10.set(feature_id::NUM_QUEUES);
        cmd.cdw11.set((nsqr as u32) | ((ncqr as u32) << 16));
        cmd
    }

    /// Create an Asynchronous Event Request command.
    #[must_use]
    pub fn async_event() -> Self {
        Self::new(admin_opcode::ASYNC_EVENT)
    }

    /// Create a Read command. `nlb` is the 1-based number of logical blocks.
    #[must_use]
    pub fn read(nsid: u32, slba: u64, nlb: u16) -> Self {
        let mut cmd = Self::new(nvm_opcode::READ);
        cmd.nsid.set(nsid);
        cmd.cdw10.set(slba as u32);
        cmd.cdw11.set((slba >> 32) as u32);
        cmd.cdw12.set((nlb - 1) as u32);
        cmd
    }

    /// Create a Write command. `nlb` is the 1-based number of logical blocks.
    #[must_use]
    pub fn write(nsid: u32, slba: u64, nlb: u16) -> Self {
        let mut cmd = Self::new(nvm_opcode::WRITE);
        cmd.nsid.set(nsid);
        cmd.cdw10.set(slba as u32);
        cmd.cdw11.set((slba >> 32) as u32);
        cmd.cdw12.set((nlb - 1) as u32);
        cmd
    }

    /// Create a Flush command.
    #[must_use]
    pub fn flush(nsid: u32) -> Self {
        let mut cmd = Self::new(nvm_opcode::FLUSH);
        cmd.nsid.set(nsid);
        cmd
    }
}

// -- NVMe Completion Queue Entry (16 bytes)

/// NVMe Completion Queue Entry
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvmeCompletion {
    /// Command-specific result (DW0)
    pub result: U32,
    /// Reserved
    pub rsvd: U32,
    /// SQ Head Pointer
    pub sq_head: U16,
    /// SQ Identifier
    pub sq_id: U16,
    /// Command Identifier
    pub cid: U16,
    /// Status Field (phase bit at bit 0)
    pub status: U16,
}

impl NvmeCompletion {
    /// Get the phase bit.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> bool {
        (self.status.get() & 1) != 0
    }

    /// Get the status code (SC field).
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> u8 {
        ((self.status.get() >> 1) & 0xFF) as u8
    }

    /// Get the status code type (SCT field).
    #[inline]
    #[must_use]
    pub fn status_code_type(&self) -> u8 {
        ((self.status.get() >> 9) & 0x7) as u8
    }

    /// Check if the command completed successfully.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code() == 0 && self.status_code_type() == 0
    }

    /// Asynchronous event type from DW0 (bits 2:0).
    #[inline]
    #[must_use]
    pub fn aen_type(&self) -> u8 {
        (self.result.get() & 0x7) as u8
    }

    /// Asynchronous event information from DW0 (bits 15:8).
    #[inline]
    #[must_use]
    pub fn aen_info(&self) -> u8 {
        ((self.result.get() >> 8) & 0xFF) as u8
    }

    /// Log page identifier associated with the event, from DW0 (bits 23:16).
    #[inline]
    #[must_use]
    pub fn aen_lid(&self) -> u8 {
        ((self.result.get() >> 16) & 0xFF) as u8
    }
}

// -- Size assertions

const _: () = {
    assert!(core::mem::size_of::<NvmeCommand>() == 64);
    assert!(core::mem::size_of::<NvmeCompletion>() == 16);
};
