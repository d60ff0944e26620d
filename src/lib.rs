//! Userspace NVMe Controller Core
//!
//! Drives a PCIe NVMe controller from userspace through a kernel-provided
//! passthrough facility: the kernel maps BARs and establishes IOMMU-backed
//! DMA, this crate does everything else. The core covers the controller
//! lifecycle (reset, admin-queue construction, enable, queue-count
//! negotiation), I/O queue-pair creation, and individual command round-trips
//! including asynchronous-event notifications.
//!
//! # Modules
//!
//! - [`device`]: collaborator traits for MMIO, BAR mapping, IOMMU mapping,
//!   and page allocation
//! - [`command`]: register layout and little-endian SQE/CQE wire formats
//! - [`dma`]: page-backed, IOMMU-mapped buffers with reverse-order teardown
//! - [`queue`]: submission/completion rings and the request-context pool
//! - [`prp`]: PRP data-pointer construction for transfer buffers
//! - [`controller`]: the controller state machine and command execution
//!
//! # Concurrency
//!
//! A controller instance is single-threaded cooperative: the request pool,
//! queue indices, and doorbell writes share no internal lock. Use external
//! serialisation to share one controller; independent controllers may run in
//! parallel.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod command;
pub mod controller;
pub mod device;
pub mod dma;
pub mod error;
pub mod prp;
pub mod queue;

pub use command::{CID_AER, NvmeCommand, NvmeCompletion};
pub use controller::{Controller, CtrlOpts, CtrlState, NVME_AQ_QSIZE};
pub use device::{BarProt, IommuMapper, Mmio, PageAllocator, Passthrough, PciDevice};
pub use dma::DmaBuffer;
pub use error::Error;
pub use prp::PrpListPage;
pub use queue::{CompletionQueue, CqeHandler, SubmissionQueue};

/// Host memory page size.
pub const PAGE_SIZE: usize = 4096;

/// Host memory page shift.
pub const PAGE_SHIFT: usize = 12;
