//! Error types for the controller core

use thiserror::Error;

/// Errors surfaced by the controller core.
///
/// Command-level failures are not errors at this layer: a one-shot that
/// produces a completion returns it to the caller, status field included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Queue id exceeds the negotiated count, qsize below the minimum,
    /// non-NVMe device class, controller page size incompatible with the
    /// host, or an operation issued in the wrong controller state.
    #[error("invalid argument")]
    InvalidArgument,
    /// The request pool of the target submission queue is exhausted.
    #[error("request pool exhausted")]
    Busy,
    /// The ready-wait deadline derived from CAP.TO expired.
    #[error("timed out waiting on controller status")]
    Timeout,
    /// An IOMMU mapping or page allocation failed.
    #[error("failed to establish DMA mapping")]
    IoMappingFailed,
    /// The controller reported fatal status, or an admin command issued on
    /// behalf of the core completed with non-zero status.
    #[error("device reported failure")]
    DeviceFailure,
    /// A BAR window could not be mapped.
    #[error("failed to map BAR window")]
    MmioUnavailable,
}
