//! BodoCache Core
//!
//! The data-movement half of a GPU-resident page cache:
//! - Pinned host staging buffers with engine-tracked lifetimes
//! - Batched async host-to-device copies over per-device stream pools
//! - Event-based completion tracking on a background poller
//! - Chunked io_uring range reads from storage into pinned memory

pub mod backend;
pub mod engine;
pub mod logging;
mod metrics;
pub mod pinned;
pub mod reader;
pub mod ticket;

pub use backend::CopyBackend;
pub use backend::host::{HostBackend, HostStats};
#[cfg(feature = "cuda")]
pub use backend::cuda::CudaBackend;
pub use engine::{
    Callback, CallbackPolicy, Completion, CopyEngine, CopyOperation, CopySource, DEFAULT_POLL_INTERVAL,
    DEFAULT_STREAMS_PER_DEVICE, EngineConfig,
};
pub use pinned::{DevicePtr, HostRegion, PinnedBuffer};
pub use reader::{RangeReader, ReadError, ReaderConfig, read_range};
pub use ticket::{PagePtr, PageTicketing, Ticket, TicketIssuer};

// ============================================================================
// Page Movement Notes
// ============================================================================
//
// A page travels storage -> pinned host -> device:
//
//   +---------+   read_range    +---------------+   submit    +--------+
//   |  file   | --------------> | PinnedBuffer  | ----------> | device |
//   +---------+  1 MiB chunks   +---------------+  stream[k]  +--------+
//                                       ^                         |
//                                       |     poller: event done  |
//                                       +--- release + callback --+
//
// The engine never blocks the submitting thread. Completion is discovered by
// polling the event recorded right after each copy on the same stream, so an
// event only speaks for its own copy and for earlier work on that stream.
// ============================================================================

use std::fmt;

/// Errors raised by the copy engine and its backends.
#[derive(Debug)]
pub enum EngineError {
    /// Source region is missing or shorter than the requested copy.
    InvalidSource(String),
    /// Destination device address is null.
    InvalidDestination(String),
    /// The backend could not provide pinned host memory of this size.
    OutOfHostMemory(usize),
    /// Zero-byte pinned allocation requested.
    ZeroSize,
    /// Device index invalid or its stream pool could not be created.
    DeviceInit(String),
    /// Backend runtime call failed after initialization.
    Backend(String),
    /// Background poller thread could not be started.
    Spawn(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidSource(msg) => write!(f, "invalid source: {msg}"),
            EngineError::InvalidDestination(msg) => write!(f, "invalid destination: {msg}"),
            EngineError::OutOfHostMemory(bytes) => {
                write!(f, "failed to allocate {bytes} bytes of pinned host memory")
            }
            EngineError::ZeroSize => write!(f, "pinned allocation size must be greater than zero"),
            EngineError::DeviceInit(msg) => write!(f, "device initialization failed: {msg}"),
            EngineError::Backend(msg) => write!(f, "backend error: {msg}"),
            EngineError::Spawn(msg) => write!(f, "failed to start completion poller: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
