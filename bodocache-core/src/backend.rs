//! Hardware contract required by the copy engine.
//!
//! Everything above this module is written against [`CopyBackend`] only. A
//! backend owns per-device stream pools, pinned host allocations and completion
//! events. Exactly one backend type is chosen per engine instantiation.

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;

use std::{collections::HashMap, ptr::NonNull};

use parking_lot::RwLock;

use crate::EngineError;
use crate::pinned::DevicePtr;

/// Minimal capability set a GPU runtime must provide.
pub trait CopyBackend: Send + Sync + 'static {
    /// Handle to one ordered command stream (queue) on a device.
    type Stream: Clone + Send + Sync;
    /// Completion marker recorded on a stream.
    type Event: Send;

    /// Create `count` non-blocking streams for `device`. Calling it again for
    /// an initialized device is a no-op.
    fn init_streams(&self, device: i32, count: usize) -> Result<(), EngineError>;

    /// Number of streams in the pool of `device`, zero if never initialized.
    fn stream_count(&self, device: i32) -> usize;

    /// Look up a stream; `index` wraps modulo the pool size.
    fn stream(&self, device: i32, index: i32) -> Result<Self::Stream, EngineError>;

    /// Allocate host memory usable as an async copy source.
    fn alloc_pinned(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Release a region returned by [`CopyBackend::alloc_pinned`].
    ///
    /// # Safety
    /// `ptr` must come from `alloc_pinned(bytes)` on this backend and must not
    /// have been released already.
    unsafe fn free_pinned(&self, ptr: NonNull<u8>, bytes: usize);

    /// Enqueue a host-to-device copy on `stream` without waiting for it.
    ///
    /// # Safety
    /// `src` must be readable for `bytes` and `dst` writable for `bytes` until
    /// an event recorded after this call reports completion.
    unsafe fn copy_h2d_async(
        &self,
        device: i32,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: &Self::Stream,
    ) -> Result<(), EngineError>;

    /// Record an event behind all work currently enqueued on `stream`.
    fn record_event(&self, stream: &Self::Stream) -> Result<Self::Event, EngineError>;

    /// Non-blocking completion query.
    fn event_completed(&self, event: &Self::Event) -> bool;

    /// Release an event that has reported completion.
    fn destroy_event(&self, event: Self::Event);
}

/// Map a caller stream index onto a pool slot. Negative indices use slot 0.
#[inline]
pub fn select_stream(index: i32, pool_size: usize) -> usize {
    debug_assert!(pool_size > 0);
    usize::try_from(index).unwrap_or(0) % pool_size
}

/// Per-device stream pools shared by the concrete backends.
pub struct StreamPools<S> {
    pools: RwLock<HashMap<i32, Vec<S>>>,
}

impl<S: Clone> Default for StreamPools<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> StreamPools<S> {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Build the pool for `device` once, creating each stream with `create`.
    pub fn init_with<F>(&self, device: i32, count: usize, mut create: F) -> Result<(), EngineError>
    where
        F: FnMut(usize) -> Result<S, EngineError>,
    {
        if count == 0 {
            return Err(EngineError::DeviceInit(format!(
                "device {device}: stream pool size must be greater than zero"
            )));
        }

        let mut pools = self.pools.write();
        if pools.contains_key(&device) {
            return Ok(());
        }

        let streams = (0..count).map(&mut create).collect::<Result<Vec<_>, _>>()?;
        pools.insert(device, streams);
        Ok(())
    }

    pub fn len(&self, device: i32) -> usize {
        self.pools.read().get(&device).map_or(0, Vec::len)
    }

    pub fn get(&self, device: i32, index: i32) -> Result<S, EngineError> {
        let pools = self.pools.read();
        let streams = pools
            .get(&device)
            .filter(|streams| !streams.is_empty())
            .ok_or_else(|| {
                EngineError::DeviceInit(format!("device {device}: streams not initialized"))
            })?;
        Ok(streams[select_stream(index, streams.len())].clone())
    }

    pub fn devices(&self) -> Vec<i32> {
        let mut devices: Vec<i32> = self.pools.read().keys().copied().collect();
        devices.sort_unstable();
        devices
    }
}
