//! CUDA driver backend.
//!
//! One primary context per device, a pool of non-blocking streams per context,
//! portable page-locked host memory (`cuMemHostAlloc`) and timing-free events
//! polled with `cuEventQuery`. Every driver call binds the owning context to
//! the calling thread first, since the poller and submitters run on different
//! threads.

use std::{collections::HashMap, ffi::c_void, ptr::NonNull, sync::Arc};

use cudarc::driver::{CudaContext, CudaStream, sys};
use log::{info, warn};
use parking_lot::RwLock;

use super::{CopyBackend, StreamPools};
use crate::EngineError;
use crate::pinned::DevicePtr;

/// Stream plus the context it was created in.
#[derive(Clone)]
pub struct CudaStreamHandle {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaStreamHandle {
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

/// Raw CUDA event with the context needed to query and destroy it.
pub struct CudaEventHandle {
    ctx: Arc<CudaContext>,
    event: sys::CUevent,
}

// SAFETY: CUevent is an opaque driver handle that may be used from any thread
// once its context is bound to that thread.
unsafe impl Send for CudaEventHandle {}

/// CUDA implementation of [`CopyBackend`].
pub struct CudaBackend {
    contexts: RwLock<HashMap<i32, Arc<CudaContext>>>,
    pools: StreamPools<CudaStreamHandle>,
}

impl Default for CudaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CudaBackend {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            pools: StreamPools::new(),
        }
    }

    /// Context of `device`, if its streams were initialized.
    pub fn context(&self, device: i32) -> Option<Arc<CudaContext>> {
        self.contexts.read().get(&device).cloned()
    }

    /// Any initialized context; pinned allocations are portable across them.
    fn any_context(&self) -> Option<Arc<CudaContext>> {
        self.contexts.read().values().next().cloned()
    }
}

fn check(result: sys::CUresult, what: &str) -> Result<(), EngineError> {
    if result != sys::cudaError_enum::CUDA_SUCCESS {
        return Err(EngineError::Backend(format!("{what} failed: {result:?}")));
    }
    Ok(())
}

fn bind(ctx: &CudaContext) -> Result<(), EngineError> {
    ctx.bind_to_thread()
        .map_err(|e| EngineError::Backend(format!("failed to bind CUDA context: {e:?}")))
}

impl CopyBackend for CudaBackend {
    type Stream = CudaStreamHandle;
    type Event = CudaEventHandle;

    fn init_streams(&self, device: i32, count: usize) -> Result<(), EngineError> {
        let device_count = CudaContext::device_count()
            .map_err(|e| EngineError::DeviceInit(format!("failed to query devices: {e:?}")))?;
        if device < 0 || device >= device_count {
            return Err(EngineError::DeviceInit(format!(
                "invalid CUDA device id {device} (device count {device_count})"
            )));
        }

        let ctx = match self.context(device) {
            Some(ctx) => ctx,
            None => {
                let ctx = CudaContext::new(device as usize).map_err(|e| {
                    EngineError::DeviceInit(format!("failed to create CUDA context: {e:?}"))
                })?;
                self.contexts.write().entry(device).or_insert(ctx).clone()
            }
        };

        self.pools.init_with(device, count, |_| {
            let stream = ctx.new_stream().map_err(|e| {
                EngineError::DeviceInit(format!("failed to create CUDA stream: {e:?}"))
            })?;
            Ok(CudaStreamHandle {
                ctx: Arc::clone(&ctx),
                stream,
            })
        })?;

        info!("CUDA streams ready: device={} streams={}", device, count);
        Ok(())
    }

    fn stream_count(&self, device: i32) -> usize {
        self.pools.len(device)
    }

    fn stream(&self, device: i32, index: i32) -> Result<CudaStreamHandle, EngineError> {
        self.pools.get(device, index)
    }

    fn alloc_pinned(&self, bytes: usize) -> Option<NonNull<u8>> {
        let ctx = self.any_context()?;
        if let Err(e) = bind(&ctx) {
            warn!("Pinned allocation skipped: {e}");
            return None;
        }
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let result = unsafe { sys::cuMemHostAlloc(&mut ptr, bytes, sys::CU_MEMHOSTALLOC_PORTABLE) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            warn!("cuMemHostAlloc failed: bytes={} error={:?}", bytes, result);
            return None;
        }
        NonNull::new(ptr as *mut u8)
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>, _bytes: usize) {
        if let Some(ctx) = self.any_context() {
            if let Err(e) = bind(&ctx) {
                warn!("cuMemFreeHost without a bound context: {e}");
            }
        }
        // SAFETY: ptr was allocated with cuMemHostAlloc and is released once.
        let result = unsafe { sys::cuMemFreeHost(ptr.as_ptr() as *mut c_void) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            warn!("cuMemFreeHost failed: {:?}", result);
        }
    }

    unsafe fn copy_h2d_async(
        &self,
        _device: i32,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: &CudaStreamHandle,
    ) -> Result<(), EngineError> {
        bind(&stream.ctx)?;
        // SAFETY: the caller keeps both ranges alive until the event completes.
        let result = unsafe {
            sys::cuMemcpyHtoDAsync_v2(
                dst.addr(),
                src as *const c_void,
                bytes,
                stream.stream.cu_stream(),
            )
        };
        check(result, "cuMemcpyHtoDAsync")
    }

    fn record_event(&self, stream: &CudaStreamHandle) -> Result<CudaEventHandle, EngineError> {
        bind(&stream.ctx)?;
        let mut event: sys::CUevent = std::ptr::null_mut();
        let flags = sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as u32;
        check(unsafe { sys::cuEventCreate(&mut event, flags) }, "cuEventCreate")?;
        if let Err(e) = check(
            unsafe { sys::cuEventRecord(event, stream.stream.cu_stream()) },
            "cuEventRecord",
        ) {
            unsafe { sys::cuEventDestroy_v2(event) };
            return Err(e);
        }
        Ok(CudaEventHandle {
            ctx: Arc::clone(&stream.ctx),
            event,
        })
    }

    fn event_completed(&self, event: &CudaEventHandle) -> bool {
        if bind(&event.ctx).is_err() {
            return false;
        }
        let result = unsafe { sys::cuEventQuery(event.event) };
        match result {
            sys::cudaError_enum::CUDA_SUCCESS => true,
            sys::cudaError_enum::CUDA_ERROR_NOT_READY => false,
            other => {
                // Sticky errors never resolve; the op stays in flight.
                warn!("cuEventQuery failed: {:?}", other);
                false
            }
        }
    }

    fn destroy_event(&self, event: CudaEventHandle) {
        if let Err(e) = bind(&event.ctx) {
            warn!("cuEventDestroy without a bound context: {e}");
        }
        let result = unsafe { sys::cuEventDestroy_v2(event.event) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            warn!("cuEventDestroy failed: {:?}", result);
        }
    }
}
