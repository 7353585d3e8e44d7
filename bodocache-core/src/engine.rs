use std::{
    panic::{self, AssertUnwindSafe},
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytesize::ByteSize;
use log::{debug, error, info, warn};
use logforth::diagnostic::ThreadLocalDiagnostic;
use parking_lot::Mutex;

use crate::EngineError;
use crate::backend::CopyBackend;
use crate::metrics::core_metrics;
use crate::pinned::{DevicePtr, HostRegion, LiveBuffers, PinnedBuffer, ReleasePinned};

pub const DEFAULT_STREAMS_PER_DEVICE: usize = 4;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Which callback receives a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallbackPolicy {
    /// One engine-wide slot, replaced by every `submit`. Completions of an
    /// earlier batch observed after a later `submit` go to the later callback.
    #[default]
    LatestWins,
    /// Each operation is delivered to the callback of the batch it came in.
    PerBatch,
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Devices that get a stream pool at construction.
    pub devices: Vec<i32>,
    pub streams_per_device: usize,
    /// Sleep between two scans of the in-flight set.
    pub poll_interval: Duration,
    pub callback_policy: CallbackPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: vec![0],
            streams_per_device: DEFAULT_STREAMS_PER_DEVICE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            callback_policy: CallbackPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn for_device(device_id: i32) -> Self {
        Self {
            devices: vec![device_id],
            ..Default::default()
        }
    }

    pub fn with_devices(mut self, devices: impl IntoIterator<Item = i32>) -> Self {
        self.devices = devices.into_iter().collect();
        self
    }

    pub fn with_streams_per_device(mut self, streams: usize) -> Self {
        self.streams_per_device = streams;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_callback_policy(mut self, policy: CallbackPolicy) -> Self {
        self.callback_policy = policy;
        self
    }
}

/// Metadata handed to the completion callback, once per finished copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub gpu_id: i32,
    pub bytes: usize,
    pub deadline_ms: i64,
}

/// Where a copy reads from.
#[derive(Debug, Clone)]
pub enum CopySource {
    /// Engine-allocated memory. The operation co-owns the buffer until its
    /// copy completes.
    Pinned {
        buffer: Arc<PinnedBuffer>,
        offset: usize,
    },
    /// Caller-managed memory, never freed by the engine.
    Host(HostRegion),
}

impl CopySource {
    pub fn pinned(buffer: Arc<PinnedBuffer>) -> Self {
        CopySource::Pinned { buffer, offset: 0 }
    }

    pub fn pinned_at(buffer: Arc<PinnedBuffer>, offset: usize) -> Self {
        CopySource::Pinned { buffer, offset }
    }

    /// Start address of `bytes` readable bytes, or why there are not enough.
    fn readable_ptr(&self, bytes: usize) -> Result<*const u8, String> {
        match self {
            CopySource::Pinned { buffer, offset } => {
                let end = offset
                    .checked_add(bytes)
                    .ok_or_else(|| "source range overflows".to_string())?;
                if end > buffer.len() {
                    return Err(format!(
                        "pinned buffer holds {} bytes, copy needs {} at offset {}",
                        buffer.len(),
                        bytes,
                        offset
                    ));
                }
                // SAFETY: offset + bytes <= len, so the result stays in bounds.
                Ok(unsafe { buffer.as_ptr().add(*offset) })
            }
            CopySource::Host(region) => {
                if region.as_ptr().is_null() {
                    return Err("host region is null".to_string());
                }
                if region.len() < bytes {
                    return Err(format!(
                        "host region holds {} bytes, copy needs {}",
                        region.len(),
                        bytes
                    ));
                }
                Ok(region.as_ptr())
            }
        }
    }
}

impl From<Arc<PinnedBuffer>> for CopySource {
    fn from(buffer: Arc<PinnedBuffer>) -> Self {
        CopySource::pinned(buffer)
    }
}

impl From<PinnedBuffer> for CopySource {
    fn from(buffer: PinnedBuffer) -> Self {
        CopySource::pinned(Arc::new(buffer))
    }
}

impl From<HostRegion> for CopySource {
    fn from(region: HostRegion) -> Self {
        CopySource::Host(region)
    }
}

/// One host-to-device copy request.
#[derive(Debug, Clone)]
pub struct CopyOperation {
    pub src: CopySource,
    pub dst: DevicePtr,
    pub bytes: usize,
    /// Logical stream; wraps modulo the device's pool size.
    pub stream_id: i32,
    pub gpu_id: i32,
    /// Advisory only; reported back in the completion.
    pub deadline_ms: i64,
}

impl CopyOperation {
    pub fn new(src: impl Into<CopySource>, dst: impl Into<DevicePtr>, bytes: usize) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            bytes,
            stream_id: 0,
            gpu_id: 0,
            deadline_ms: 0,
        }
    }

    pub fn with_stream(mut self, stream_id: i32) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn on_device(mut self, gpu_id: i32) -> Self {
        self.gpu_id = gpu_id;
        self
    }

    pub fn with_deadline(mut self, deadline_ms: i64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    fn completion(&self) -> Completion {
        Completion {
            gpu_id: self.gpu_id,
            bytes: self.bytes,
            deadline_ms: self.deadline_ms,
        }
    }
}

/// Shared completion callback.
pub type Callback = Arc<dyn Fn(Completion) + Send + Sync>;

struct PendingOp<E> {
    op: CopyOperation,
    event: E,
    callback: Callback,
    submitted_at: Instant,
}

/// A pending op whose event has been observed and destroyed.
struct FinishedOp {
    op: CopyOperation,
    callback: Callback,
    submitted_at: Instant,
}

struct EngineState<E> {
    pending: Vec<PendingOp<E>>,
    live: LiveBuffers,
    active_callback: Option<Callback>,
}

struct EngineShared<B: CopyBackend> {
    backend: B,
    config: EngineConfig,
    state: Mutex<EngineState<B::Event>>,
    running: AtomicBool,
    /// Copies submitted whose callback has not returned yet.
    outstanding: AtomicUsize,
}

impl<B: CopyBackend> ReleasePinned for EngineShared<B> {
    fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let mut state = self.state.lock();
        if state.live.remove(ptr).is_none() {
            error!("Pinned region {:p} released but not live", ptr);
            return;
        }
        // SAFETY: removal from the live set succeeded, so this is the only free.
        unsafe { self.backend.free_pinned(ptr, bytes) };
        drop(state);

        core_metrics().pinned_live_bytes.add(-(bytes as i64), &[]);
        debug!("Released pinned buffer: ptr={:p} bytes={}", ptr, bytes);
    }
}

impl<B: CopyBackend> EngineShared<B> {
    /// One scan of the in-flight set. Returns how many completions were delivered.
    fn poll_once(&self) -> usize {
        let (finished, active) = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return 0;
            }
            let (done, still_pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|pending| self.backend.event_completed(&pending.event));
            state.pending = still_pending;
            if done.is_empty() {
                return 0;
            }

            let finished: Vec<FinishedOp> = done
                .into_iter()
                .map(|pending| {
                    self.backend.destroy_event(pending.event);
                    FinishedOp {
                        op: pending.op,
                        callback: pending.callback,
                        submitted_at: pending.submitted_at,
                    }
                })
                .collect();
            (finished, state.active_callback.clone())
        };

        let metrics = core_metrics();
        let count = finished.len();
        let mut deliveries = Vec::with_capacity(count);
        for FinishedOp {
            op,
            callback,
            submitted_at,
        } in finished
        {
            metrics
                .copy_completion_latency_ms
                .record(submitted_at.elapsed().as_secs_f64() * 1000.0, &[]);
            let callback = match (self.config.callback_policy, &active) {
                (CallbackPolicy::LatestWins, Some(active)) => Arc::clone(active),
                _ => callback,
            };
            deliveries.push((op.completion(), callback));
            // Dropping the op releases its pinned source when it was the last owner.
            drop(op);
        }
        metrics.copy_inflight.add(-(count as i64), &[]);

        for (completion, callback) in deliveries {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(completion))).is_err() {
                error!(
                    "Completion callback panicked: gpu_id={} bytes={} deadline_ms={}",
                    completion.gpu_id, completion.bytes, completion.deadline_ms
                );
                metrics.callback_panics.add(1, &[]);
            }
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }

        count
    }
}

/// Completion poller thread main loop
fn poll_loop<B: CopyBackend>(shared: Arc<EngineShared<B>>) {
    ThreadLocalDiagnostic::insert("devices", format!("{:?}", shared.config.devices));
    info!(
        "Completion poller running: poll_interval_us={}",
        shared.config.poll_interval.as_micros()
    );

    let mut delivered = 0usize;
    while shared.running.load(Ordering::Acquire) {
        delivered += shared.poll_once();
        thread::sleep(shared.config.poll_interval);
    }

    info!(
        "Completion poller shutting down: delivered={} in_flight={}",
        delivered,
        shared.state.lock().pending.len()
    );
}

/// Asynchronous host-to-device copy engine over one backend.
///
/// `submit` enqueues copies and returns; a background poller (started on the
/// first submission) watches the recorded events, releases engine-owned
/// sources and invokes the callback outside the state lock, so callbacks may
/// submit again. Dropping the engine stops and joins the poller. Copies still
/// in flight at that point are leaked together with their sources, since the
/// device may still be reading them.
pub struct CopyEngine<B: CopyBackend> {
    shared: Arc<EngineShared<B>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CopyBackend> CopyEngine<B> {
    /// Create stream pools for every configured device.
    pub fn new(backend: B, config: EngineConfig) -> Result<Self, EngineError> {
        if config.devices.is_empty() {
            return Err(EngineError::DeviceInit("no devices configured".to_string()));
        }
        for &device in &config.devices {
            backend.init_streams(device, config.streams_per_device)?;
        }

        info!(
            "Copy engine ready: devices={:?} streams_per_device={} policy={:?}",
            config.devices, config.streams_per_device, config.callback_policy
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                backend,
                config,
                state: Mutex::new(EngineState {
                    pending: Vec::new(),
                    live: LiveBuffers::default(),
                    active_callback: None,
                }),
                running: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Allocate pinned host memory tracked by this engine.
    pub fn acquire_host_buffer(&self, bytes: usize) -> Result<PinnedBuffer, EngineError> {
        if bytes == 0 {
            return Err(EngineError::ZeroSize);
        }

        let metrics = core_metrics();
        let Some(ptr) = self.shared.backend.alloc_pinned(bytes) else {
            metrics.pinned_alloc_failures.add(1, &[]);
            warn!(
                "Pinned allocation failed: requested={}",
                ByteSize::b(bytes as u64)
            );
            return Err(EngineError::OutOfHostMemory(bytes));
        };

        if !self.shared.state.lock().live.register(ptr, bytes) {
            // The region belongs to a live buffer, which frees it on drop.
            return Err(EngineError::Backend(format!(
                "backend returned pinned region {ptr:p} that is still live"
            )));
        }
        metrics.pinned_live_bytes.add(bytes as i64, &[]);
        debug!(
            "Acquired pinned buffer: ptr={:p} size={}",
            ptr,
            ByteSize::b(bytes as u64)
        );

        let owner: Arc<dyn ReleasePinned> = self.shared.clone();
        Ok(PinnedBuffer::new(ptr, bytes, owner))
    }

    /// Enqueue a batch of copies and return without waiting for them.
    ///
    /// The whole batch is validated before any backend call. `callback` becomes
    /// the active callback (see [`CallbackPolicy`]).
    ///
    /// # Safety
    /// For every operation, `dst` must be device memory of `gpu_id` that is
    /// writable for `bytes` bytes and not accessed by anything else from this
    /// call until the operation's completion has been delivered. On
    /// [`crate::HostBackend`] the destination is plain host memory.
    ///
    /// Only a source can be checked here; a destination cannot:
    ///
    /// ```compile_fail
    /// use bodocache_core::{CopyEngine, CopyOperation, DevicePtr, EngineConfig, HostBackend, HostRegion};
    ///
    /// let engine = CopyEngine::new(HostBackend::new(1), EngineConfig::default()).unwrap();
    /// let op = CopyOperation::new(HostRegion::from_static(&[0u8; 8]), DevicePtr::new(0x10), 8);
    /// engine.submit(vec![op], |_| {}).unwrap();
    /// ```
    ///
    /// ```
    /// use bodocache_core::{CopyEngine, CopyOperation, DevicePtr, EngineConfig, HostBackend, HostRegion};
    /// use std::time::Duration;
    ///
    /// let engine = CopyEngine::new(HostBackend::new(1), EngineConfig::default()).unwrap();
    /// let mut device = vec![0u8; 8];
    /// let op = CopyOperation::new(
    ///     HostRegion::from_static(b"pagedata"),
    ///     DevicePtr::from(device.as_mut_ptr()),
    ///     8,
    /// );
    /// // SAFETY: `device` outlives the copy; wait_idle returns after delivery.
    /// unsafe { engine.submit(vec![op], |_| {}) }.unwrap();
    /// assert!(engine.wait_idle(Duration::from_secs(5)));
    /// assert_eq!(device, b"pagedata");
    /// ```
    pub unsafe fn submit<F>(&self, ops: Vec<CopyOperation>, callback: F) -> Result<(), EngineError>
    where
        F: Fn(Completion) + Send + Sync + 'static,
    {
        // SAFETY: forwarded from the caller.
        unsafe { self.submit_shared(ops, Arc::new(callback)) }
    }

    /// Like [`CopyEngine::submit`] with a callback shared across batches.
    ///
    /// # Safety
    /// Same destination contract as [`CopyEngine::submit`].
    pub unsafe fn submit_shared(
        &self,
        ops: Vec<CopyOperation>,
        callback: Callback,
    ) -> Result<(), EngineError> {
        let metrics = core_metrics();
        let sources = match ops
            .iter()
            .enumerate()
            .map(|(index, op)| self.validate(index, op))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(sources) => sources,
            Err(e) => {
                metrics.copy_submit_failures.add(1, &[]);
                return Err(e);
            }
        };

        self.ensure_worker()?;

        let backend = &self.shared.backend;
        let mut issued = Vec::with_capacity(ops.len());
        let mut failure = None;
        for (op, src) in ops.into_iter().zip(sources) {
            let stream = match backend.stream(op.gpu_id, op.stream_id) {
                Ok(stream) => stream,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            // SAFETY: src was validated readable for op.bytes. Pinned sources
            // stay alive through the op; host regions through their contract.
            // dst is writable for op.bytes by this function's contract.
            if let Err(e) =
                unsafe { backend.copy_h2d_async(op.gpu_id, op.dst, src, op.bytes, &stream) }
            {
                failure = Some(e);
                break;
            }
            match backend.record_event(&stream) {
                Ok(event) => issued.push(PendingOp {
                    op,
                    event,
                    callback: Arc::clone(&callback),
                    submitted_at: Instant::now(),
                }),
                Err(e) => {
                    // The copy is on the stream with nothing to observe it.
                    std::mem::forget(op.src);
                    failure = Some(e);
                    break;
                }
            }
        }

        let count = issued.len();
        let bytes: usize = issued.iter().map(|pending| pending.op.bytes).sum();
        self.shared.outstanding.fetch_add(count, Ordering::AcqRel);
        let previous = {
            let mut state = self.shared.state.lock();
            state.pending.extend(issued);
            state.active_callback.replace(callback)
        };
        drop(previous);

        metrics.copy_ops_submitted.add(count as u64, &[]);
        metrics.copy_bytes_submitted.add(bytes as u64, &[]);
        metrics.copy_inflight.add(count as i64, &[]);

        if let Some(e) = failure {
            metrics.copy_submit_failures.add(1, &[]);
            error!("Copy batch partially issued: issued={} error={}", count, e);
            return Err(e);
        }

        debug!("Copy batch submitted: ops={} bytes={}", count, bytes);
        Ok(())
    }

    fn validate(&self, index: usize, op: &CopyOperation) -> Result<*const u8, EngineError> {
        let src = op
            .src
            .readable_ptr(op.bytes)
            .map_err(|msg| EngineError::InvalidSource(format!("op {index}: {msg}")))?;
        if op.dst.is_null() {
            return Err(EngineError::InvalidDestination(format!(
                "op {index}: destination device address is null"
            )));
        }
        if self.shared.backend.stream_count(op.gpu_id) == 0 {
            return Err(EngineError::DeviceInit(format!(
                "op {index}: device {} has no stream pool",
                op.gpu_id
            )));
        }
        Ok(src)
    }

    fn ensure_worker(&self) -> Result<(), EngineError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("bodocache-poller".to_string())
            .spawn(move || poll_loop(shared))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                EngineError::Spawn(e.to_string())
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Copies enqueued whose events have not been observed complete.
    pub fn pending_ops(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Copies submitted whose callback has not returned yet.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Engine-allocated pinned regions not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.shared.state.lock().live.total_bytes()
    }

    /// Whether `ptr` is the start of a live engine-allocated region.
    pub fn owns_buffer(&self, ptr: *const u8) -> bool {
        self.shared.state.lock().live.contains(ptr)
    }

    /// Wait until every submitted copy has been delivered, or `timeout` passes.
    /// Returns whether the engine drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.shared.config.poll_interval.max(Duration::from_micros(100)));
        }
    }
}

impl<B: CopyBackend> Drop for CopyEngine<B> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.get_mut().take() {
            if handle.thread().id() == thread::current().id() {
                warn!("Copy engine dropped from a completion callback; poller exits after this scan");
            } else if handle.join().is_err() {
                error!("Completion poller panicked");
            }
        }

        let in_flight = std::mem::take(&mut self.shared.state.lock().pending);
        if !in_flight.is_empty() {
            warn!(
                "Copy engine dropped with {} copies in flight; leaking their events and sources",
                in_flight.len()
            );
            std::mem::forget(in_flight);
        }
    }
}
