//! Host-memory backend.
//!
//! "Device" addresses are plain host addresses and copies run at enqueue time,
//! but completion is still only observable by polling events: each event
//! reports done after a configurable number of queries, and never before the
//! events recorded earlier on its stream. Streams can be held individually.
//! Runs anywhere, which makes it the backend for tests and CPU-only hosts.

use std::{
    alloc::{self, Layout},
    collections::{HashMap, HashSet, VecDeque},
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use log::debug;
use parking_lot::Mutex;

use super::{CopyBackend, StreamPools};
use crate::EngineError;
use crate::pinned::DevicePtr;

const PINNED_ALIGNMENT: usize = 64;

/// One stream slot of the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostStream {
    pub device: i32,
    pub index: usize,
}

/// Event that reports completion after `remaining_polls` more queries, once
/// every earlier event on its stream has completed.
#[derive(Debug)]
pub struct HostEvent {
    id: u64,
    stream: HostStream,
    remaining_polls: AtomicU32,
    done: AtomicBool,
}

impl HostEvent {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream(&self) -> HostStream {
        self.stream
    }
}

/// Counters exposed for lifecycle assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub pinned_allocs: usize,
    pub pinned_frees: usize,
    pub copies: usize,
    pub copied_bytes: usize,
    pub events_recorded: usize,
    pub events_destroyed: usize,
}

/// Backend whose device memory is host memory.
pub struct HostBackend {
    device_count: i32,
    pools: StreamPools<HostStream>,
    polls_to_complete: AtomicU32,
    hold_completions: AtomicBool,
    held_streams: Mutex<HashSet<HostStream>>,
    /// Ids of recorded, not yet completed events per stream, oldest first.
    stream_queues: Mutex<HashMap<HostStream, VecDeque<u64>>>,
    alloc_limit: usize,
    copy_budget: usize,
    allocated: Mutex<HashSet<usize>>,
    next_event_id: AtomicU64,
    pinned_allocs: AtomicUsize,
    pinned_frees: AtomicUsize,
    copies: AtomicUsize,
    copied_bytes: AtomicUsize,
    events_recorded: AtomicUsize,
    events_destroyed: AtomicUsize,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HostBackend {
    /// Simulate `device_count` devices whose events complete on first query.
    pub fn new(device_count: i32) -> Self {
        Self {
            device_count,
            pools: StreamPools::new(),
            polls_to_complete: AtomicU32::new(0),
            hold_completions: AtomicBool::new(false),
            held_streams: Mutex::new(HashSet::new()),
            stream_queues: Mutex::new(HashMap::new()),
            alloc_limit: usize::MAX,
            copy_budget: usize::MAX,
            allocated: Mutex::new(HashSet::new()),
            next_event_id: AtomicU64::new(1),
            pinned_allocs: AtomicUsize::new(0),
            pinned_frees: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
            copied_bytes: AtomicUsize::new(0),
            events_recorded: AtomicUsize::new(0),
            events_destroyed: AtomicUsize::new(0),
        }
    }

    /// Events recorded from now on report incomplete for `polls` queries.
    pub fn with_completion_after(self, polls: u32) -> Self {
        self.set_completion_after(polls);
        self
    }

    /// Like [`HostBackend::with_completion_after`] on a shared backend.
    pub fn set_completion_after(&self, polls: u32) {
        self.polls_to_complete.store(polls, Ordering::Relaxed);
    }

    /// Events never complete, as with a wedged device.
    pub fn wedged(self) -> Self {
        self.with_completion_after(u32::MAX)
    }

    /// Fail pinned allocations larger than `bytes`.
    pub fn with_alloc_limit(mut self, bytes: usize) -> Self {
        self.alloc_limit = bytes;
        self
    }

    /// Copies after the first `copies` fail with a backend error.
    pub fn fail_copies_after(mut self, copies: usize) -> Self {
        self.copy_budget = copies;
        self
    }

    /// While held, every event reports incomplete regardless of its poll count.
    pub fn hold_completions(&self, hold: bool) {
        self.hold_completions.store(hold, Ordering::Release);
    }

    /// While held, events on stream `index` of `device` report incomplete.
    /// Later events on that stream wait behind them; other streams do not.
    pub fn hold_stream(&self, device: i32, index: usize, hold: bool) {
        let stream = HostStream { device, index };
        let mut held = self.held_streams.lock();
        if hold {
            held.insert(stream);
        } else {
            held.remove(&stream);
        }
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            pinned_allocs: self.pinned_allocs.load(Ordering::Acquire),
            pinned_frees: self.pinned_frees.load(Ordering::Acquire),
            copies: self.copies.load(Ordering::Acquire),
            copied_bytes: self.copied_bytes.load(Ordering::Acquire),
            events_recorded: self.events_recorded.load(Ordering::Acquire),
            events_destroyed: self.events_destroyed.load(Ordering::Acquire),
        }
    }

    fn layout(bytes: usize) -> Option<Layout> {
        Layout::from_size_align(bytes, PINNED_ALIGNMENT).ok()
    }
}

impl CopyBackend for HostBackend {
    type Stream = HostStream;
    type Event = HostEvent;

    fn init_streams(&self, device: i32, count: usize) -> Result<(), EngineError> {
        if device < 0 || device >= self.device_count {
            return Err(EngineError::DeviceInit(format!(
                "invalid host device id {device} (device count {})",
                self.device_count
            )));
        }
        self.pools
            .init_with(device, count, |index| Ok(HostStream { device, index }))?;
        debug!("Host streams ready: device={} streams={}", device, count);
        Ok(())
    }

    fn stream_count(&self, device: i32) -> usize {
        self.pools.len(device)
    }

    fn stream(&self, device: i32, index: i32) -> Result<HostStream, EngineError> {
        self.pools.get(device, index)
    }

    fn alloc_pinned(&self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 || bytes > self.alloc_limit {
            return None;
        }
        let layout = Self::layout(bytes)?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.allocated.lock().insert(ptr.as_ptr() as usize);
        self.pinned_allocs.fetch_add(1, Ordering::AcqRel);
        Some(ptr)
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>, bytes: usize) {
        let addr = ptr.as_ptr() as usize;
        assert!(
            self.allocated.lock().remove(&addr),
            "pinned region {addr:#x} freed twice or never allocated"
        );
        let Some(layout) = Self::layout(bytes) else {
            return;
        };
        // SAFETY: ptr was allocated with this layout and is released once.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        self.pinned_frees.fetch_add(1, Ordering::AcqRel);
    }

    unsafe fn copy_h2d_async(
        &self,
        _device: i32,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        _stream: &HostStream,
    ) -> Result<(), EngineError> {
        if self.copies.load(Ordering::Acquire) >= self.copy_budget {
            return Err(EngineError::Backend("injected copy failure".to_string()));
        }
        if bytes > 0 {
            // SAFETY: the caller guarantees both ranges are valid for `bytes`.
            unsafe {
                std::ptr::copy_nonoverlapping(src, dst.addr() as usize as *mut u8, bytes);
            }
        }
        self.copies.fetch_add(1, Ordering::AcqRel);
        self.copied_bytes.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    fn record_event(&self, stream: &HostStream) -> Result<HostEvent, EngineError> {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        self.stream_queues
            .lock()
            .entry(*stream)
            .or_default()
            .push_back(id);
        self.events_recorded.fetch_add(1, Ordering::AcqRel);
        Ok(HostEvent {
            id,
            stream: *stream,
            remaining_polls: AtomicU32::new(self.polls_to_complete.load(Ordering::Relaxed)),
            done: AtomicBool::new(false),
        })
    }

    fn event_completed(&self, event: &HostEvent) -> bool {
        if event.done.load(Ordering::Acquire) {
            return true;
        }
        if self.hold_completions.load(Ordering::Acquire)
            || self.held_streams.lock().contains(&event.stream)
        {
            return false;
        }
        let remaining = event.remaining_polls.load(Ordering::Acquire);
        if remaining > 0 {
            if remaining != u32::MAX {
                event.remaining_polls.store(remaining - 1, Ordering::Release);
            }
            return false;
        }

        let mut queues = self.stream_queues.lock();
        let Some(queue) = queues.get_mut(&event.stream) else {
            return false;
        };
        if queue.front() != Some(&event.id) {
            return false;
        }
        queue.pop_front();
        event.done.store(true, Ordering::Release);
        true
    }

    fn destroy_event(&self, event: HostEvent) {
        debug_assert!(
            event.done.load(Ordering::Acquire),
            "event {} destroyed before completion",
            event.id
        );
        if !event.done.load(Ordering::Acquire) {
            if let Some(queue) = self.stream_queues.lock().get_mut(&event.stream) {
                queue.retain(|&id| id != event.id);
            }
        }
        self.events_destroyed.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        let leaked = self.allocated.get_mut().len();
        if leaked > 0 {
            debug!("Host backend dropped with {} pinned regions still allocated", leaked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_device() {
        let backend = HostBackend::new(2);
        assert!(backend.init_streams(1, 2).is_ok());
        assert!(matches!(
            backend.init_streams(2, 2),
            Err(EngineError::DeviceInit(_))
        ));
        assert!(matches!(
            backend.init_streams(-1, 2),
            Err(EngineError::DeviceInit(_))
        ));
    }

    #[test]
    fn stream_lookup_wraps() {
        let backend = HostBackend::new(1);
        backend.init_streams(0, 4).unwrap();
        let a = backend.stream(0, 1).unwrap();
        let b = backend.stream(0, 5).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.index, 1);
        assert_eq!(backend.stream(0, -3).unwrap().index, 0);
    }

    #[test]
    fn event_completes_after_configured_polls() {
        let backend = HostBackend::new(1).with_completion_after(2);
        backend.init_streams(0, 1).unwrap();
        let stream = backend.stream(0, 0).unwrap();
        let event = backend.record_event(&stream).unwrap();
        assert!(!backend.event_completed(&event));
        assert!(!backend.event_completed(&event));
        assert!(backend.event_completed(&event));
        backend.destroy_event(event);
        assert_eq!(backend.stats().events_destroyed, 1);
    }

    #[test]
    fn held_events_stay_pending() {
        let backend = HostBackend::new(1);
        backend.init_streams(0, 1).unwrap();
        let stream = backend.stream(0, 0).unwrap();
        let event = backend.record_event(&stream).unwrap();
        backend.hold_completions(true);
        assert!(!backend.event_completed(&event));
        backend.hold_completions(false);
        assert!(backend.event_completed(&event));
    }

    #[test]
    fn stream_completes_in_record_order() {
        let backend = HostBackend::new(1);
        backend.init_streams(0, 2).unwrap();
        let s0 = backend.stream(0, 0).unwrap();
        let s1 = backend.stream(0, 1).unwrap();

        backend.set_completion_after(2);
        let slow = backend.record_event(&s0).unwrap();
        backend.set_completion_after(0);
        let behind = backend.record_event(&s0).unwrap();
        let other = backend.record_event(&s1).unwrap();

        assert!(!backend.event_completed(&behind));
        assert!(backend.event_completed(&other));
        assert!(!backend.event_completed(&slow));
        assert!(!backend.event_completed(&slow));
        assert!(!backend.event_completed(&behind));
        assert!(backend.event_completed(&slow));
        assert!(backend.event_completed(&slow));
        assert!(backend.event_completed(&behind));

        for event in [slow, behind, other] {
            backend.destroy_event(event);
        }
        assert_eq!(backend.stats().events_destroyed, 3);
    }

    #[test]
    fn held_stream_does_not_block_others() {
        let backend = HostBackend::new(1);
        backend.init_streams(0, 2).unwrap();
        let s0 = backend.stream(0, 0).unwrap();
        let s1 = backend.stream(0, 1).unwrap();
        let held = backend.record_event(&s0).unwrap();
        let free = backend.record_event(&s1).unwrap();

        backend.hold_stream(0, 0, true);
        assert!(!backend.event_completed(&held));
        assert!(backend.event_completed(&free));
        backend.hold_stream(0, 0, false);
        assert!(backend.event_completed(&held));
    }

    #[test]
    fn wedged_events_never_complete() {
        let backend = HostBackend::new(1).wedged();
        backend.init_streams(0, 1).unwrap();
        let stream = backend.stream(0, 0).unwrap();
        let event = backend.record_event(&stream).unwrap();
        for _ in 0..1000 {
            assert!(!backend.event_completed(&event));
        }
    }

    #[test]
    fn copy_moves_bytes() {
        let backend = HostBackend::new(1);
        backend.init_streams(0, 1).unwrap();
        let stream = backend.stream(0, 0).unwrap();
        let src = b"pinned page".to_vec();
        let mut dst = vec![0u8; src.len()];
        unsafe {
            backend
                .copy_h2d_async(
                    0,
                    DevicePtr::from(dst.as_mut_ptr()),
                    src.as_ptr(),
                    src.len(),
                    &stream,
                )
                .unwrap();
        }
        assert_eq!(dst, src);
        let stats = backend.stats();
        assert_eq!(stats.copies, 1);
        assert_eq!(stats.copied_bytes, src.len());
    }

    #[test]
    fn copy_budget_injects_failures() {
        let backend = HostBackend::new(1).fail_copies_after(1);
        backend.init_streams(0, 1).unwrap();
        let stream = backend.stream(0, 0).unwrap();
        let src = [1u8; 4];
        let mut dst = [0u8; 4];
        let dst_ptr = DevicePtr::from(dst.as_mut_ptr());
        unsafe {
            assert!(backend.copy_h2d_async(0, dst_ptr, src.as_ptr(), 4, &stream).is_ok());
            assert!(matches!(
                backend.copy_h2d_async(0, dst_ptr, src.as_ptr(), 4, &stream),
                Err(EngineError::Backend(_))
            ));
        }
        assert_eq!(backend.stats().copies, 1);
    }

    #[test]
    fn alloc_respects_limit_and_frees() {
        let backend = HostBackend::new(1).with_alloc_limit(1024);
        assert!(backend.alloc_pinned(0).is_none());
        assert!(backend.alloc_pinned(2048).is_none());
        let ptr = backend.alloc_pinned(512).unwrap();
        assert_eq!(ptr.as_ptr() as usize % PINNED_ALIGNMENT, 0);
        unsafe { backend.free_pinned(ptr, 512) };
        let stats = backend.stats();
        assert_eq!(stats.pinned_allocs, 1);
        assert_eq!(stats.pinned_frees, 1);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_detected() {
        let backend = HostBackend::new(1);
        let ptr = backend.alloc_pinned(64).unwrap();
        unsafe {
            backend.free_pinned(ptr, 64);
            backend.free_pinned(ptr, 64);
        }
    }
}
