//! Host-side memory handles crossing into the copy engine.
//!
//! - [`PinnedBuffer`]: engine-allocated pinned memory. Registered in the
//!   engine's live set on allocation and released through it exactly once, when
//!   the last owner (caller or in-flight copy) drops it.
//! - [`HostRegion`]: caller-managed memory described by pointer and length.
//!   The engine reads it but never frees it.
//! - [`DevicePtr`]: opaque device address, never dereferenced on the host.

use std::{collections::HashMap, fmt, ptr::NonNull, sync::Arc};

/// Raw device address of a copy destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    pub fn addr(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for DevicePtr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl<T> From<*mut T> for DevicePtr {
    fn from(ptr: *mut T) -> Self {
        Self::from_ptr(ptr as *const T)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Caller-owned host memory used as a copy source.
#[derive(Debug, Clone, Copy)]
pub struct HostRegion {
    ptr: *const u8,
    len: usize,
}

// SAFETY: HostRegion is only an address range. The constructor contract makes
// the caller responsible for keeping the memory valid until the copy completes.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

impl HostRegion {
    /// Describe `len` readable bytes at `ptr`.
    ///
    /// # Safety
    /// The region must stay readable and unmodified until every copy that
    /// reads it has been reported complete.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Describe a slice that outlives the program.
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Returns a pinned region to whoever allocated it.
pub(crate) trait ReleasePinned: Send + Sync {
    fn release(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Writable, fixed-length view over engine-allocated pinned memory.
///
/// Freed when dropped. Wrap it in an `Arc` to hand it to
/// [`crate::CopyEngine::submit`]; the in-flight copy then co-owns the region.
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    owner: Arc<dyn ReleasePinned>,
}

// SAFETY: the region is pinned host memory that is valid from any thread for
// the lifetime of this handle. Mutation requires `&mut self`.
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, owner: Arc<dyn ReleasePinned>) -> Self {
        Self { ptr, len, owner }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        self.owner.release(self.ptr, self.len);
    }
}

/// Addresses of engine-allocated pinned regions that have not been freed yet.
#[derive(Debug, Default)]
pub(crate) struct LiveBuffers {
    regions: HashMap<usize, usize>,
    total_bytes: usize,
}

impl LiveBuffers {
    /// Track a fresh allocation. Returns false if the address is already live.
    pub fn register(&mut self, ptr: NonNull<u8>, bytes: usize) -> bool {
        let addr = ptr.as_ptr() as usize;
        if self.regions.contains_key(&addr) {
            return false;
        }
        self.regions.insert(addr, bytes);
        self.total_bytes += bytes;
        true
    }

    /// Stop tracking a region. Only the caller that gets `Some` may free it.
    pub fn remove(&mut self, ptr: NonNull<u8>) -> Option<usize> {
        let bytes = self.regions.remove(&(ptr.as_ptr() as usize))?;
        self.total_bytes -= bytes;
        Some(bytes)
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.regions.contains_key(&(ptr as usize))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingOwner {
        released: AtomicUsize,
    }

    impl ReleasePinned for CountingOwner {
        fn release(&self, _ptr: NonNull<u8>, bytes: usize) {
            self.released.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    #[test]
    fn device_ptr_conversions() {
        assert!(DevicePtr::NULL.is_null());
        assert!(DevicePtr::from(0u64).is_null());
        let ptr = DevicePtr::from(0x7f00_0000_1000u64);
        assert_eq!(ptr.addr(), 0x7f00_0000_1000);
        assert_eq!(ptr.to_string(), "0x7f0000001000");

        let mut byte = 0u8;
        let raw: *mut u8 = &mut byte;
        assert_eq!(DevicePtr::from(raw).addr(), raw as usize as u64);
    }

    #[test]
    fn pinned_buffer_releases_once_on_drop() {
        let owner = Arc::new(CountingOwner::default());
        let mut backing = vec![0u8; 64];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();

        let mut buffer = PinnedBuffer::new(ptr, 64, owner.clone());
        buffer.as_mut_slice()[..4].copy_from_slice(b"page");
        assert_eq!(&buffer.as_slice()[..4], b"page");
        assert_eq!(buffer.len(), 64);

        let shared = Arc::new(buffer);
        let in_flight = Arc::clone(&shared);
        drop(shared);
        assert_eq!(owner.released.load(Ordering::SeqCst), 0);
        drop(in_flight);
        assert_eq!(owner.released.load(Ordering::SeqCst), 64);
        assert_eq!(&backing[..4], b"page");
    }

    #[test]
    fn live_buffers_track_single_ownership() {
        let mut live = LiveBuffers::default();
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        let pa = NonNull::new(a.as_mut_ptr()).unwrap();
        let pb = NonNull::new(b.as_mut_ptr()).unwrap();

        assert!(live.register(pa, 8));
        assert!(!live.register(pa, 8));
        assert!(live.register(pb, 4));
        assert_eq!(live.len(), 2);
        assert_eq!(live.total_bytes(), 12);
        assert!(live.contains(pa.as_ptr()));

        assert_eq!(live.remove(pa), Some(8));
        assert_eq!(live.remove(pa), None);
        assert_eq!(live.len(), 1);
        assert_eq!(live.total_bytes(), 4);
    }
}
