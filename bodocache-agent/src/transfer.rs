use std::{
    error::Error,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bodocache_core::{
    CopyBackend, CopyEngine, CopyOperation, CopySource, DevicePtr, RangeReader, ReaderConfig,
};
use bytesize::ByteSize;
use log::{debug, info};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// One staged transfer: a file range split into device pages.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub path: PathBuf,
    pub offset: u64,
    /// None reads to the end of the file.
    pub size: Option<u64>,
    pub page_size: usize,
    pub device: i32,
    pub deadline_ms: i64,
    pub reader: ReaderConfig,
    pub timeout: Duration,
}

impl TransferPlan {
    /// Bytes this plan stages, resolved against the file length.
    pub fn resolve_size(&self) -> Result<u64, BoxError> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let len = std::fs::metadata(&self.path)
            .map_err(|e| format!("failed to stat {}: {e}", self.path.display()))?
            .len();
        Ok(len.saturating_sub(self.offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes_read: u64,
    pub pages: usize,
    pub pages_completed: usize,
    pub bytes_completed: u64,
    pub read_time: Duration,
    pub copy_time: Duration,
}

fn gbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / secs / 1e9
}

impl TransferSummary {
    pub fn log(&self) {
        info!(
            "Transfer complete: read={} in {:.2}ms ({:.2} GB/s), copied {}/{} pages {} in {:.2}ms ({:.2} GB/s)",
            ByteSize::b(self.bytes_read),
            self.read_time.as_secs_f64() * 1000.0,
            gbps(self.bytes_read, self.read_time),
            self.pages_completed,
            self.pages,
            ByteSize::b(self.bytes_completed),
            self.copy_time.as_secs_f64() * 1000.0,
            gbps(self.bytes_completed, self.copy_time),
        );
    }
}

/// Read the planned range into engine pinned memory and copy it page by page
/// to `dst`.
///
/// # Safety
/// `dst` must be device memory of `plan.device` writable for
/// `plan.resolve_size()` bytes. If this returns with copies still
/// outstanding (see [`CopyEngine::outstanding`]), that memory must stay
/// untouched until they are delivered, or be leaked.
pub unsafe fn stage_and_copy<B: CopyBackend>(
    engine: &CopyEngine<B>,
    plan: &TransferPlan,
    dst: DevicePtr,
) -> Result<TransferSummary, BoxError> {
    if plan.page_size == 0 {
        return Err("page size must be greater than zero".into());
    }
    let size = usize::try_from(plan.resolve_size()?)?;
    if size == 0 {
        return Err(format!(
            "nothing to read: {} has no bytes past offset {}",
            plan.path.display(),
            plan.offset
        )
        .into());
    }

    let mut staging = engine.acquire_host_buffer(size)?;
    let reader = RangeReader::new(plan.reader.clone());
    let read_start = Instant::now();
    let bytes_read = reader.read_range(
        &plan.path,
        plan.offset,
        size as u64,
        staging.as_mut_slice(),
    )?;
    let read_time = read_start.elapsed();
    info!(
        "Staged {} of {} at offset {} in pinned memory",
        ByteSize::b(bytes_read),
        plan.path.display(),
        plan.offset
    );

    let staging = Arc::new(staging);
    let read = bytes_read as usize;
    let ops: Vec<CopyOperation> = (0..read)
        .step_by(plan.page_size)
        .enumerate()
        .map(|(page, start)| {
            CopyOperation::new(
                CopySource::pinned_at(Arc::clone(&staging), start),
                DevicePtr::new(dst.addr() + start as u64),
                plan.page_size.min(read - start),
            )
            .with_stream(page as i32)
            .on_device(plan.device)
            .with_deadline(plan.deadline_ms)
        })
        .collect();
    let pages = ops.len();
    drop(staging);

    let pages_completed = Arc::new(AtomicUsize::new(0));
    let bytes_completed = Arc::new(AtomicU64::new(0));
    let copy_start = Instant::now();
    {
        let pages_completed = Arc::clone(&pages_completed);
        let bytes_completed = Arc::clone(&bytes_completed);
        // SAFETY: pages tile [dst, dst + read), inside the range the caller
        // vouched for.
        unsafe {
            engine.submit(ops, move |completion| {
                pages_completed.fetch_add(1, Ordering::Relaxed);
                bytes_completed.fetch_add(completion.bytes as u64, Ordering::Relaxed);
                debug!(
                    "Page landed: gpu_id={} bytes={} deadline_ms={}",
                    completion.gpu_id, completion.bytes, completion.deadline_ms
                );
            })?;
        }
    }

    if !engine.wait_idle(plan.timeout) {
        return Err(format!(
            "timed out after {:?} with {} copies outstanding",
            plan.timeout,
            engine.outstanding()
        )
        .into());
    }

    Ok(TransferSummary {
        bytes_read,
        pages,
        pages_completed: pages_completed.load(Ordering::Relaxed),
        bytes_completed: bytes_completed.load(Ordering::Relaxed),
        read_time,
        copy_time: copy_start.elapsed(),
    })
}
