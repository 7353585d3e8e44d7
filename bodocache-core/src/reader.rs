//! Chunked io_uring reads of a file range into caller memory.

use std::{
    fmt,
    fs::File,
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use bytesize::ByteSize;
use io_uring::{IoUring, opcode, types::Fd};
use log::{debug, warn};
use tracing::instrument;

use crate::metrics::core_metrics;

pub const DEFAULT_QUEUE_DEPTH: u32 = 16;
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;
/// A single read completion reports its size as i32.
const MAX_CHUNK_SIZE: usize = 1 << 30;
/// user_data of cancel requests; read slots are indices below max_inflight.
const CANCEL_USER_DATA: u64 = u64::MAX;
/// Pause before reaping again after waiting on the ring failed.
const WAIT_RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Configuration for [`RangeReader`].
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Submission queue entries of the per-call ring.
    pub queue_depth: u32,
    pub chunk_size: usize,
    /// Chunks in flight at once. 1 submits a chunk and waits for it before
    /// the next; larger values pipeline, capped at `queue_depth`.
    pub max_inflight: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_inflight: 1,
        }
    }
}

impl ReaderConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    fn normalized(mut self) -> Self {
        self.queue_depth = self.queue_depth.max(1);
        self.chunk_size = self.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self.max_inflight = self.max_inflight.clamp(1, self.queue_depth as usize);
        self
    }
}

#[derive(Debug)]
pub enum ReadError {
    /// Output buffer is shorter than the requested range.
    BufferTooSmall { needed: u64, available: usize },
    Open { path: PathBuf, source: io::Error },
    RingInit(io::Error),
    /// A read completed with an error, or waiting for completions failed.
    /// `code` is the raw errno.
    Read { code: i32 },
    /// The submission queue refused an entry.
    Submit(io::Error),
}

impl ReadError {
    /// Raw OS error code, when there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ReadError::Read { code } => Some(*code),
            ReadError::Open { source, .. } => source.raw_os_error(),
            ReadError::RingInit(e) | ReadError::Submit(e) => e.raw_os_error(),
            ReadError::BufferTooSmall { .. } => None,
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::BufferTooSmall { needed, available } => write!(
                f,
                "output buffer too small: need {needed} bytes, have {available}"
            ),
            ReadError::Open { path, source } => {
                write!(f, "failed to open {}: {source}", path.display())
            }
            ReadError::RingInit(e) => write!(f, "failed to create io_uring: {e}"),
            ReadError::Read { code } => write!(
                f,
                "read failed: {}",
                io::Error::from_raw_os_error(*code)
            ),
            ReadError::Submit(e) => write!(f, "failed to submit read: {e}"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Open { source, .. } => Some(source),
            ReadError::RingInit(e) | ReadError::Submit(e) => Some(e),
            _ => None,
        }
    }
}

/// Part of the output still to be filled, relative to the range start.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    pos: usize,
    len: usize,
}

/// Reads file ranges with a ring created per call.
#[derive(Debug, Clone, Default)]
pub struct RangeReader {
    config: ReaderConfig,
}

impl RangeReader {
    pub fn new(config: ReaderConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Read `size` bytes at `offset` of `path` into the front of `out`.
    ///
    /// Returns the bytes read, which is less than `size` only when the file
    /// ends inside the range.
    #[instrument(
        level = "debug",
        skip(self, path, out),
        fields(path = %path.display())
    )]
    pub fn read_range(
        &self,
        path: &Path,
        offset: u64,
        size: u64,
        out: &mut [u8],
    ) -> Result<u64, ReadError> {
        let needed = match usize::try_from(size) {
            Ok(needed) if needed <= out.len() => needed,
            _ => {
                return Err(ReadError::BufferTooSmall {
                    needed: size,
                    available: out.len(),
                });
            }
        };
        if needed == 0 {
            return Ok(0);
        }

        let start = Instant::now();
        let result = self.read_into(path, offset, &mut out[..needed]);
        let metrics = core_metrics();
        match &result {
            Ok(read) => {
                let elapsed = start.elapsed();
                metrics.read_bytes.add(*read, &[]);
                metrics
                    .read_duration_ms
                    .record(elapsed.as_secs_f64() * 1000.0, &[]);
                let secs = elapsed.as_secs_f64();
                if secs > 0.0 {
                    metrics
                        .read_throughput_gbps
                        .record(*read as f64 / secs / 1e9, &[]);
                }
                debug!(
                    "Range read done: path={} offset={} read={} elapsed_us={}",
                    path.display(),
                    offset,
                    ByteSize::b(*read),
                    elapsed.as_micros()
                );
            }
            Err(e) => {
                metrics.read_failures.add(1, &[]);
                warn!(
                    "Range read failed: path={} offset={} size={} error={}",
                    path.display(),
                    offset,
                    size,
                    e
                );
            }
        }
        result
    }

    fn read_into(&self, path: &Path, offset: u64, out: &mut [u8]) -> Result<u64, ReadError> {
        let file = File::open(path).map_err(|source| ReadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        // Declared after `file` so the ring is torn down first.
        let mut ring = IoUring::new(self.config.queue_depth).map_err(ReadError::RingInit)?;
        self.drive(&mut ring, Fd(file.as_raw_fd()), offset, out, |ring| {
            ring.submit_and_wait(1)
        })
    }

    /// Fill `out` from `fd` at `offset` through `ring`. Returns only once no
    /// read into `out` is left in flight, even when waiting fails.
    fn drive<W>(
        &self,
        ring: &mut IoUring,
        fd: Fd,
        offset: u64,
        out: &mut [u8],
        mut wait: W,
    ) -> Result<u64, ReadError>
    where
        W: FnMut(&mut IoUring) -> io::Result<usize>,
    {
        let base = out.as_mut_ptr();
        let chunk_size = self.config.chunk_size;
        let mut slots: Vec<Option<Chunk>> = vec![None; self.config.max_inflight];
        let mut retry: Vec<Chunk> = Vec::new();
        let mut next_pos = 0usize;
        let mut inflight = 0usize;
        let mut total = 0u64;
        let mut eof = false;
        let mut cancelled = false;
        let mut error: Option<ReadError> = None;

        loop {
            while !eof && error.is_none() && inflight < slots.len() {
                let chunk = match retry.pop() {
                    Some(chunk) => chunk,
                    None if next_pos < out.len() => {
                        let len = chunk_size.min(out.len() - next_pos);
                        let chunk = Chunk { pos: next_pos, len };
                        next_pos += len;
                        chunk
                    }
                    None => break,
                };
                let Some(file_offset) = offset.checked_add(chunk.pos as u64) else {
                    error = Some(ReadError::Read { code: libc::EINVAL });
                    break;
                };
                let Some(slot) = slots.iter().position(Option::is_none) else {
                    retry.push(chunk);
                    break;
                };

                // SAFETY: pos + len <= out.len(), and `out` outlives the ring's
                // in-flight requests because this loop only exits at inflight == 0.
                let sqe = opcode::Read::new(fd, unsafe { base.add(chunk.pos) }, chunk.len as u32)
                    .offset(file_offset)
                    .build()
                    .user_data(slot as u64);
                // SAFETY: the entry's buffer stays valid until its completion is reaped.
                if let Err(e) = unsafe { ring.submission().push(&sqe) } {
                    error = Some(ReadError::Submit(io::Error::other(e.to_string())));
                    break;
                }
                slots[slot] = Some(chunk);
                inflight += 1;
            }

            if inflight == 0 {
                break;
            }

            if let Err(e) = wait(ring) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("io_uring submit_and_wait failed: {}, in_flight={}", e, inflight);
                if error.is_none() {
                    error = Some(ReadError::Read {
                        code: e.raw_os_error().unwrap_or(libc::EIO),
                    });
                }
                if !cancelled {
                    cancel_in_flight(ring, &slots);
                    cancelled = true;
                }
                // Completions land in the shared queue without a syscall.
                thread::sleep(WAIT_RETRY_BACKOFF);
            }

            let completions: Vec<(u64, i32)> = ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect();
            for (data, res) in completions {
                if data == CANCEL_USER_DATA {
                    continue;
                }
                let Some(chunk) = slots.get_mut(data as usize).and_then(Option::take) else {
                    warn!("io_uring completion for unknown slot {}, res={}", data, res);
                    continue;
                };
                inflight -= 1;

                if res < 0 {
                    if error.is_none() {
                        error = Some(ReadError::Read { code: -res });
                    }
                    continue;
                }
                if res == 0 {
                    eof = true;
                    continue;
                }

                let n = (res as usize).min(chunk.len);
                total += n as u64;
                if n < chunk.len {
                    retry.push(Chunk {
                        pos: chunk.pos + n,
                        len: chunk.len - n,
                    });
                }
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

/// Ask the kernel to cancel every read still in flight. Best effort: reads
/// that cannot be cancelled still complete and are reaped as usual.
fn cancel_in_flight(ring: &mut IoUring, slots: &[Option<Chunk>]) {
    for (slot, _) in slots.iter().enumerate().filter(|(_, chunk)| chunk.is_some()) {
        let sqe = opcode::AsyncCancel::new(slot as u64)
            .build()
            .user_data(CANCEL_USER_DATA);
        // SAFETY: a cancel entry references no memory.
        if unsafe { ring.submission().push(&sqe) }.is_err() {
            debug!("io_uring submission queue full, cancel of slot {} skipped", slot);
        }
    }
    if let Err(e) = ring.submit() {
        debug!("io_uring cancel submission failed: {}", e);
    }
}

/// Read a file range with the default configuration.
pub fn read_range(
    path: impl AsRef<Path>,
    offset: u64,
    size: u64,
    out: &mut [u8],
) -> Result<u64, ReadError> {
    RangeReader::default().read_range(path.as_ref(), offset, size, out)
}
