mod transfer;
mod utils;

use std::path::PathBuf;
use std::time::Duration;

use bodocache_core::{
    CallbackPolicy, CopyEngine, DevicePtr, EngineConfig, HostBackend, ReaderConfig, logging,
};
use bytesize::ByteSize;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;

use transfer::{BoxError, TransferPlan, TransferSummary, stage_and_copy};
use utils::{parse_memory_size, parse_size};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Host memory stands in for the device
    Host,
    /// CUDA driver (requires the `cuda` build feature)
    Cuda,
}

#[derive(Parser, Debug)]
#[command(
    name = "bodocache-agent",
    about = "Stage a file range in pinned memory and copy it to a device page by page"
)]
struct Cli {
    /// File to read
    #[arg(long)]
    file: PathBuf,

    /// Byte offset into the file (supports units: kb, mb, gb, tb)
    #[arg(long, default_value = "0", value_parser = parse_size)]
    offset: u64,

    /// Bytes to stage; defaults to the rest of the file
    #[arg(long, value_parser = parse_size)]
    size: Option<u64>,

    /// Size of each device page copy
    #[arg(long, default_value = "64kb", value_parser = parse_memory_size)]
    page_size: usize,

    #[arg(long, value_enum, default_value_t = Backend::Host)]
    backend: Backend,

    /// Device to copy to
    #[arg(long, default_value_t = 0)]
    device: i32,

    /// Streams per device; pages are spread round-robin over them
    #[arg(long, default_value_t = bodocache_core::DEFAULT_STREAMS_PER_DEVICE)]
    streams: usize,

    /// Completion poll interval in microseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_us: u64,

    /// Deliver every page to its own batch's callback
    #[arg(long)]
    per_batch_callbacks: bool,

    /// Advisory deadline attached to every page
    #[arg(long, default_value_t = 0)]
    deadline_ms: i64,

    /// Read chunk size
    #[arg(long, default_value = "1mb", value_parser = parse_memory_size)]
    chunk_size: usize,

    /// io_uring submission queue depth
    #[arg(long, default_value_t = bodocache_core::reader::DEFAULT_QUEUE_DEPTH)]
    queue_depth: u32,

    /// Read chunks kept in flight at once
    #[arg(long, default_value_t = 1)]
    max_inflight: usize,

    /// Give up waiting for copies after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log filter, e.g. "info" or "info,bodocache_core=debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable OTLP metrics export over gRPC (e.g. http://127.0.0.1:4317). Leave unset to disable.
    #[arg(long)]
    metrics_otel_endpoint: Option<String>,

    /// Period (seconds) for exporting OTLP metrics (only used when endpoint is set).
    #[arg(long, default_value_t = 5)]
    metrics_period_secs: u64,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let policy = if self.per_batch_callbacks {
            CallbackPolicy::PerBatch
        } else {
            CallbackPolicy::LatestWins
        };
        EngineConfig::for_device(self.device)
            .with_streams_per_device(self.streams)
            .with_poll_interval(Duration::from_micros(self.poll_interval_us))
            .with_callback_policy(policy)
    }

    fn plan(&self) -> TransferPlan {
        TransferPlan {
            path: self.file.clone(),
            offset: self.offset,
            size: self.size,
            page_size: self.page_size,
            device: self.device,
            deadline_ms: self.deadline_ms,
            reader: ReaderConfig::default()
                .with_chunk_size(self.chunk_size)
                .with_queue_depth(self.queue_depth)
                .with_max_inflight(self.max_inflight),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn init_metrics(
    endpoint: Option<String>,
    period_secs: u64,
) -> Result<Option<SdkMeterProvider>, BoxError> {
    let Some(endpoint) = endpoint else {
        info!("OTLP metrics disabled (no endpoint configured)");
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(period_secs))
        .build();

    let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();

    global::set_meter_provider(meter_provider.clone());
    info!("OTLP metrics exporter enabled (period={}s)", period_secs);

    Ok(Some(meter_provider))
}

fn run_host(cli: &Cli, plan: &TransferPlan) -> Result<TransferSummary, BoxError> {
    let size = usize::try_from(plan.resolve_size()?)?;
    let engine = CopyEngine::new(HostBackend::new(cli.device + 1), cli.engine_config())?;
    let mut device_mem = vec![0u8; size];
    let dst = DevicePtr::from(device_mem.as_mut_ptr());
    info!(
        "Host backend: device memory {} at {}",
        ByteSize::b(size as u64),
        dst
    );
    // SAFETY: device_mem holds `size` bytes and is leaked below if copies
    // are still outstanding.
    let summary = unsafe { stage_and_copy(&engine, plan, dst) };
    if engine.outstanding() > 0 {
        warn!("Copies still in flight; leaking host device memory");
        std::mem::forget(device_mem);
    }
    summary
}

#[cfg(feature = "cuda")]
fn run_cuda(cli: &Cli, plan: &TransferPlan) -> Result<TransferSummary, BoxError> {
    use bodocache_core::CudaBackend;
    use cudarc::driver::sys;

    let size = usize::try_from(plan.resolve_size()?)?;
    let engine = CopyEngine::new(CudaBackend::new(), cli.engine_config())?;
    let ctx = engine
        .backend()
        .context(cli.device)
        .ok_or_else(|| format!("no CUDA context for device {}", cli.device))?;
    ctx.bind_to_thread()
        .map_err(|e| format!("failed to bind CUDA context: {e:?}"))?;

    let mut device_mem: sys::CUdeviceptr = 0;
    let result = unsafe { sys::cuMemAlloc_v2(&mut device_mem, size) };
    if result != sys::cudaError_enum::CUDA_SUCCESS {
        return Err(format!("cuMemAlloc failed for {}: {result:?}", ByteSize::b(size as u64)).into());
    }
    info!(
        "CUDA device {}: scratch memory {} at {:#x}",
        cli.device,
        ByteSize::b(size as u64),
        device_mem
    );

    // SAFETY: device_mem is a `size`-byte allocation on this device, freed
    // below only once no copy is outstanding.
    let summary = unsafe { stage_and_copy(&engine, plan, DevicePtr::new(device_mem)) };
    if engine.outstanding() == 0 {
        if let Err(e) = ctx.bind_to_thread() {
            warn!("Failed to bind CUDA context before cuMemFree: {:?}", e);
        }
        let result = unsafe { sys::cuMemFree_v2(device_mem) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            warn!("cuMemFree failed: {:?}", result);
        }
    } else {
        warn!("Copies still in flight; leaking device scratch memory");
    }
    summary
}

#[cfg(not(feature = "cuda"))]
fn run_cuda(_cli: &Cli, _plan: &TransferPlan) -> Result<TransferSummary, BoxError> {
    Err("bodocache-agent was built without the `cuda` feature".into())
}

fn run(cli: &Cli) -> Result<TransferSummary, BoxError> {
    let plan = cli.plan();
    info!(
        "Staging {} from offset {} in {} pages on {:?} device {}",
        plan.path.display(),
        plan.offset,
        ByteSize::b(cli.page_size as u64),
        cli.backend,
        cli.device
    );
    match cli.backend {
        Backend::Host => run_host(cli, &plan),
        Backend::Cuda => run_cuda(cli, &plan),
    }
}

/// Run blocking `work` until it finishes or `interrupt` resolves. An
/// interrupted task keeps running; the caller must not wait for it.
async fn until_interrupted<T, W, I>(work: W, interrupt: I) -> Result<T, BoxError>
where
    T: Send + 'static,
    W: FnOnce() -> Result<T, BoxError> + Send + 'static,
    I: Future,
{
    let work = tokio::task::spawn_blocking(work);
    tokio::select! {
        joined = work => match joined {
            Ok(result) => result,
            Err(err) => Err(format!("transfer task failed: {err}").into()),
        },
        _ = interrupt => {
            warn!("Interrupted, exiting without waiting for the transfer");
            Err("interrupted".into())
        }
    }
}

fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    logging::init_stdout_colored(&cli.log_level);

    // OTLP export needs a Tokio runtime; the transfer itself is blocking.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let metrics_endpoint = cli.metrics_otel_endpoint.clone();
    let metrics_period = cli.metrics_period_secs;

    let result = runtime.block_on(async move {
        let meter_provider = init_metrics(metrics_endpoint, metrics_period)?;

        let outcome = until_interrupted(move || run(&cli), tokio::signal::ctrl_c()).await;

        match &outcome {
            Ok(summary) => summary.log(),
            Err(err) => error!("Transfer failed: {err}"),
        }

        // Flush metrics before exit
        if let Some(provider) = meter_provider {
            if let Err(err) = provider.shutdown() {
                error!("Failed to shutdown metrics provider: {err}");
            }
        }

        outcome.map(|_| ())
    });

    // Dropping the runtime would block on an interrupted transfer thread.
    runtime.shutdown_background();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn finished_work_returns_its_result() {
        let runtime = runtime();
        let result = runtime.block_on(until_interrupted(|| Ok(7), std::future::pending::<()>()));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn interrupt_returns_without_waiting_for_work() {
        let runtime = runtime();
        let (release, blocked) = mpsc::channel::<()>();
        let start = Instant::now();

        let result = runtime.block_on(until_interrupted(
            move || {
                let _ = blocked.recv_timeout(Duration::from_secs(30));
                Ok(())
            },
            std::future::ready(()),
        ));
        assert_eq!(result.unwrap_err().to_string(), "interrupted");
        runtime.shutdown_background();
        assert!(start.elapsed() < Duration::from_secs(10));
        drop(release);
    }
}
