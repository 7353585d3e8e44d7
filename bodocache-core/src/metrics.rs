use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};
use std::sync::OnceLock;

pub(crate) struct CoreMetrics {
    pub copy_ops_submitted: Counter<u64>,
    pub copy_bytes_submitted: Counter<u64>,
    pub copy_submit_failures: Counter<u64>,
    pub copy_inflight: UpDownCounter<i64>,
    pub copy_completion_latency_ms: Histogram<f64>,
    pub callback_panics: Counter<u64>,

    pub pinned_live_bytes: UpDownCounter<i64>,
    pub pinned_alloc_failures: Counter<u64>,

    pub read_bytes: Counter<u64>,
    pub read_duration_ms: Histogram<f64>,
    pub read_throughput_gbps: Histogram<f64>,
    pub read_failures: Counter<u64>,
}

fn init_meter() -> Meter {
    global::meter("bodocache-core")
}

/// Storage read throughput buckets (0.25 to 16 GB/s, step 0.25)
fn read_throughput_boundaries() -> Vec<f64> {
    (1..=64).map(|i| i as f64 * 0.25).collect()
}

pub(crate) fn core_metrics() -> &'static CoreMetrics {
    static METRICS: OnceLock<CoreMetrics> = OnceLock::new();
    METRICS.get_or_init(|| {
        let meter = init_meter();

        CoreMetrics {
            copy_ops_submitted: meter
                .u64_counter("bodocache_copy_ops_submitted_total")
                .with_description("Host-to-device copies enqueued on a backend stream")
                .build(),
            copy_bytes_submitted: meter
                .u64_counter("bodocache_copy_bytes_submitted_total")
                .with_unit("bytes")
                .with_description("Bytes enqueued for host-to-device copy")
                .build(),
            copy_submit_failures: meter
                .u64_counter("bodocache_copy_submit_failures_total")
                .with_description("Batches rejected by validation or failed in the backend")
                .build(),
            copy_inflight: meter
                .i64_up_down_counter("bodocache_copy_inflight")
                .with_description("Copies enqueued but not yet observed complete")
                .build(),
            copy_completion_latency_ms: meter
                .f64_histogram("bodocache_copy_completion_latency_ms")
                .with_unit("ms")
                .with_description("Time from submission until the poller observed completion")
                .build(),
            callback_panics: meter
                .u64_counter("bodocache_callback_panics_total")
                .with_description("Completion callbacks that panicked and were isolated")
                .build(),

            pinned_live_bytes: meter
                .i64_up_down_counter("bodocache_pinned_live_bytes")
                .with_unit("bytes")
                .with_description("Engine-allocated pinned memory not yet released")
                .build(),
            pinned_alloc_failures: meter
                .u64_counter("bodocache_pinned_alloc_failures_total")
                .with_description("Pinned host allocations refused by the backend")
                .build(),

            read_bytes: meter
                .u64_counter("bodocache_read_bytes_total")
                .with_unit("bytes")
                .with_description("Bytes read from storage by the range reader")
                .build(),
            read_duration_ms: meter
                .f64_histogram("bodocache_read_duration_ms")
                .with_unit("ms")
                .with_description("Range read latency in milliseconds")
                .build(),
            read_throughput_gbps: meter
                .f64_histogram("bodocache_read_throughput_gbps")
                .with_unit("GB/s")
                .with_description("Range read throughput per call in GB/s")
                .with_boundaries(read_throughput_boundaries())
                .build(),
            read_failures: meter
                .u64_counter("bodocache_read_failures_total")
                .with_description("Range reads that failed to open, set up or complete")
                .build(),
        }
    })
}
