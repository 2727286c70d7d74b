//! Request and compaction metrics for Prometheus
//!
//! Tracks object operations, latencies, error rates and compaction passes.

use packstore_archive::PassReport;
use std::fmt::Write;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Object operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Head,
    Options,
    Put,
    Delete,
    List,
}

impl Operation {
    pub const ALL: [Self; 6] = [
        Self::Get,
        Self::Head,
        Self::Options,
        Self::Put,
        Self::Delete,
        Self::List,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Head => "head",
            Self::Options => "options",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::List => "list",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Per-operation metrics
#[derive(Debug, Default)]
struct OperationMetrics {
    requests_total: AtomicU64,
    /// 2xx and 3xx
    requests_success: AtomicU64,
    requests_client_error: AtomicU64,
    requests_server_error: AtomicU64,
    request_bytes_total: AtomicU64,
    response_bytes_total: AtomicU64,
    latency_sum_us: AtomicU64,
    /// Cumulative counts per `LATENCY_BUCKET_BOUNDARIES_MS` entry
    latency_buckets: [AtomicU64; 11],
}

const LATENCY_BUCKET_BOUNDARIES_MS: [u64; 11] =
    [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

impl OperationMetrics {
    fn record(&self, status_code: u16, request_bytes: u64, response_bytes: u64, latency_us: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        if (200..400).contains(&status_code) {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else if (400..500).contains(&status_code) {
            self.requests_client_error.fetch_add(1, Ordering::Relaxed);
        } else if status_code >= 500 {
            self.requests_server_error.fetch_add(1, Ordering::Relaxed);
        }

        self.request_bytes_total
            .fetch_add(request_bytes, Ordering::Relaxed);
        self.response_bytes_total
            .fetch_add(response_bytes, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let latency_ms = latency_us / 1000;
        for (i, &boundary) in LATENCY_BUCKET_BOUNDARIES_MS.iter().enumerate() {
            if latency_ms <= boundary {
                self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Default)]
struct CompactionMetrics {
    passes: AtomicU64,
    compacted: AtomicU64,
    stale: AtomicU64,
    skipped: AtomicU64,
    retrying: AtomicU64,
    dropped: AtomicU64,
}

/// Server metrics collector
#[derive(Debug)]
pub struct ServerMetrics {
    operations: [OperationMetrics; 6],
    compaction: CompactionMetrics,
    start_time: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: Default::default(),
            compaction: CompactionMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// Record a finished request
    pub fn record_operation(
        &self,
        op: Operation,
        status_code: u16,
        request_bytes: u64,
        response_bytes: u64,
        latency_us: u64,
    ) {
        self.operations[op.index()].record(status_code, request_bytes, response_bytes, latency_us);
    }

    /// Record the outcome of one compaction pass
    pub fn record_compaction_pass(&self, report: &PassReport) {
        let c = &self.compaction;
        c.passes.fetch_add(1, Ordering::Relaxed);
        c.compacted
            .fetch_add(report.compacted as u64, Ordering::Relaxed);
        c.stale.fetch_add(report.stale as u64, Ordering::Relaxed);
        c.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        c.retrying
            .fetch_add(report.retrying as u64, Ordering::Relaxed);
        c.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
    }

    /// Requests recorded for `op`
    #[must_use]
    pub fn requests(&self, op: Operation) -> u64 {
        self.operations[op.index()]
            .requests_total
            .load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(8 * 1024);

        let _ = writeln!(
            output,
            "# HELP packstore_uptime_seconds Server uptime in seconds"
        );
        let _ = writeln!(output, "# TYPE packstore_uptime_seconds counter");
        let _ = writeln!(
            output,
            "packstore_uptime_seconds {}",
            self.start_time.elapsed().as_secs()
        );

        let _ = writeln!(
            output,
            "# HELP packstore_requests_total Total requests by operation and status"
        );
        let _ = writeln!(output, "# TYPE packstore_requests_total counter");
        for op in Operation::ALL {
            let metrics = &self.operations[op.index()];
            for (status, counter) in [
                ("success", &metrics.requests_success),
                ("client_error", &metrics.requests_client_error),
                ("server_error", &metrics.requests_server_error),
            ] {
                let _ = writeln!(
                    output,
                    "packstore_requests_total{{operation=\"{}\",status=\"{}\"}} {}",
                    op.as_str(),
                    status,
                    counter.load(Ordering::Relaxed)
                );
            }
        }

        for (name, help, inbound) in [
            ("packstore_request_bytes_total", "Total request body bytes", true),
            ("packstore_response_bytes_total", "Total response body bytes", false),
        ] {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            for op in Operation::ALL {
                let metrics = &self.operations[op.index()];
                let counter = if inbound {
                    &metrics.request_bytes_total
                } else {
                    &metrics.response_bytes_total
                };
                let _ = writeln!(
                    output,
                    "{}{{operation=\"{}\"}} {}",
                    name,
                    op.as_str(),
                    counter.load(Ordering::Relaxed)
                );
            }
        }

        let _ = writeln!(
            output,
            "# HELP packstore_request_duration_seconds Request latency"
        );
        let _ = writeln!(output, "# TYPE packstore_request_duration_seconds histogram");
        for op in Operation::ALL {
            let metrics = &self.operations[op.index()];
            let total = metrics.requests_total.load(Ordering::Relaxed);
            if total == 0 {
                continue;
            }
            let name = op.as_str();
            for (i, &boundary) in LATENCY_BUCKET_BOUNDARIES_MS.iter().enumerate() {
                let _ = writeln!(
                    output,
                    "packstore_request_duration_seconds_bucket{{operation=\"{}\",le=\"{}\"}} {}",
                    name,
                    boundary as f64 / 1000.0,
                    metrics.latency_buckets[i].load(Ordering::Relaxed)
                );
            }
            let _ = writeln!(
                output,
                "packstore_request_duration_seconds_bucket{{operation=\"{name}\",le=\"+Inf\"}} {total}"
            );
            let _ = writeln!(
                output,
                "packstore_request_duration_seconds_sum{{operation=\"{}\"}} {}",
                name,
                metrics.latency_sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
            );
            let _ = writeln!(
                output,
                "packstore_request_duration_seconds_count{{operation=\"{name}\"}} {total}"
            );
        }

        let c = &self.compaction;
        let _ = writeln!(
            output,
            "# HELP packstore_compaction_passes_total Compaction scheduler passes"
        );
        let _ = writeln!(output, "# TYPE packstore_compaction_passes_total counter");
        let _ = writeln!(
            output,
            "packstore_compaction_passes_total {}",
            c.passes.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            output,
            "# HELP packstore_compaction_tasks_total Compaction tasks by outcome"
        );
        let _ = writeln!(output, "# TYPE packstore_compaction_tasks_total counter");
        for (outcome, counter) in [
            ("compacted", &c.compacted),
            ("stale", &c.stale),
            ("skipped", &c.skipped),
            ("retrying", &c.retrying),
            ("dropped", &c.dropped),
        ] {
            let _ = writeln!(
                output,
                "packstore_compaction_tasks_total{{outcome=\"{}\"}} {}",
                outcome,
                counter.load(Ordering::Relaxed)
            );
        }

        output
    }
}

static SERVER_METRICS: OnceLock<ServerMetrics> = OnceLock::new();

/// Get the global server metrics instance
pub fn server_metrics() -> &'static ServerMetrics {
    SERVER_METRICS.get_or_init(ServerMetrics::new)
}
