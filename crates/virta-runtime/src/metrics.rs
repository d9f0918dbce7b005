//! Prometheus metrics for Virta

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics collection for the splittable-work runtime
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub work_items_total: CounterVec,
    pub invocations_total: CounterVec,
    pub outputs_total: CounterVec,
    pub timers_fired_total: CounterVec,
    pub pending_timers: GaugeVec,
    pub output_watermark_ms: GaugeVec,
    pub invocation_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let work_items_total = CounterVec::new(
            Opts::new("virta_work_items_total", "Keyed work items processed"),
            &["step"],
        )
        .expect("failed to create work_items_total counter");

        let invocations_total = CounterVec::new(
            Opts::new(
                "virta_invocations_total",
                "Restriction invocations by outcome",
            ),
            &["step", "outcome"],
        )
        .expect("failed to create invocations_total counter");

        let outputs_total = CounterVec::new(
            Opts::new("virta_outputs_total", "Output records emitted"),
            &["step"],
        )
        .expect("failed to create outputs_total counter");

        let timers_fired_total = CounterVec::new(
            Opts::new("virta_timers_fired_total", "Timers fired by domain"),
            &["step", "domain"],
        )
        .expect("failed to create timers_fired_total counter");

        let pending_timers = GaugeVec::new(
            Opts::new("virta_pending_timers", "Timers currently pending"),
            &["step"],
        )
        .expect("failed to create pending_timers gauge");

        let output_watermark_ms = GaugeVec::new(
            Opts::new(
                "virta_output_watermark_ms",
                "Output watermark in epoch milliseconds",
            ),
            &["step"],
        )
        .expect("failed to create output_watermark_ms gauge");

        let invocation_duration = HistogramVec::new(
            HistogramOpts::new(
                "virta_invocation_duration_seconds",
                "Restriction invocation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["step"],
        )
        .expect("failed to create invocation_duration histogram");

        registry
            .register(Box::new(work_items_total.clone()))
            .expect("failed to register work_items_total");
        registry
            .register(Box::new(invocations_total.clone()))
            .expect("failed to register invocations_total");
        registry
            .register(Box::new(outputs_total.clone()))
            .expect("failed to register outputs_total");
        registry
            .register(Box::new(timers_fired_total.clone()))
            .expect("failed to register timers_fired_total");
        registry
            .register(Box::new(pending_timers.clone()))
            .expect("failed to register pending_timers");
        registry
            .register(Box::new(output_watermark_ms.clone()))
            .expect("failed to register output_watermark_ms");
        registry
            .register(Box::new(invocation_duration.clone()))
            .expect("failed to register invocation_duration");

        Self {
            registry: Arc::new(registry),
            work_items_total,
            invocations_total,
            outputs_total,
            timers_fired_total,
            pending_timers,
            output_watermark_ms,
            invocation_duration,
        }
    }

    pub fn record_work_item(&self, step: &str) {
        self.work_items_total.with_label_values(&[step]).inc();
    }

    pub fn record_invocation(&self, step: &str, outcome: &str, outputs: usize, secs: f64) {
        self.invocations_total
            .with_label_values(&[step, outcome])
            .inc();
        self.outputs_total
            .with_label_values(&[step])
            .inc_by(outputs as f64);
        self.invocation_duration
            .with_label_values(&[step])
            .observe(secs);
    }

    pub fn record_timer_fired(&self, step: &str, domain: &str) {
        self.timers_fired_total
            .with_label_values(&[step, domain])
            .inc();
    }

    pub fn set_pending_timers(&self, step: &str, count: usize) {
        self.pending_timers
            .with_label_values(&[step])
            .set(count as f64);
    }

    pub fn set_output_watermark(&self, step: &str, watermark_ms: i64) {
        self.output_watermark_ms
            .with_label_values(&[step])
            .set(watermark_ms as f64);
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer {
    metrics: Metrics,
    addr: String,
}

impl MetricsServer {
    pub fn new(metrics: Metrics, addr: impl Into<String>) -> Self {
        Self {
            metrics,
            addr: addr.into(),
        }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (mut socket, _addr) = listener.accept().await?;

            let metrics_output = self.metrics.gather();

            // Simple HTTP response
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            if let Err(e) = socket.write_all(response.as_bytes()).await {
                error!("Failed to write response: {}", e);
            }
        }
    }
}
