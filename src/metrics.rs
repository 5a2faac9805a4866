use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Job lifecycle metrics
    pub static ref JOBS_SUBMITTED: IntCounter = IntCounter::new(
        "ocr_jobs_submitted_total",
        "Total number of images accepted for OCR"
    ).unwrap();

    pub static ref JOBS_COMPLETED: IntCounter = IntCounter::new(
        "ocr_jobs_completed_total",
        "Total number of images whose OCR completed"
    ).unwrap();

    pub static ref JOBS_FAILED: IntCounter = IntCounter::new(
        "ocr_jobs_failed_total",
        "Total number of images whose OCR failed or was abandoned"
    ).unwrap();

    pub static ref DUPLICATE_SUBMISSIONS: IntCounter = IntCounter::new(
        "ocr_duplicate_submissions_total",
        "Total number of rejected re-submissions of an already seen image"
    ).unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "ocr_queue_depth",
        "Number of images waiting for admission"
    ).unwrap();

    pub static ref JOB_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ocr_job_duration_seconds",
            "Time from admission to finalization in seconds"
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0])
    ).unwrap();

    // Region metrics
    pub static ref REGIONS_DETECTED: IntCounter = IntCounter::new(
        "ocr_regions_detected_total",
        "Total number of text regions reported by the backend"
    ).unwrap();

    pub static ref REGIONS_ERRORED: IntCounter = IntCounter::new(
        "ocr_regions_errored_total",
        "Total number of regions with malformed or failed recognition"
    ).unwrap();

    pub static ref EVENTS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("ocr_events_dropped_total", "Inbound events dropped by reason"),
        &["reason"]
    ).unwrap();

    // Outbound metrics
    pub static ref OUTBOUND_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("ocr_outbound_sent_total", "Outbound protocol messages sent by kind"),
        &["kind"]
    ).unwrap();

    pub static ref OUTBOUND_SEND_ERRORS: IntCounter = IntCounter::new(
        "ocr_outbound_send_errors_total",
        "Total number of failed outbound sends"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(JOBS_SUBMITTED.clone())).unwrap();
        REGISTRY.register(Box::new(JOBS_COMPLETED.clone())).unwrap();
        REGISTRY.register(Box::new(JOBS_FAILED.clone())).unwrap();
        REGISTRY.register(Box::new(DUPLICATE_SUBMISSIONS.clone())).unwrap();
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())).unwrap();
        REGISTRY.register(Box::new(JOB_DURATION.clone())).unwrap();

        REGISTRY.register(Box::new(REGIONS_DETECTED.clone())).unwrap();
        REGISTRY.register(Box::new(REGIONS_ERRORED.clone())).unwrap();
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())).unwrap();

        REGISTRY.register(Box::new(OUTBOUND_SENT.clone())).unwrap();
        REGISTRY.register(Box::new(OUTBOUND_SEND_ERRORS.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Count an inbound event that was dropped
pub fn record_dropped(reason: &str) {
    EVENTS_DROPPED.with_label_values(&[reason]).inc();
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_exports() {
        init_metrics();
        init_metrics();
        JOBS_SUBMITTED.inc();
        let text = export_metrics();
        assert!(text.contains("ocr_jobs_submitted_total"));
    }
}
