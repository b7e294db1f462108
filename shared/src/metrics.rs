//! Metrics capability injected into components instead of process-wide
//! metric singletons. `MetricsRecorder` forwards to whatever recorder is
//! installed for the `metrics` facade; exposition is up to the binary.

use std::time::Duration;

use crate::consumer::Disposition;

pub trait MetricsSink: Send + Sync {
    fn delivery_settled(&self, event_type: &str, disposition: Disposition);

    fn handler_latency(&self, event_type: &str, elapsed: Duration);

    fn event_published(&self, event_type: &str, success: bool);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn delivery_settled(&self, _event_type: &str, _disposition: Disposition) {}

    fn handler_latency(&self, _event_type: &str, _elapsed: Duration) {}

    fn event_published(&self, _event_type: &str, _success: bool) {}
}

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    service: &'static str,
}

impl MetricsRecorder {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

impl MetricsSink for MetricsRecorder {
    fn delivery_settled(&self, event_type: &str, disposition: Disposition) {
        metrics::counter!(
            "order_pipeline_deliveries_total",
            "service" => self.service,
            "event_type" => event_type.to_string(),
            "disposition" => disposition.as_str()
        )
        .increment(1);
    }

    fn handler_latency(&self, event_type: &str, elapsed: Duration) {
        metrics::histogram!(
            "order_pipeline_handler_seconds",
            "service" => self.service,
            "event_type" => event_type.to_string()
        )
        .record(elapsed.as_secs_f64());
    }

    fn event_published(&self, event_type: &str, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        metrics::counter!(
            "order_pipeline_events_published_total",
            "service" => self.service,
            "event_type" => event_type.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}
