//! Prometheus metrics for the messaging layer
//!
//! Counters are labelled by topic and, where it applies, message type.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call once at startup; later calls are no-ops. Returns `false` when another
/// global recorder is already installed.
pub fn init_metrics() -> bool {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
        .is_ok()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Metric recorder for one messaging client
#[derive(Debug, Clone)]
pub struct MessagingMetrics {
    service: String,
}

impl MessagingMetrics {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn published(&self, topic: &str, message_type: &str) {
        counter!(
            "messaging_published_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string(),
            "type" => message_type.to_string()
        )
        .increment(1);
    }

    pub fn publish_failed(&self, topic: &str) {
        counter!(
            "messaging_publish_failures_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub fn received(&self, topic: &str) {
        counter!(
            "messaging_received_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub fn handled(&self, topic: &str, message_type: &str, duration: Duration) {
        counter!(
            "messaging_handled_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string(),
            "type" => message_type.to_string(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "messaging_handler_duration_seconds",
            "service" => self.service.clone(),
            "topic" => topic.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn handler_failed(&self, topic: &str, message_type: &str, duration: Duration) {
        counter!(
            "messaging_handled_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string(),
            "type" => message_type.to_string(),
            "status" => "failed"
        )
        .increment(1);

        histogram!(
            "messaging_handler_duration_seconds",
            "service" => self.service.clone(),
            "topic" => topic.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn retried(&self, message_type: &str) {
        counter!(
            "messaging_retried_total",
            "service" => self.service.clone(),
            "type" => message_type.to_string()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self, message_type: &str) {
        counter!(
            "messaging_dead_lettered_total",
            "service" => self.service.clone(),
            "type" => message_type.to_string()
        )
        .increment(1);
    }

    pub fn critical_persisted(&self, message_type: &str) {
        counter!(
            "messaging_critical_persisted_total",
            "service" => self.service.clone(),
            "type" => message_type.to_string()
        )
        .increment(1);
    }

    pub fn delayed(&self, topic: &str) {
        counter!(
            "messaging_delayed_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub fn filtered(&self, topic: &str, reason: &'static str) {
        counter!(
            "messaging_filtered_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn malformed(&self, topic: &str) {
        counter!(
            "messaging_malformed_total",
            "service" => self.service.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "messaging_in_flight_handlers",
            "service" => self.service.clone()
        )
        .set(count as f64);
    }
}
