//! Prometheus metrics for workflow streams
//!
//! Streams are per execution, so series are labelled by consumer group and
//! outcome only, never by stream name.

use crate::error::StreamError;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static HTTP_EXPORTER: OnceCell<SocketAddr> = OnceCell::new();

/// Install an in-process Prometheus recorder
///
/// Subsequent calls return the same handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, StreamError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| StreamError::Metrics(e.to_string()))?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Install a recorder that serves `/metrics` on `addr`
///
/// Must be called from within a Tokio runtime. Only the first call binds.
pub fn serve_metrics(addr: SocketAddr) -> Result<SocketAddr, StreamError> {
    HTTP_EXPORTER
        .get_or_try_init(|| {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| StreamError::Metrics(e.to_string()))?;
            info!(%addr, "Prometheus exporter listening");
            Ok(addr)
        })
        .copied()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Metric recording helpers bound to a consumer group
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    group: String,
}

impl StreamMetrics {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }

    pub fn events_published(&self, count: usize) {
        counter!("workflow_stream_events_published_total", "group" => self.group.clone())
            .increment(count as u64);
    }

    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "workflow_stream_messages_processed_total",
            "group" => self.group.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!("workflow_stream_handler_duration_seconds", "group" => self.group.clone())
            .record(duration.as_secs_f64());
    }

    /// `reason` is one of `handler`, `panic`, `invalid_event`
    pub fn message_failed(&self, reason: &'static str) {
        counter!(
            "workflow_stream_messages_processed_total",
            "group" => self.group.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "workflow_stream_message_errors_total",
            "group" => self.group.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn messages_claimed(&self, count: usize) {
        counter!("workflow_stream_messages_claimed_total", "group" => self.group.clone())
            .increment(count as u64);
    }

    pub fn message_dead_lettered(&self) {
        counter!("workflow_stream_messages_dlq_total", "group" => self.group.clone()).increment(1);
    }

    pub fn dead_letter_move_failed(&self) {
        counter!("workflow_stream_dlq_move_failures_total", "group" => self.group.clone())
            .increment(1);
    }

    pub fn dead_letter_reprocessed(&self) {
        counter!("workflow_stream_dlq_reprocessed_total", "group" => self.group.clone())
            .increment(1);
    }

    pub fn cycle_completed(&self, duration: Duration, had_errors: bool) {
        histogram!(
            "workflow_stream_cycle_duration_seconds",
            "group" => self.group.clone(),
            "errors" => if had_errors { "true" } else { "false" }
        )
        .record(duration.as_secs_f64());
    }
}
