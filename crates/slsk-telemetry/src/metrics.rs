//! Prometheus-backed metrics for the transfer engine.
//!
//! # Design
//! - Collector registration stays private; callers get intent-named methods.
//! - Labels are limited to direction, status and reason to keep cardinality
//!   bounded (usernames and paths never become labels).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Metrics registry shared between the transfer worker and exporters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    transfers_started_total: IntCounterVec,
    transfers_finished_total: IntCounterVec,
    transfers_failed_total: IntCounterVec,
    transferred_bytes_total: IntCounterVec,
    upload_requests_denied_total: IntCounterVec,
    active_uploads: IntGauge,
    queued_uploads: IntGauge,
    active_downloads: IntGauge,
    store_save_latency_ms: IntGauge,
}

/// Point-in-time view of the gauges.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Uploads negotiating or sending.
    pub active_uploads: i64,
    /// Uploads waiting for a slot.
    pub queued_uploads: i64,
    /// Downloads negotiating or receiving.
    pub active_downloads: i64,
    /// Duration of the latest transfer list save (ms).
    pub store_save_latency_ms: i64,
}

impl Metrics {
    /// Construct a registry with every transfer collector registered.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let transfers_started_total = IntCounterVec::new(
            Opts::new("transfers_started_total", "Transfers that began moving bytes"),
            &["direction"],
        )?;
        let transfers_finished_total = IntCounterVec::new(
            Opts::new("transfers_finished_total", "Transfers completed successfully"),
            &["direction"],
        )?;
        let transfers_failed_total = IntCounterVec::new(
            Opts::new("transfers_failed_total", "Transfers that ended in a failure status"),
            &["direction", "status"],
        )?;
        let transferred_bytes_total = IntCounterVec::new(
            Opts::new("transferred_bytes_total", "Payload bytes moved"),
            &["direction"],
        )?;
        let upload_requests_denied_total = IntCounterVec::new(
            Opts::new(
                "upload_requests_denied_total",
                "Upload requests refused at admission",
            ),
            &["reason"],
        )?;
        let active_uploads =
            IntGauge::with_opts(Opts::new("active_uploads", "Uploads negotiating or sending"))?;
        let queued_uploads =
            IntGauge::with_opts(Opts::new("queued_uploads", "Uploads waiting for a slot"))?;
        let active_downloads = IntGauge::with_opts(Opts::new(
            "active_downloads",
            "Downloads negotiating or receiving",
        ))?;
        let store_save_latency_ms = IntGauge::with_opts(Opts::new(
            "transfer_store_save_latency_ms",
            "Time taken by the latest transfer list save (ms)",
        ))?;

        registry.register(Box::new(transfers_started_total.clone()))?;
        registry.register(Box::new(transfers_finished_total.clone()))?;
        registry.register(Box::new(transfers_failed_total.clone()))?;
        registry.register(Box::new(transferred_bytes_total.clone()))?;
        registry.register(Box::new(upload_requests_denied_total.clone()))?;
        registry.register(Box::new(active_uploads.clone()))?;
        registry.register(Box::new(queued_uploads.clone()))?;
        registry.register(Box::new(active_downloads.clone()))?;
        registry.register(Box::new(store_save_latency_ms.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                transfers_started_total,
                transfers_finished_total,
                transfers_failed_total,
                transferred_bytes_total,
                upload_requests_denied_total,
                active_uploads,
                queued_uploads,
                active_downloads,
                store_save_latency_ms,
            }),
        })
    }

    /// Count a transfer that started moving bytes.
    pub fn inc_transfer_started(&self, direction: &str) {
        self.inner
            .transfers_started_total
            .with_label_values(&[direction])
            .inc();
    }

    /// Count a successful transfer.
    pub fn inc_transfer_finished(&self, direction: &str) {
        self.inner
            .transfers_finished_total
            .with_label_values(&[direction])
            .inc();
    }

    /// Count a transfer that ended in `status`.
    pub fn inc_transfer_failed(&self, direction: &str, status: &str) {
        self.inner
            .transfers_failed_total
            .with_label_values(&[direction, status])
            .inc();
    }

    /// Add payload bytes moved in `direction`.
    pub fn add_transferred_bytes(&self, direction: &str, bytes: u64) {
        self.inner
            .transferred_bytes_total
            .with_label_values(&[direction])
            .inc_by(bytes);
    }

    /// Count an upload request refused with `reason`.
    pub fn inc_upload_denied(&self, reason: &str) {
        self.inner
            .upload_requests_denied_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Publish the upload gauges.
    pub fn set_upload_gauges(&self, active: usize, queued: usize) {
        self.inner.active_uploads.set(saturating_i64(active));
        self.inner.queued_uploads.set(saturating_i64(queued));
    }

    /// Publish the download gauge.
    pub fn set_active_downloads(&self, active: usize) {
        self.inner.active_downloads.set(saturating_i64(active));
    }

    /// Record how long the latest save took.
    pub fn observe_store_save(&self, duration: Duration) {
        self.inner
            .store_save_latency_ms
            .set(Self::duration_to_ms(duration));
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or produces invalid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .context("failed to encode Prometheus metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }

    /// Snapshot the gauges.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_uploads: self.inner.active_uploads.get(),
            queued_uploads: self.inner.queued_uploads.get(),
            active_downloads: self.inner.active_downloads.get(),
            store_save_latency_ms: self.inner.store_save_latency_ms.get(),
        }
    }

    pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
