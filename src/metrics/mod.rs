//! Connection, queue and forwarding statistics.
//!
//! This module provides:
//! - [`IngestStats`], the counter object the server owns and injects into the
//!   framer, queue and forwarder
//! - Prometheus export and an HTTP status server (feature `metrics`)

#[cfg(feature = "metrics")]
mod http_server;
#[cfg(feature = "metrics")]
mod prometheus_export;

#[cfg(feature = "metrics")]
pub use http_server::*;
#[cfg(feature = "metrics")]
pub use prometheus_export::*;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::server::SessionStatus;

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/health`, `/stats` and `/metrics`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// HTTP server bind address.
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
}

fn default_enabled() -> bool {
    true
}
fn default_http_bind() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            http_bind: default_http_bind(),
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    // Link
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_refused: AtomicU64,
    pub link_errors: AtomicU64,
    pub bytes_received: AtomicU64,

    // Framer
    pub frames_main: AtomicU64,
    pub frames_ignorable: AtomicU64,
    pub frames_extension: AtomicU64,
    pub acks_sent: AtomicU64,
    pub checksum_mismatches: AtomicU64,
    pub frames_refused: AtomicU64,

    // Decoder
    pub decode_errors: AtomicU64,
    pub records_decoded: AtomicU64,
    pub records_rejected: AtomicU64,

    // Queue
    pub queue_enqueued: AtomicU64,
    pub queue_processed: AtomicU64,
    pub queue_retried: AtomicU64,
    pub queue_failed: AtomicU64,
    pub queue_dropped: AtomicU64,

    // Forwarder
    pub forward_attempts: AtomicU64,
    pub forward_successes: AtomicU64,
    pub forward_failures: AtomicU64,
    pub forward_skips: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        Self::incr(&self.connections_total);
        Self::incr(&self.connections_active);
    }

    pub fn connection_closed(&self) {
        // Saturating: a stray close must not wrap the gauge
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_total: get(&self.connections_total),
            connections_active: get(&self.connections_active),
            connections_refused: get(&self.connections_refused),
            link_errors: get(&self.link_errors),
            bytes_received: get(&self.bytes_received),
            frames_main: get(&self.frames_main),
            frames_ignorable: get(&self.frames_ignorable),
            frames_extension: get(&self.frames_extension),
            acks_sent: get(&self.acks_sent),
            checksum_mismatches: get(&self.checksum_mismatches),
            frames_refused: get(&self.frames_refused),
            decode_errors: get(&self.decode_errors),
            records_decoded: get(&self.records_decoded),
            records_rejected: get(&self.records_rejected),
            queue_enqueued: get(&self.queue_enqueued),
            queue_processed: get(&self.queue_processed),
            queue_retried: get(&self.queue_retried),
            queue_failed: get(&self.queue_failed),
            queue_dropped: get(&self.queue_dropped),
            forward_attempts: get(&self.forward_attempts),
            forward_successes: get(&self.forward_successes),
            forward_failures: get(&self.forward_failures),
            forward_skips: get(&self.forward_skips),
        }
    }
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_refused: u64,
    pub link_errors: u64,
    pub bytes_received: u64,
    pub frames_main: u64,
    pub frames_ignorable: u64,
    pub frames_extension: u64,
    pub acks_sent: u64,
    pub checksum_mismatches: u64,
    pub frames_refused: u64,
    pub decode_errors: u64,
    pub records_decoded: u64,
    pub records_rejected: u64,
    pub queue_enqueued: u64,
    pub queue_processed: u64,
    pub queue_retried: u64,
    pub queue_failed: u64,
    pub queue_dropped: u64,
    pub forward_attempts: u64,
    pub forward_successes: u64,
    pub forward_failures: u64,
    pub forward_skips: u64,
}

impl StatsSnapshot {
    /// Monotonic counters by name, for export.
    pub fn counters(&self) -> [(&'static str, u64); 22] {
        [
            ("connections", self.connections_total),
            ("connections_refused", self.connections_refused),
            ("link_errors", self.link_errors),
            ("bytes_received", self.bytes_received),
            ("frames_main", self.frames_main),
            ("frames_ignorable", self.frames_ignorable),
            ("frames_extension", self.frames_extension),
            ("acks_sent", self.acks_sent),
            ("checksum_mismatches", self.checksum_mismatches),
            ("frames_refused", self.frames_refused),
            ("decode_errors", self.decode_errors),
            ("records_decoded", self.records_decoded),
            ("records_rejected", self.records_rejected),
            ("queue_enqueued", self.queue_enqueued),
            ("queue_processed", self.queue_processed),
            ("queue_retried", self.queue_retried),
            ("queue_failed", self.queue_failed),
            ("queue_dropped", self.queue_dropped),
            ("forward_attempts", self.forward_attempts),
            ("forward_successes", self.forward_successes),
            ("forward_failures", self.forward_failures),
            ("forward_skips", self.forward_skips),
        ]
    }
}

/// Live queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub accepting: bool,
}

/// Full status document served on `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_seconds: u64,
    pub counters: StatsSnapshot,
    pub queue: QueueStatus,
    pub sessions: Vec<SessionStatus>,
    pub forwarder_config_version: u64,
}
