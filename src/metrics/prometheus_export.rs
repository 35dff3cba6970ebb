//! Prometheus metrics export.
//!
//! Collectors are refreshed from a [`StatsSnapshot`] at scrape time.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use super::{QueueStatus, StatsSnapshot};

/// Prometheus registry and collectors.
pub struct PrometheusMetrics {
    registry: Registry,

    pub events_total: IntCounterVec,
    pub connections_active: IntGauge,
    pub sessions_active: IntGauge,
    pub queue_pending: IntGauge,
    pub queue_in_flight: IntGauge,
}

impl PrometheusMetrics {
    /// Create a new metrics instance with all collectors registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("gnss_relay_events_total", "Pipeline event counters"),
            &["kind"],
        )?;
        let connections_active = IntGauge::new(
            "gnss_relay_connections_active",
            "Number of open device connections",
        )?;
        let sessions_active = IntGauge::new(
            "gnss_relay_sessions_active",
            "Number of entries in the session table",
        )?;
        let queue_pending = IntGauge::new(
            "gnss_relay_queue_pending",
            "Items waiting in the ingestion queue",
        )?;
        let queue_in_flight = IntGauge::new(
            "gnss_relay_queue_in_flight",
            "Items currently being stored",
        )?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(queue_pending.clone()))?;
        registry.register(Box::new(queue_in_flight.clone()))?;

        Ok(Self {
            registry,
            events_total,
            connections_active,
            sessions_active,
            queue_pending,
            queue_in_flight,
        })
    }

    /// Bring collectors up to date with the given snapshot.
    pub fn update(&self, snapshot: &StatsSnapshot, queue: &QueueStatus, sessions: usize) {
        for (kind, value) in snapshot.counters() {
            let counter = self.events_total.with_label_values(&[kind]);
            let current = counter.get();
            if value > current {
                counter.inc_by(value - current);
            }
        }
        self.connections_active
            .set(snapshot.connections_active as i64);
        self.sessions_active.set(sessions as i64);
        self.queue_pending.set(queue.pending as i64);
        self.queue_in_flight.set(queue.in_flight as i64);
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
