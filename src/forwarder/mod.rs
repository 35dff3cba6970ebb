//! Outbound forwarder to the partner gateway.
//!
//! Two delivery paths share [`Forwarder::deliver`]:
//! - real-time, driven by "record stored" events
//! - catch-up, driven by [`ForwardScheduler`] over records storage still has
//!   flagged as not forwarded
//!
//! Both mark a record forwarded once its attempt completes, whatever the
//! outcome. Every attempt is written to the [`ForwardLog`].
//!
//! While real-time delivery is on, catch-up defers records received less
//! than one interval ago so the two paths do not send the same record.

mod client;
mod command;
mod config;
mod log;
mod scheduler;

pub use client::{GatewayClient, GatewayResponse, HttpGatewayClient};
pub use command::{knots, DegreesMinutes, FrcmdCommand, COMMAND_PARAM, KNOTS_PER_KMH};
pub use config::{
    ConfigSnapshot, FileConfigStore, ForwarderConfig, ForwarderConfigHandle,
    ForwarderConfigStore,
};
pub use log::{ForwardLog, ForwardLogEntry, ForwardOutcome, JsonlForwardLog, MemoryForwardLog};
pub use scheduler::ForwardScheduler;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{ForwardError, Result};
use crate::events::Event;
use crate::metrics::IngestStats;
use crate::protocol::TelemetryRecord;
use crate::storage::{Storage, StoredRecord};
use crate::types::RecordId;

/// Totals for one catch-up cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub selected: usize,
    /// Left for the real-time path.
    pub deferred: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl CycleReport {
    fn count(&mut self, outcome: ForwardOutcome) {
        match outcome {
            ForwardOutcome::Skip => self.skipped += 1,
            ForwardOutcome::Success => self.succeeded += 1,
            ForwardOutcome::Failure | ForwardOutcome::Attempt => self.failed += 1,
        }
    }
}

pub struct Forwarder {
    config: ForwarderConfigHandle,
    storage: Arc<dyn Storage>,
    client: Arc<dyn GatewayClient>,
    log: Arc<dyn ForwardLog>,
    stats: Arc<IngestStats>,
}

impl Forwarder {
    pub fn new(
        config: ForwarderConfigHandle,
        storage: Arc<dyn Storage>,
        client: Arc<dyn GatewayClient>,
        log: Arc<dyn ForwardLog>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            config,
            storage,
            client,
            log,
            stats,
        }
    }

    pub fn config(&self) -> &ForwarderConfigHandle {
        &self.config
    }

    /// Translate and send one record. Never marks it forwarded.
    ///
    /// Records missing identity or coordinates are skipped without a request.
    pub async fn forward_record(
        &self,
        id: Option<RecordId>,
        record: &TelemetryRecord,
        config: &ForwarderConfig,
    ) -> ForwardOutcome {
        let identity = record.identity.clone();

        let command = match FrcmdCommand::from_record(
            record,
            &config.identity_suffix,
            config.speed_precision,
        ) {
            Ok(command) => command,
            Err(e) => {
                IngestStats::incr(&self.stats.forward_skips);
                info!(record = ?id, identity = ?identity, reason = %e, "Skipping forward");
                self.audit(
                    ForwardLogEntry::new(id, identity, ForwardOutcome::Skip)
                        .with_reason(e.to_string()),
                )
                .await;
                return ForwardOutcome::Skip;
            }
        };
        let text = command.to_string();

        IngestStats::incr(&self.stats.forward_attempts);
        self.audit(
            ForwardLogEntry::new(id, identity.clone(), ForwardOutcome::Attempt)
                .with_command(text.clone()),
        )
        .await;

        let sent = match command.to_url(&config.target_url) {
            Ok(url) => self.client.send(&url, config.request_timeout).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(response) => {
                IngestStats::incr(&self.stats.forward_successes);
                debug!(record = ?id, identity = ?identity, status = response.status, "Forwarded");
                self.audit(
                    ForwardLogEntry::new(id, identity, ForwardOutcome::Success).with_command(text),
                )
                .await;
                ForwardOutcome::Success
            }
            Err(e) => {
                IngestStats::incr(&self.stats.forward_failures);
                warn!(record = ?id, identity = ?identity, error = %e, "Forward failed");
                self.audit(
                    ForwardLogEntry::new(id, identity, ForwardOutcome::Failure)
                        .with_reason(e.to_string())
                        .with_command(text),
                )
                .await;
                ForwardOutcome::Failure
            }
        }
    }

    /// Forward a stored record, then flag it forwarded regardless of outcome.
    pub async fn deliver(&self, stored: &StoredRecord, config: &ForwarderConfig) -> ForwardOutcome {
        let outcome = self.forward_record(Some(stored.id), &stored.record, config).await;
        if let Err(e) = self.storage.mark_forwarded(stored.id).await {
            warn!(record = %stored.id, error = %e, "Failed to mark record forwarded");
        }
        outcome
    }

    /// One catch-up cycle over up to `batch_size` unforwarded records.
    pub async fn run_catch_up(&self, config: &ForwarderConfig) -> Result<CycleReport> {
        let mut records = self
            .storage
            .query_unforwarded(config.batch_size, config.filter())
            .await?;

        let queried = records.len();
        if config.realtime {
            let cutoff = chrono::Duration::from_std(config.interval)
                .ok()
                .and_then(|interval| Utc::now().checked_sub_signed(interval));
            if let Some(cutoff) = cutoff {
                records.retain(|s| s.record.received_at.map_or(true, |at| at <= cutoff));
            }
        }

        let mut report = CycleReport {
            selected: records.len(),
            deferred: queried - records.len(),
            ..Default::default()
        };
        for stored in &records {
            let outcome = self.deliver(stored, config).await;
            report.count(outcome);
        }

        if report.selected > 0 || report.deferred > 0 {
            info!(
                selected = report.selected,
                deferred = report.deferred,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "Catch-up cycle finished"
            );
        }
        Ok(report)
    }

    /// Real-time path: forward each stored record as its event arrives.
    pub async fn run_realtime(
        self: Arc<Self>,
        mut events: broadcast::Receiver<Event>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        debug!("Real-time forwarder started");
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.recv() => break,
            };

            match event {
                Ok(Event::RecordStored { id, record }) => {
                    let snapshot = self.config.current();
                    let config = &snapshot.config;
                    if !(config.enabled && config.realtime) {
                        continue;
                    }
                    if !config.allows(record.identity.as_ref()) {
                        continue;
                    }
                    let stored = StoredRecord {
                        id,
                        record: (*record).clone(),
                    };
                    self.deliver(&stored, config).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Missed records stay unforwarded for the catch-up path
                    warn!(missed = n, "Real-time forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Real-time forwarder stopped");
    }

    async fn audit(&self, entry: ForwardLogEntry) {
        if let Err(e) = self.log.append(&entry).await {
            warn!(error = %e, outcome = %entry.outcome, "Failed to write forward log");
        }
    }
}

/// Mock gateway used by tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::Url;
    use std::time::Duration;

    #[derive(Default)]
    pub struct RecordingClient {
        pub urls: Mutex<Vec<Url>>,
        pub fail_with: Option<u16>,
    }

    #[async_trait]
    impl GatewayClient for RecordingClient {
        async fn send(&self, url: &Url, _: Duration) -> std::result::Result<GatewayResponse, ForwardError> {
            self.urls.lock().push(url.clone());
            match self.fail_with {
                Some(status) => Err(ForwardError::Status(status)),
                None => Ok(GatewayResponse {
                    status: 200,
                    body: "OK".into(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingClient;
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{DeviceIdentity, Position};

    fn config() -> ForwarderConfig {
        ForwarderConfig {
            enabled: true,
            target_url: "http://gateway.local/api".into(),
            ..Default::default()
        }
    }

    fn located(identity: &str) -> TelemetryRecord {
        TelemetryRecord {
            identity: Some(DeviceIdentity::new(identity)),
            position: Some(Position::new(55.75, 37.61)),
            ..Default::default()
        }
    }

    struct Fixture {
        forwarder: Forwarder,
        storage: Arc<MemoryStorage>,
        client: Arc<RecordingClient>,
        log: Arc<MemoryForwardLog>,
    }

    fn fixture(client: RecordingClient) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(client);
        let log = Arc::new(MemoryForwardLog::new());
        let forwarder = Forwarder::new(
            ForwarderConfigHandle::new(config()),
            storage.clone(),
            client.clone(),
            log.clone(),
            Arc::new(IngestStats::new()),
        );
        Fixture {
            forwarder,
            storage,
            client,
            log,
        }
    }

    #[tokio::test]
    async fn test_missing_latitude_skips_without_request() {
        let f = fixture(RecordingClient::default());
        let mut record = located("dev1");
        record.position = None;

        let outcome = f.forwarder.forward_record(None, &record, &config()).await;

        assert_eq!(outcome, ForwardOutcome::Skip);
        assert!(f.client.urls.lock().is_empty());
        let entries = f.log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, ForwardOutcome::Skip);
        assert!(entries[0].reason.as_deref().unwrap().contains("latitude"));
    }

    #[tokio::test]
    async fn test_success_logs_attempt_and_success() {
        let f = fixture(RecordingClient::default());
        let outcome = f
            .forwarder
            .forward_record(Some(RecordId(1)), &located("dev1"), &config())
            .await;

        assert_eq!(outcome, ForwardOutcome::Success);
        assert_eq!(f.client.urls.lock().len(), 1);
        assert_eq!(f.log.count(ForwardOutcome::Attempt), 1);
        assert_eq!(f.log.count(ForwardOutcome::Success), 1);
    }

    #[tokio::test]
    async fn test_catch_up_marks_failures_forwarded() {
        let f = fixture(RecordingClient {
            fail_with: Some(500),
            ..Default::default()
        });
        f.storage.create_record(&located("dev1")).await.unwrap();
        f.storage.create_record(&located("dev2")).await.unwrap();

        let report = f.forwarder.run_catch_up(&config()).await.unwrap();
        assert_eq!(report.selected, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(f.log.count(ForwardOutcome::Failure), 2);

        // Not retried on the next cycle
        let again = f.forwarder.run_catch_up(&config()).await.unwrap();
        assert_eq!(again.selected, 0);
        assert_eq!(f.client.urls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_catch_up_respects_filter_and_batch() {
        let f = fixture(RecordingClient::default());
        for id in ["a", "b", "a", "a"] {
            f.storage.create_record(&located(id)).await.unwrap();
        }
        let config = ForwarderConfig {
            identity_filter: vec![DeviceIdentity::new("a")],
            batch_size: 2,
            ..config()
        };

        let report = f.forwarder.run_catch_up(&config).await.unwrap();
        assert_eq!(report.succeeded, 2);
        let left = f.storage.query_unforwarded(10, None).await.unwrap();
        assert_eq!(left.len(), 2);
    }

    #[tokio::test]
    async fn test_catch_up_defers_fresh_records_while_realtime() {
        let f = fixture(RecordingClient::default());
        let mut fresh = located("fresh");
        fresh.received_at = Some(Utc::now());
        let mut stale = located("stale");
        stale.received_at = Some(Utc::now() - chrono::Duration::minutes(10));
        f.storage.create_record(&fresh).await.unwrap();
        f.storage.create_record(&stale).await.unwrap();

        let realtime = ForwarderConfig {
            realtime: true,
            interval: std::time::Duration::from_secs(60),
            ..config()
        };
        let report = f.forwarder.run_catch_up(&realtime).await.unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(f.client.urls.lock().len(), 1);

        let left = f.storage.query_unforwarded(10, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record.identity, Some(DeviceIdentity::new("fresh")));

        // Without real-time delivery the same record goes out immediately
        let batch = ForwarderConfig {
            realtime: false,
            ..realtime
        };
        let report = f.forwarder.run_catch_up(&batch).await.unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.deferred, 0);
        assert_eq!(f.client.urls.lock().len(), 2);
    }
}
