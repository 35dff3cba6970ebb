//! Forwarder tests - catch-up cycles, identity filtering, audit log and
//! configuration reload from a persisted store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::broadcast;

use gnss_relay::error::ForwardError;
use gnss_relay::forwarder::{
    FileConfigStore, ForwardLog, ForwardOutcome, ForwardScheduler, Forwarder, ForwarderConfig,
    ForwarderConfigHandle, ForwarderConfigStore, GatewayClient, GatewayResponse, JsonlForwardLog,
    MemoryForwardLog,
};
use gnss_relay::metrics::IngestStats;
use gnss_relay::protocol::TelemetryRecord;
use gnss_relay::storage::{MemoryStorage, Storage};
use gnss_relay::types::{DeviceIdentity, Position};

/// Gateway that fails every request for identities in `refuse`.
#[derive(Default)]
struct Gateway {
    urls: Mutex<Vec<Url>>,
    refuse: Vec<String>,
}

#[async_trait]
impl GatewayClient for Gateway {
    async fn send(&self, url: &Url, _timeout: Duration) -> Result<GatewayResponse, ForwardError> {
        self.urls.lock().push(url.clone());
        let query = url.query().unwrap_or_default();
        if self.refuse.iter().any(|id| query.contains(id.as_str())) {
            return Err(ForwardError::Status(503));
        }
        Ok(GatewayResponse {
            status: 200,
            body: "OK".into(),
        })
    }
}

fn located(identity: Option<&str>) -> TelemetryRecord {
    TelemetryRecord {
        identity: identity.map(DeviceIdentity::new),
        position: Some(Position::new(48.1, 11.5)),
        speed: Some(20.0),
        ..Default::default()
    }
}

fn enabled() -> ForwarderConfig {
    ForwarderConfig {
        enabled: true,
        target_url: "http://gateway.test/cmd".into(),
        ..Default::default()
    }
}

fn forwarder(
    storage: &Arc<MemoryStorage>,
    gateway: Arc<Gateway>,
    log: Arc<dyn ForwardLog>,
    config: ForwarderConfig,
) -> Arc<Forwarder> {
    Arc::new(Forwarder::new(
        ForwarderConfigHandle::new(config),
        storage.clone(),
        gateway,
        log,
        Arc::new(IngestStats::new()),
    ))
}

// ============================================================================
// Catch-up
// ============================================================================

#[tokio::test]
async fn test_catch_up_counts_every_outcome() {
    let storage = Arc::new(MemoryStorage::new());
    storage.create_record(&located(Some("good"))).await.unwrap();
    storage.create_record(&located(Some("bad"))).await.unwrap();
    storage.create_record(&located(None)).await.unwrap();

    let gateway = Arc::new(Gateway {
        refuse: vec!["bad".into()],
        ..Default::default()
    });
    let log = Arc::new(MemoryForwardLog::new());
    let fwd = forwarder(&storage, gateway.clone(), log.clone(), enabled());

    let report = fwd.run_catch_up(&enabled()).await.unwrap();
    assert_eq!(report.selected, 3);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);

    // Skips never reach the gateway
    assert_eq!(gateway.urls.lock().len(), 2);
    assert_eq!(log.count(ForwardOutcome::Attempt), 2);
    assert_eq!(log.count(ForwardOutcome::Skip), 1);

    // Every attempted record is flagged, so a second cycle finds nothing
    assert!(storage.all().iter().all(|s| s.record.forwarded));
    let again = fwd.run_catch_up(&enabled()).await.unwrap();
    assert_eq!(again.selected, 0);
}

#[tokio::test]
async fn test_catch_up_respects_batch_size_and_filter() {
    let storage = Arc::new(MemoryStorage::new());
    for _ in 0..5 {
        storage.create_record(&located(Some("tracked"))).await.unwrap();
    }
    storage.create_record(&located(Some("other"))).await.unwrap();

    let config = ForwarderConfig {
        batch_size: 2,
        identity_filter: vec![DeviceIdentity::new("tracked")],
        ..enabled()
    };
    let fwd = forwarder(
        &storage,
        Arc::new(Gateway::default()),
        Arc::new(MemoryForwardLog::new()),
        config.clone(),
    );

    let mut cycles = 0;
    loop {
        let report = fwd.run_catch_up(&config).await.unwrap();
        if report.selected == 0 {
            break;
        }
        assert!(report.selected <= 2);
        cycles += 1;
    }
    assert_eq!(cycles, 3);

    let untouched: Vec<_> = storage
        .all()
        .into_iter()
        .filter(|s| !s.record.forwarded)
        .collect();
    assert_eq!(untouched.len(), 1);
    assert_eq!(untouched[0].record.identity, Some(DeviceIdentity::new("other")));
}

#[tokio::test]
async fn test_jsonl_log_records_attempt_and_result() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forward.jsonl");

    let storage = Arc::new(MemoryStorage::new());
    storage.create_record(&located(Some("dev1"))).await.unwrap();
    let fwd = forwarder(
        &storage,
        Arc::new(Gateway::default()),
        Arc::new(JsonlForwardLog::new(&path)),
        enabled(),
    );
    fwd.run_catch_up(&enabled()).await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let outcomes: Vec<String> = content
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["outcome"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(outcomes, vec!["ATTEMPT", "SUCCESS"]);
    assert!(content.contains("$FRCMD,dev1F,_SendMessage"));
}

// ============================================================================
// Configuration reload
// ============================================================================

#[tokio::test]
async fn test_reload_from_file_store_restarts_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::new(dir.path().join("forwarder.toml"));
    store.update(&ForwarderConfig::default()).await.unwrap();

    let storage = Arc::new(MemoryStorage::new());
    storage.create_record(&located(Some("dev1"))).await.unwrap();
    let gateway = Arc::new(Gateway::default());
    let fwd = forwarder(
        &storage,
        gateway.clone(),
        Arc::new(MemoryForwardLog::new()),
        store.get().await.unwrap(),
    );
    let handle = fwd.config().clone();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(ForwardScheduler::new(Arc::clone(&fwd)).run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(gateway.urls.lock().is_empty(), "disabled forwarder must stay idle");

    // Edit the file out of band, then reload as SIGHUP would
    let mut edited = enabled();
    edited.interval = Duration::from_millis(20);
    store.update(&edited).await.unwrap();
    let version = handle.reload(&store).await.unwrap();
    assert_eq!(version, 2);
    assert_eq!(handle.current().config, edited);

    tokio::time::timeout(Duration::from_secs(2), async {
        while gateway.urls.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scheduler should forward after reload");

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_invalid_reload_keeps_previous_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forwarder.toml");
    let store = FileConfigStore::new(&path);

    let handle = ForwarderConfigHandle::new(enabled());
    std::fs::write(&path, "enabled = true\ntarget_url = \"::not a url::\"\n").unwrap();

    assert!(handle.reload(&store).await.is_err());
    assert_eq!(handle.version(), 1);
    assert_eq!(handle.current().config, enabled());
}
