//! Device-facing TCP server.
//!
//! This module contains:
//! - The listener and per-connection framing loop
//! - The session table used for identity inheritance
//! - The shared [`Pipeline`] handed to every connection
//! - Signal handling

mod connection;
mod sessions;
mod signals;

pub use sessions::*;
pub use signals::*;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::error::{LinkError, Result};
use crate::events::EventBroker;
use crate::forwarder::{ForwardLog, ForwardScheduler, Forwarder, ForwarderConfigHandle, GatewayClient};
use crate::metrics::{IngestStats, StatusResponse};
use crate::queue::IngestQueue;
use crate::storage::Storage;

use connection::Connection;

/// Everything connection tasks and background workers share.
pub struct Pipeline {
    pub sessions: Arc<SessionTable>,
    pub queue: Arc<IngestQueue>,
    pub events: Arc<EventBroker>,
    pub stats: Arc<IngestStats>,
    pub forwarder: Arc<Forwarder>,
    started: Instant,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        client: Arc<dyn GatewayClient>,
        forward_log: Arc<dyn ForwardLog>,
        forwarder_config: ForwarderConfigHandle,
    ) -> Self {
        let stats = Arc::new(IngestStats::new());
        let events = Arc::new(EventBroker::default());
        let queue = Arc::new(IngestQueue::new(
            config.queue.clone(),
            Arc::clone(&storage),
            events.clone(),
            Arc::clone(&stats),
        ));
        let forwarder = Arc::new(Forwarder::new(
            forwarder_config,
            storage,
            client,
            forward_log,
            Arc::clone(&stats),
        ));

        Self {
            sessions: Arc::new(SessionTable::new()),
            queue,
            events,
            stats,
            forwarder,
            started: Instant::now(),
        }
    }

    /// Status document for dashboards.
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            version: crate::VERSION.to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            counters: self.stats.snapshot(),
            queue: self.queue.status(),
            sessions: self.sessions.status(),
            forwarder_config_version: self.forwarder.config().version(),
        }
    }
}

#[cfg(feature = "metrics")]
impl crate::metrics::StatusProvider for Pipeline {
    fn status(&self) -> StatusResponse {
        Pipeline::status(self)
    }
}

/// The ingestion server.
pub struct IngestServer {
    config: Arc<ServerConfig>,
    listeners: Vec<TcpListener>,
    pipeline: Arc<Pipeline>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IngestServer {
    /// Bind every configured listen address.
    pub async fn bind(config: ServerConfig, pipeline: Arc<Pipeline>) -> Result<Self> {
        let mut listeners = Vec::with_capacity(config.listen_addrs.len());
        for addr in &config.listen_addrs {
            let listener = TcpListener::bind(addr).await.map_err(|e| LinkError::BindFailed {
                addr: *addr,
                reason: e.to_string(),
            })?;
            info!("Listening for devices on {}", listener.local_addr()?);
            listeners.push(listener);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config: Arc::new(config),
            listeners,
            pipeline,
            shutdown_tx,
        })
    }

    /// Actual bound addresses (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Sender that stops [`run`](Self::run) when a value is sent.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections and run the queue and forwarder until shutdown,
    /// then drain the queue within the configured grace period.
    pub async fn run(self) -> Result<()> {
        let pipeline = &self.pipeline;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Subscribe before the queue can publish anything
        let realtime = tokio::spawn(
            Arc::clone(&pipeline.forwarder)
                .run_realtime(pipeline.events.subscribe(), self.shutdown_tx.subscribe()),
        );
        let scheduler = tokio::spawn(
            ForwardScheduler::new(Arc::clone(&pipeline.forwarder)).run(self.shutdown_tx.subscribe()),
        );
        let dispatcher = tokio::spawn(Arc::clone(&pipeline.queue).run());

        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        let mut acceptors: Vec<JoinHandle<()>> = Vec::new();
        for listener in self.listeners {
            acceptors.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&self.config),
                Arc::clone(pipeline),
                Arc::clone(&limit),
                self.shutdown_tx.clone(),
            )));
        }

        let _ = shutdown_rx.recv().await;
        info!("Shutting down ingestion server");

        for acceptor in acceptors {
            let _ = acceptor.await;
        }

        let drained = pipeline.queue.drain(self.config.shutdown_grace).await;
        if !drained {
            warn!("Forcing exit with work still queued");
        }

        let grace = self.config.shutdown_grace;
        for (name, task) in [("dispatcher", dispatcher), ("realtime", realtime), ("scheduler", scheduler)] {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!(task = name, "Background task did not stop in time");
            }
        }

        info!("Ingestion server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    pipeline: Arc<Pipeline>,
    limit: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown = shutdown_tx.subscribe();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.recv() => break,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
            IngestStats::incr(&pipeline.stats.connections_refused);
            warn!(
                %peer,
                "Refusing connection: {}",
                LinkError::ConnectionLimit(config.max_connections)
            );
            drop(stream);
            continue;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "Failed to set TCP_NODELAY: {e}");
        }

        let connection = Connection::new(peer, Arc::clone(&config), Arc::clone(&pipeline));
        let conn_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            connection.run(stream, conn_shutdown).await;
            drop(permit);
        });
    }
}
