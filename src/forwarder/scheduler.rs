//! Catch-up scheduler. Restarts with fresh parameters whenever the
//! forwarder configuration is replaced.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Forwarder;

pub struct ForwardScheduler {
    forwarder: Arc<Forwarder>,
}

impl ForwardScheduler {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }

    /// Run until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut config_rx = self.forwarder.config().subscribe();

        loop {
            let snapshot = Arc::clone(&config_rx.borrow_and_update());
            let config = &snapshot.config;

            if !(config.enabled && config.auto_forward) {
                debug!(version = snapshot.version, "Auto-forward disabled");
                tokio::select! {
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    _ = shutdown.recv() => return,
                }
            }

            info!(
                version = snapshot.version,
                interval = ?config.interval,
                batch_size = config.batch_size,
                "Forward scheduler started"
            );

            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.forwarder.run_catch_up(config).await {
                            warn!(error = %e, "Catch-up cycle failed");
                        }
                    }
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        info!("Forwarder configuration changed, restarting scheduler");
                        break;
                    }
                    _ = shutdown.recv() => {
                        info!("Forward scheduler stopped");
                        return;
                    }
                }
            }
        }
    }
}
