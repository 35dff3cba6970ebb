//! Signal handling for graceful shutdown and forwarder configuration reload.
//!
//! Handles:
//! - SIGTERM/SIGINT for graceful shutdown
//! - SIGHUP for forwarder configuration reload

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Signal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Terminate signal (SIGTERM).
    Terminate,
    /// Interrupt signal (SIGINT).
    Interrupt,
    /// Hangup signal (SIGHUP), reloads the forwarder configuration.
    Hangup,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Interrupt => write!(f, "SIGINT"),
            Signal::Hangup => write!(f, "SIGHUP"),
        }
    }
}

type ReloadCallback = Box<dyn Fn() + Send + Sync>;

/// Signal handler that broadcasts signals to subscribers.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown: Arc<AtomicBool>,
    signal_tx: broadcast::Sender<Signal>,
    reload_callback: Arc<RwLock<Option<ReloadCallback>>>,
}

impl SignalHandler {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);

        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            signal_tx,
            reload_callback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signal_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.signal_tx.send(Signal::Terminate);
    }

    /// Set the callback run on SIGHUP.
    pub fn set_reload_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.reload_callback.write() = Some(Box::new(callback));
    }

    fn handle_signal(&self, signal: Signal) {
        info!("Received signal: {}", signal);

        match signal {
            Signal::Terminate | Signal::Interrupt => {
                info!("Initiating graceful shutdown");
                self.shutdown.store(true, Ordering::Release);
            }
            Signal::Hangup => {
                info!("Reloading forwarder configuration");
                if let Some(callback) = self.reload_callback.read().as_ref() {
                    callback();
                }
            }
        }

        let _ = self.signal_tx.send(signal);
    }

    /// Listen for signals until a termination signal arrives (Unix).
    #[cfg(unix)]
    pub async fn listen(&self) {
        use futures::StreamExt;
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook_tokio::Signals;

        let signals = match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register signal handlers: {}", e);
                return;
            }
        };

        let handle = signals.handle();
        let mut signals = signals.fuse();

        info!("Signal handler started");

        while let Some(signal) = signals.next().await {
            let sig = match signal {
                SIGTERM => Signal::Terminate,
                SIGINT => Signal::Interrupt,
                SIGHUP => Signal::Hangup,
                _ => continue,
            };

            self.handle_signal(sig);

            if sig != Signal::Hangup {
                break;
            }
        }

        handle.close();
        info!("Signal handler stopped");
    }

    /// Listen for Ctrl+C (non-Unix).
    #[cfg(not(unix))]
    pub async fn listen(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => self.handle_signal(Signal::Interrupt),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    }

    /// Wait until shutdown is requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.signal_tx.subscribe();
        if self.is_shutdown() {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(Signal::Terminate | Signal::Interrupt) => return,
                Ok(Signal::Hangup) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
