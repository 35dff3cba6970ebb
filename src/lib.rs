//! # gnss-relay
//!
//! Ingestion server for GNSS tracking hardware speaking a tag-based binary
//! protocol over persistent TCP connections.
//!
//! Decoded telemetry is stored through a pluggable storage collaborator and
//! forwarded to a partner gateway as `$FRCMD` ASCII commands over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                  Device TCP connections                        │
//! ├────────────────────────────────────────────────────────────────┤
//! │  Framer (codec)  ──ack──▶ device                               │
//! │        │                                                       │
//! │        ▼                                                       │
//! │  Record decoder ◀──── session table (identity inheritance)     │
//! ├────────────────────────────────────────────────────────────────┤
//! │  Ingestion queue (bounded concurrency, retry with backoff)     │
//! │        │                                                       │
//! │        ▼                                                       │
//! │  Storage ──"record stored"──▶ event broker                     │
//! ├────────────────────────────────────────────────────────────────┤
//! │  Forwarder (real-time + catch-up scheduler) ──HTTP──▶ gateway  │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_possible_truncation)]  // Wire fields are range-checked
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::cast_possible_wrap)]        // Gauges exported as i64
#![allow(clippy::suboptimal_flops)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::use_self)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::future_not_send)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::ignored_unit_patterns)]

pub mod config;
pub mod error;
pub mod events;
pub mod forwarder;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default device listener port
pub const DEFAULT_PORT: u16 = 7001;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, EventBroker, EventSink, Topic};
    pub use crate::forwarder::{
        Forwarder, ForwarderConfig, ForwarderConfigHandle, GatewayClient, HttpGatewayClient,
    };
    pub use crate::metrics::IngestStats;
    pub use crate::protocol::{Frame, FrameCodec, RecordDecoder, TelemetryRecord};
    pub use crate::queue::{IngestQueue, QueueConfig};
    pub use crate::server::{IngestServer, Pipeline, SessionTable};
    pub use crate::storage::{MemoryStorage, Storage};
    pub use crate::types::*;
}
