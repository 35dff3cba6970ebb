//! Error types for gnss-relay.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::ConnectionId;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    // Device link errors
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    // Payload decoding errors
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    // Ingestion queue errors
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    // Outbound forwarding errors
    #[error("forward error: {0}")]
    Forward(#[from] ForwardError),

    // Storage collaborator errors
    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors on the device-facing TCP link. All of them close the connection.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("declared payload length {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("connection idle for longer than {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

/// Errors while walking a main frame's tag payload. They abort the frame only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown tag 0x{tag:02X} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("tag 0x{tag:02X} at offset {offset} needs {width} bytes, {remaining} remaining")]
    TruncatedTag {
        tag: u8,
        offset: usize,
        width: usize,
        remaining: usize,
    },

    #[error("invalid value for tag 0x{tag:02X}: {reason}")]
    InvalidValue { tag: u8, reason: String },

    #[error("empty payload")]
    EmptyPayload,

    #[error("frame shorter than header and checksum: {0} bytes")]
    ShortFrame(usize),

    #[error("invalid hex input: {0}")]
    Hex(String),
}

/// Ingestion queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("storage call timed out after {0:?}")]
    StoreTimeout(std::time::Duration),

    #[error("queue is closed")]
    Closed,

    #[error("item {id} failed permanently after {retries} retries: {reason}")]
    PermanentFailure { id: u64, retries: u32, reason: String },
}

/// Outbound forwarding errors.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid target url {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("gateway request failed: {0}")]
    Http(String),

    #[error("gateway returned status {0}")]
    Status(u16),

    #[error("forward log write failed: {0}")]
    Log(String),
}

impl Error {
    /// Create a storage error that the queue may retry.
    pub fn transient_storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a storage error that the queue must not retry.
    pub fn permanent_storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Check if the failure is transient (the queue should retry).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Queue(QueueError::StoreTimeout(_))
                | Error::Storage {
                    transient: true,
                    ..
                }
                | Error::Io(_)
        )
    }

    /// Check if the error must close the device connection.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Error::Link(_) | Error::Io(_))
    }
}

/// Error context attached to connection-level log lines.
#[derive(Debug)]
pub struct ErrorContext {
    pub connection: Option<ConnectionId>,
    pub peer_addr: Option<SocketAddr>,
    pub operation: &'static str,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation={}", self.operation)?;
        if let Some(conn) = self.connection {
            write!(f, ", conn={conn}")?;
        }
        if let Some(addr) = self.peer_addr {
            write!(f, ", peer={addr}")?;
        }
        Ok(())
    }
}
