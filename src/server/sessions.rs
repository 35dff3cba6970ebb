//! Per-connection device session table.
//!
//! Holds, for each open connection, the identity most recently decoded on it.
//! Entries are created empty on connect and removed on disconnect; an identity
//! is never visible from another connection.

use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::protocol::IdentityContext;
use crate::types::{ConnectionId, DeviceIdentity};

/// State kept for one open connection.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub identity: Option<DeviceIdentity>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub frames: u64,
    pub records: u64,
}

impl DeviceSession {
    fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            identity: None,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            frames: 0,
            records: 0,
        }
    }
}

/// Serializable view of a session for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub connection: String,
    pub peer: String,
    pub identity: Option<DeviceIdentity>,
    pub connected_at: DateTime<Utc>,
    pub idle_seconds: u64,
    pub frames: u64,
    pub records: u64,
}

/// Connection-id keyed session table owned by the server.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<ConnectionId, DeviceSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection with no identity.
    pub fn open(&self, id: ConnectionId, peer: SocketAddr) {
        self.sessions.insert(id, DeviceSession::new(id, peer));
        debug!(conn = %id, %peer, "Opened session");
    }

    /// Drop a connection's entry. Returns the identity it had learned.
    pub fn close(&self, id: ConnectionId) -> Option<DeviceIdentity> {
        let (_, session) = self.sessions.remove(&id)?;
        info!(
            conn = %id,
            peer = %session.peer,
            identity = ?session.identity,
            frames = session.frames,
            records = session.records,
            "Closed session"
        );
        session.identity
    }

    /// Count a received frame and the records it produced.
    pub fn record_frame(&self, id: ConnectionId, records: usize) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.frames += 1;
            session.records += records as u64;
            session.last_activity = Instant::now();
        }
    }

    pub fn identity(&self, id: ConnectionId) -> Option<DeviceIdentity> {
        self.sessions.get(&id).and_then(|s| s.identity.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all sessions.
    pub fn status(&self) -> Vec<SessionStatus> {
        self.sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionStatus {
                    connection: s.id.to_string(),
                    peer: s.peer.to_string(),
                    identity: s.identity.clone(),
                    connected_at: s.connected_at,
                    idle_seconds: s.last_activity.elapsed().as_secs(),
                    frames: s.frames,
                    records: s.records,
                }
            })
            .collect()
    }
}

impl IdentityContext for SessionTable {
    fn last_identity(&self, conn: ConnectionId) -> Option<DeviceIdentity> {
        self.identity(conn)
    }

    fn remember_identity(&self, conn: ConnectionId, identity: &DeviceIdentity) -> bool {
        let Some(mut session) = self.sessions.get_mut(&conn) else {
            return false;
        };
        if session.identity.as_ref() == Some(identity) {
            return false;
        }
        session.identity = Some(identity.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.7:40211".parse().unwrap()
    }

    #[test]
    fn test_open_starts_without_identity() {
        let table = SessionTable::new();
        let id = ConnectionId::new();
        table.open(id, peer());
        assert!(table.contains(id));
        assert!(table.identity(id).is_none());
    }

    #[test]
    fn test_remember_reports_changes_only() {
        let table = SessionTable::new();
        let id = ConnectionId::new();
        table.open(id, peer());

        let a = DeviceIdentity::new("111111111111111");
        let b = DeviceIdentity::new("222222222222222");
        assert!(table.remember_identity(id, &a));
        assert!(!table.remember_identity(id, &a));
        assert!(table.remember_identity(id, &b));
        assert_eq!(table.last_identity(id), Some(b));
    }

    #[test]
    fn test_close_clears_identity() {
        let table = SessionTable::new();
        let id = ConnectionId::new();
        table.open(id, peer());
        table.remember_identity(id, &DeviceIdentity::new("333333333333333"));

        assert!(table.close(id).is_some());
        assert!(table.last_identity(id).is_none());
        assert!(!table.remember_identity(id, &DeviceIdentity::new("x")));
        assert!(table.is_empty());
    }

    #[test]
    fn test_status_counts_frames() {
        let table = SessionTable::new();
        let id = ConnectionId::new();
        table.open(id, peer());
        table.record_frame(id, 2);
        table.record_frame(id, 1);

        let status = table.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].frames, 2);
        assert_eq!(status[0].records, 3);
    }
}
