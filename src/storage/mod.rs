//! Storage collaborator interface.
//!
//! Persistent storage lives outside this crate; the pipeline only needs to
//! create records, find the ones not yet forwarded, and flag them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::protocol::TelemetryRecord;
use crate::types::{DeviceIdentity, RecordId};

/// A record as held by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub record: TelemetryRecord,
}

/// Storage used by the ingestion queue and the forwarder.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a decoded record and return its id.
    async fn create_record(&self, record: &TelemetryRecord) -> Result<RecordId>;

    /// Up to `limit` records with `forwarded == false`, oldest first,
    /// optionally restricted to the given identities.
    async fn query_unforwarded(
        &self,
        limit: usize,
        identity_filter: Option<&[DeviceIdentity]>,
    ) -> Result<Vec<StoredRecord>>;

    /// Set the forwarded flag on a record.
    async fn mark_forwarded(&self, id: RecordId) -> Result<()>;
}

/// In-process storage, used by the standalone binary and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<RecordId, TelemetryRecord>>,
    next_id: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<TelemetryRecord> {
        self.records.read().get(&id).cloned()
    }

    /// All records in id order.
    pub fn all(&self) -> Vec<StoredRecord> {
        self.records
            .read()
            .iter()
            .map(|(id, record)| StoredRecord {
                id: *id,
                record: record.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_record(&self, record: &TelemetryRecord) -> Result<RecordId> {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.records.write().insert(id, record.clone());
        Ok(id)
    }

    async fn query_unforwarded(
        &self,
        limit: usize,
        identity_filter: Option<&[DeviceIdentity]>,
    ) -> Result<Vec<StoredRecord>> {
        let records = self.records.read();
        Ok(records
            .iter()
            .filter(|(_, r)| !r.forwarded)
            .filter(|(_, r)| match (identity_filter, r.identity.as_ref()) {
                (None, _) => true,
                (Some(allowed), Some(identity)) => allowed.contains(identity),
                (Some(_), None) => false,
            })
            .take(limit)
            .map(|(id, record)| StoredRecord {
                id: *id,
                record: record.clone(),
            })
            .collect())
    }

    async fn mark_forwarded(&self, id: RecordId) -> Result<()> {
        if let Some(record) = self.records.write().get_mut(&id) {
            record.forwarded = true;
            Ok(())
        } else {
            Err(crate::Error::permanent_storage(format!("record {id} not found")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str) -> TelemetryRecord {
        TelemetryRecord {
            identity: Some(DeviceIdentity::new(identity)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let storage = MemoryStorage::new();
        let a = storage.create_record(&record("a")).await.unwrap();
        let b = storage.create_record(&record("b")).await.unwrap();
        assert!(b > a);
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn test_query_unforwarded_with_filter_and_limit() {
        let storage = MemoryStorage::new();
        for id in ["a", "b", "a", "a"] {
            storage.create_record(&record(id)).await.unwrap();
        }
        let first = storage.query_unforwarded(10, None).await.unwrap()[0].id;
        storage.mark_forwarded(first).await.unwrap();

        let allow = [DeviceIdentity::new("a")];
        let rows = storage.query_unforwarded(10, Some(&allow)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.record.identity == Some(allow[0].clone())));

        let limited = storage.query_unforwarded(1, None).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_missing_record_fails() {
        let storage = MemoryStorage::new();
        let err = storage.mark_forwarded(RecordId(99)).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
