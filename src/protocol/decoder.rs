//! Main-frame payload decoding.
//!
//! A payload is a run of `(tag id, value)` pairs. Ids inside one record are
//! strictly increasing, so an id that is not greater than its predecessor
//! opens the next record. Records without an identity tag take the identity
//! last seen on the same connection.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::record::TelemetryRecord;
use super::tags;
use crate::error::DecodeError;
use crate::types::{ConnectionId, DeviceIdentity};

/// Source of per-connection identity for records that omit it.
pub trait IdentityContext {
    /// Last identity decoded on this connection.
    fn last_identity(&self, conn: ConnectionId) -> Option<DeviceIdentity>;

    /// Record an explicitly transmitted identity. Returns true if it changed.
    fn remember_identity(&self, conn: ConnectionId, identity: &DeviceIdentity) -> bool;
}

/// Result of decoding one main frame.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    /// Records with a resolved identity, in payload order.
    pub records: Vec<TelemetryRecord>,
    /// Records dropped because no identity could be resolved.
    pub rejected: usize,
    /// Set when this frame taught the connection a new identity.
    pub identity_changed: Option<DeviceIdentity>,
}

/// Stateless decoder over the static tag dictionary.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordDecoder;

impl RecordDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Split a payload into records without resolving identities.
    ///
    /// Any unknown or truncated tag aborts the whole payload.
    pub fn split(&self, payload: &[u8]) -> Result<Vec<TelemetryRecord>, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }

        let mut records = Vec::new();
        let mut current: Option<TelemetryRecord> = None;
        let mut previous_tag: Option<u8> = None;
        let mut offset = 0;

        while offset < payload.len() {
            let tag = payload[offset];
            let desc = tags::lookup(tag).ok_or(DecodeError::UnknownTag { tag, offset })?;

            let value_start = offset + 1;
            let remaining = payload.len() - value_start;
            if desc.width > remaining {
                return Err(DecodeError::TruncatedTag {
                    tag,
                    offset,
                    width: desc.width,
                    remaining,
                });
            }

            // Record boundary: tag ordinal did not increase
            if previous_tag.is_some_and(|prev| tag <= prev) {
                records.extend(current.take());
            }

            current
                .get_or_insert_with(TelemetryRecord::default)
                .apply_tag(desc, &payload[value_start..value_start + desc.width])?;

            previous_tag = Some(tag);
            offset = value_start + desc.width;
        }

        records.extend(current);
        Ok(records)
    }

    /// Decode a main frame payload received on `conn`.
    pub fn decode_frame<C: IdentityContext + ?Sized>(
        &self,
        payload: &[u8],
        conn: ConnectionId,
        context: &C,
        received_at: DateTime<Utc>,
    ) -> Result<DecodedFrame, DecodeError> {
        let mut decoded = DecodedFrame::default();

        for mut record in self.split(payload)? {
            record.received_at = Some(received_at);

            match record.identity {
                Some(ref identity) => {
                    if context.remember_identity(conn, identity) {
                        decoded.identity_changed = Some(identity.clone());
                    }
                }
                None => match context.last_identity(conn) {
                    Some(identity) => {
                        record.identity = Some(identity);
                        record.identity_inherited = true;
                    }
                    None => {
                        warn!(
                            %conn,
                            sequence = ?record.sequence,
                            "Rejecting record without identity on an unidentified connection"
                        );
                        decoded.rejected += 1;
                        continue;
                    }
                },
            }

            decoded.records.push(record);
        }

        debug!(
            %conn,
            records = decoded.records.len(),
            rejected = decoded.rejected,
            "Decoded main frame"
        );

        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapContext(Mutex<HashMap<ConnectionId, DeviceIdentity>>);

    impl IdentityContext for MapContext {
        fn last_identity(&self, conn: ConnectionId) -> Option<DeviceIdentity> {
            self.0.lock().get(&conn).cloned()
        }

        fn remember_identity(&self, conn: ConnectionId, identity: &DeviceIdentity) -> bool {
            self.0.lock().insert(conn, identity.clone()).as_ref() != Some(identity)
        }
    }

    const IMEI: &[u8; 15] = b"868204005647838";

    fn imei_tag() -> Vec<u8> {
        let mut v = vec![0x03];
        v.extend_from_slice(IMEI);
        v
    }

    #[test]
    fn test_single_record() {
        let mut payload = imei_tag();
        payload.extend_from_slice(&[0x10, 0x07, 0x00]);
        payload.extend_from_slice(&[0x35, 0x0C]);

        let records = RecordDecoder::new().split(&payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, Some(7));
        assert_eq!(records[0].hdop, Some(1.2));
    }

    #[test]
    fn test_tag_reset_splits_records() {
        // 0x10, 0x35 | 0x10, 0x35 | 0x10
        let payload = [
            0x10, 0x01, 0x00, 0x35, 0x05, 0x10, 0x02, 0x00, 0x35, 0x06, 0x10, 0x03, 0x00,
        ];
        let records = RecordDecoder::new().split(&payload).unwrap();
        let seqs: Vec<_> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_repeated_tag_id_opens_new_record() {
        let payload = [0x10, 0x01, 0x00, 0x10, 0x02, 0x00];
        let records = RecordDecoder::new().split(&payload).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_unknown_tag_aborts() {
        let payload = [0x10, 0x01, 0x00, 0x05, 0x00];
        let err = RecordDecoder::new().split(&payload).unwrap_err();
        assert_eq!(err, DecodeError::UnknownTag { tag: 0x05, offset: 3 });
    }

    #[test]
    fn test_truncated_tag_aborts() {
        let payload = [0x10, 0x01, 0x00, 0x30, 0x00, 0x01];
        let err = RecordDecoder::new().split(&payload).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TruncatedTag {
                tag: 0x30,
                offset: 3,
                width: 9,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(
            RecordDecoder::new().split(&[]).unwrap_err(),
            DecodeError::EmptyPayload
        );
    }

    #[test]
    fn test_inherits_identity_within_frame() {
        let mut payload = imei_tag();
        payload.extend_from_slice(&[0x10, 0x01, 0x00]);
        payload.extend_from_slice(&[0x10, 0x02, 0x00]);

        let ctx = MapContext::default();
        let conn = ConnectionId::new();
        let decoded = RecordDecoder::new()
            .decode_frame(&payload, conn, &ctx, Utc::now())
            .unwrap();

        assert_eq!(decoded.records.len(), 2);
        assert!(!decoded.records[0].identity_inherited);
        assert!(decoded.records[1].identity_inherited);
        assert_eq!(decoded.records[0].identity, decoded.records[1].identity);
        assert_eq!(decoded.identity_changed.unwrap().as_str(), "868204005647838");
    }

    #[test]
    fn test_rejects_without_known_identity() {
        let ctx = MapContext::default();
        let decoded = RecordDecoder::new()
            .decode_frame(&[0x10, 0x01, 0x00], ConnectionId::new(), &ctx, Utc::now())
            .unwrap();
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.rejected, 1);
    }

    #[test]
    fn test_identity_not_shared_across_connections() {
        let ctx = MapContext::default();
        let decoder = RecordDecoder::new();
        let mut payload = imei_tag();
        payload.extend_from_slice(&[0x10, 0x01, 0x00]);

        decoder
            .decode_frame(&payload, ConnectionId::new(), &ctx, Utc::now())
            .unwrap();
        let other = decoder
            .decode_frame(&[0x10, 0x02, 0x00], ConnectionId::new(), &ctx, Utc::now())
            .unwrap();
        assert_eq!(other.rejected, 1);
    }

    #[test]
    fn test_failed_frame_leaves_context_untouched() {
        let ctx = MapContext::default();
        let conn = ConnectionId::new();
        let mut payload = imei_tag();
        payload.push(0xFF);

        assert!(RecordDecoder::new()
            .decode_frame(&payload, conn, &ctx, Utc::now())
            .is_err());
        assert!(ctx.last_identity(conn).is_none());
    }
}
