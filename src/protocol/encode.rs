//! Payload and frame encoding, the device side of the protocol.
//!
//! Used by `device-sim` and by tests that need real wire bytes.

use bytes::{BufMut, Bytes, BytesMut};

use super::record::TelemetryRecord;
use super::tags::TAG_DICTIONARY;
use super::{checksum, ARCHIVE_FLAG, FRAME_MAIN, FRAME_OVERHEAD, MAX_PAYLOAD_SIZE};

/// Encode one record's present fields in increasing tag order.
///
/// Inherited identities are not written back.
pub fn encode_record(record: &TelemetryRecord, dst: &mut BytesMut) -> Option<(u8, u8)> {
    let mut first = None;
    let mut last = None;
    for desc in TAG_DICTIONARY {
        let before = dst.len();
        dst.put_u8(desc.id);
        if record.encode_tag(desc, dst) {
            first.get_or_insert(desc.id);
            last = Some(desc.id);
        } else {
            dst.truncate(before);
        }
    }
    first.zip(last)
}

/// Encode several records into one main-frame payload.
///
/// Returns `None` when a record is empty or when two neighbouring records would
/// merge on decode (the next record must start at a tag id not above the last
/// tag of the previous one).
pub fn encode_payload(records: &[TelemetryRecord]) -> Option<Bytes> {
    let mut dst = BytesMut::new();
    let mut previous_last: Option<u8> = None;

    for record in records {
        let (first, last) = encode_record(record, &mut dst)?;
        if previous_last.is_some_and(|prev| first > prev) {
            return None;
        }
        previous_last = Some(last);
    }

    (dst.len() <= MAX_PAYLOAD_SIZE).then(|| dst.freeze())
}

/// Wrap a payload in a frame with length word and CRC.
pub fn build_frame(header: u8, payload: &[u8], archive: bool) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
    let mut length_word = payload.len() as u16;
    if archive {
        length_word |= ARCHIVE_FLAG;
    }

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.push(header);
    frame.extend_from_slice(&length_word.to_le_bytes());
    frame.extend_from_slice(payload);
    let crc = checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Build a complete main frame from records.
pub fn main_frame(records: &[TelemetryRecord]) -> Option<Vec<u8>> {
    encode_payload(records).map(|payload| build_frame(FRAME_MAIN, &payload, false))
}
