//! Decoded telemetry record.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::tags::{
    TagDescriptor, TagKind, ANALOG_INPUTS, CAN_SLOTS, RS232_SLOTS, THERMOMETER_SLOTS,
    USER_DATA_SLOTS,
};
use crate::error::DecodeError;
use crate::types::{DeviceIdentity, Position, ThermometerReading};

/// Coordinate scale on the wire (micro-degrees).
const COORDINATE_SCALE: f64 = 1_000_000.0;

/// Speed, course and HDOP are transmitted in tenths.
const TENTHS: f64 = 10.0;

/// One logical telemetry fix.
///
/// Only `forwarded` changes after decoding; the forwarder owns that flag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub identity: Option<DeviceIdentity>,
    /// Identity was taken from the connection's session rather than the record.
    #[serde(default)]
    pub identity_inherited: bool,
    pub received_at: Option<DateTime<Utc>>,

    pub hardware_version: Option<u8>,
    pub firmware_version: Option<u8>,
    pub device_number: Option<u16>,
    pub sequence: Option<u16>,
    pub event_time: Option<DateTime<Utc>>,
    pub milliseconds: Option<u16>,

    pub position: Option<Position>,
    pub satellites: Option<u8>,
    /// km/h
    pub speed: Option<f64>,
    /// Degrees from north.
    pub course: Option<f64>,
    /// Metres.
    pub altitude: Option<i16>,
    pub hdop: Option<f64>,

    pub status: Option<u16>,
    /// mV
    pub supply_voltage: Option<u16>,
    /// mV
    pub battery_voltage: Option<u16>,
    pub temperature: Option<i8>,
    pub acceleration: Option<u32>,
    pub outputs: Option<u16>,
    pub inputs: Option<u16>,
    /// mV
    pub analog_inputs: [Option<u16>; ANALOG_INPUTS],
    pub rs232: [Option<u16>; RS232_SLOTS],
    pub thermometers: [Option<ThermometerReading>; THERMOMETER_SLOTS],
    pub ibutton: Option<u32>,
    pub can: [Option<u32>; CAN_SLOTS],
    /// Metres.
    pub mileage: Option<u32>,
    pub user_data: [Option<u32>; USER_DATA_SLOTS],

    #[serde(default)]
    pub forwarded: bool,
}

impl TelemetryRecord {
    /// Convert one tag value and store it in the matching field.
    ///
    /// `value` must be exactly `desc.width` bytes.
    pub fn apply_tag(&mut self, desc: &TagDescriptor, value: &[u8]) -> Result<(), DecodeError> {
        debug_assert_eq!(value.len(), desc.width);
        let invalid = |reason: &str| DecodeError::InvalidValue {
            tag: desc.id,
            reason: reason.to_string(),
        };

        match desc.kind {
            TagKind::HardwareVersion => self.hardware_version = Some(value[0]),
            TagKind::FirmwareVersion => self.firmware_version = Some(value[0]),
            TagKind::Imei => {
                let text = std::str::from_utf8(value).map_err(|_| invalid("not ASCII"))?;
                let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
                if text.is_empty() {
                    return Err(invalid("empty identity"));
                }
                self.identity = Some(DeviceIdentity::new(text));
            }
            TagKind::DeviceNumber => self.device_number = Some(le_u16(value)),
            TagKind::RecordNumber => self.sequence = Some(le_u16(value)),
            TagKind::Timestamp => {
                let secs = i64::from(le_u32(value));
                let time = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| invalid("timestamp out of range"))?;
                self.event_time = Some(time);
            }
            TagKind::Milliseconds => self.milliseconds = Some(le_u16(value)),
            TagKind::Coordinates => {
                let nav = value[0];
                let lat = i32::from_le_bytes([value[1], value[2], value[3], value[4]]);
                let lon = i32::from_le_bytes([value[5], value[6], value[7], value[8]]);
                self.satellites = Some(nav & 0x0F);
                self.position = Some(Position {
                    latitude: f64::from(lat) / COORDINATE_SCALE,
                    longitude: f64::from(lon) / COORDINATE_SCALE,
                    fix_valid: nav >> 4 == 0,
                });
            }
            TagKind::SpeedCourse => {
                self.speed = Some(f64::from(le_u16(&value[0..2])) / TENTHS);
                self.course = Some(f64::from(le_u16(&value[2..4])) / TENTHS);
            }
            TagKind::Altitude => self.altitude = Some(i16::from_le_bytes([value[0], value[1]])),
            TagKind::Hdop => self.hdop = Some(f64::from(value[0]) / TENTHS),
            TagKind::Status => self.status = Some(le_u16(value)),
            TagKind::SupplyVoltage => self.supply_voltage = Some(le_u16(value)),
            TagKind::BatteryVoltage => self.battery_voltage = Some(le_u16(value)),
            TagKind::Temperature => self.temperature = Some(value[0] as i8),
            TagKind::Acceleration => self.acceleration = Some(le_u32(value)),
            TagKind::Outputs => self.outputs = Some(le_u16(value)),
            TagKind::Inputs => self.inputs = Some(le_u16(value)),
            TagKind::AnalogInput(slot) => self.analog_inputs[usize::from(slot)] = Some(le_u16(value)),
            TagKind::Rs232(slot) => self.rs232[usize::from(slot)] = Some(le_u16(value)),
            TagKind::Thermometer(slot) => {
                self.thermometers[usize::from(slot)] = Some(ThermometerReading {
                    sensor_id: value[0],
                    celsius: value[1] as i8,
                });
            }
            TagKind::IButton => self.ibutton = Some(le_u32(value)),
            TagKind::Can(slot) => self.can[usize::from(slot)] = Some(le_u32(value)),
            TagKind::Mileage => self.mileage = Some(le_u32(value)),
            TagKind::UserData(slot) => self.user_data[usize::from(slot)] = Some(le_u32(value)),
        }

        Ok(())
    }

    /// Encode the field a tag describes, if the record has it.
    pub fn encode_tag(&self, desc: &TagDescriptor, dst: &mut BytesMut) -> bool {
        let start = dst.len();
        match desc.kind {
            TagKind::HardwareVersion => put(dst, self.hardware_version, |b, v| b.put_u8(v)),
            TagKind::FirmwareVersion => put(dst, self.firmware_version, |b, v| b.put_u8(v)),
            TagKind::Imei => {
                if let Some(id) = self.identity.as_ref().filter(|_| !self.identity_inherited) {
                    let mut field = [0u8; 15];
                    let bytes = id.as_str().as_bytes();
                    let n = bytes.len().min(field.len());
                    field[..n].copy_from_slice(&bytes[..n]);
                    dst.put_slice(&field);
                }
            }
            TagKind::DeviceNumber => put(dst, self.device_number, |b, v| b.put_u16_le(v)),
            TagKind::RecordNumber => put(dst, self.sequence, |b, v| b.put_u16_le(v)),
            TagKind::Timestamp => {
                let secs = self
                    .event_time
                    .and_then(|t| u32::try_from(t.timestamp()).ok());
                put(dst, secs, |b, v| b.put_u32_le(v));
            }
            TagKind::Milliseconds => put(dst, self.milliseconds, |b, v| b.put_u16_le(v)),
            TagKind::Coordinates => {
                if let Some(pos) = self.position {
                    let validity = if pos.fix_valid { 0 } else { 1 };
                    dst.put_u8((validity << 4) | (self.satellites.unwrap_or(0) & 0x0F));
                    dst.put_i32_le((pos.latitude * COORDINATE_SCALE).round() as i32);
                    dst.put_i32_le((pos.longitude * COORDINATE_SCALE).round() as i32);
                }
            }
            TagKind::SpeedCourse => {
                if self.speed.is_some() || self.course.is_some() {
                    dst.put_u16_le(tenths(self.speed.unwrap_or(0.0)));
                    dst.put_u16_le(tenths(self.course.unwrap_or(0.0)));
                }
            }
            TagKind::Altitude => put(dst, self.altitude, |b, v| b.put_i16_le(v)),
            TagKind::Hdop => put(dst, self.hdop.map(|h| tenths(h) as u8), |b, v| b.put_u8(v)),
            TagKind::Status => put(dst, self.status, |b, v| b.put_u16_le(v)),
            TagKind::SupplyVoltage => put(dst, self.supply_voltage, |b, v| b.put_u16_le(v)),
            TagKind::BatteryVoltage => put(dst, self.battery_voltage, |b, v| b.put_u16_le(v)),
            TagKind::Temperature => put(dst, self.temperature, |b, v| b.put_i8(v)),
            TagKind::Acceleration => put(dst, self.acceleration, |b, v| b.put_u32_le(v)),
            TagKind::Outputs => put(dst, self.outputs, |b, v| b.put_u16_le(v)),
            TagKind::Inputs => put(dst, self.inputs, |b, v| b.put_u16_le(v)),
            TagKind::AnalogInput(slot) => {
                put(dst, self.analog_inputs[usize::from(slot)], |b, v| b.put_u16_le(v));
            }
            TagKind::Rs232(slot) => put(dst, self.rs232[usize::from(slot)], |b, v| b.put_u16_le(v)),
            TagKind::Thermometer(slot) => {
                if let Some(reading) = self.thermometers[usize::from(slot)] {
                    dst.put_u8(reading.sensor_id);
                    dst.put_i8(reading.celsius);
                }
            }
            TagKind::IButton => put(dst, self.ibutton, |b, v| b.put_u32_le(v)),
            TagKind::Can(slot) => put(dst, self.can[usize::from(slot)], |b, v| b.put_u32_le(v)),
            TagKind::Mileage => put(dst, self.mileage, |b, v| b.put_u32_le(v)),
            TagKind::UserData(slot) => {
                put(dst, self.user_data[usize::from(slot)], |b, v| b.put_u32_le(v));
            }
        }
        debug_assert!(dst.len() == start || dst.len() == start + desc.width);
        dst.len() > start
    }

    /// Event time, falling back to the time the record was received.
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        let base = self.event_time.or(self.received_at)?;
        match self.milliseconds {
            Some(ms) if self.event_time.is_some() => {
                Some(base + chrono::Duration::milliseconds(i64::from(ms % 1000)))
            }
            _ => Some(base),
        }
    }

    /// Whether input line `bit` (0-based) is active.
    pub fn input_active(&self, bit: u8) -> bool {
        self.inputs.is_some_and(|inputs| inputs & (1 << bit) != 0)
    }
}

fn le_u16(value: &[u8]) -> u16 {
    u16::from_le_bytes([value[0], value[1]])
}

fn le_u32(value: &[u8]) -> u32 {
    u32::from_le_bytes([value[0], value[1], value[2], value[3]])
}

fn tenths(v: f64) -> u16 {
    (v * TENTHS).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

fn put<T>(dst: &mut BytesMut, value: Option<T>, f: impl FnOnce(&mut BytesMut, T)) {
    if let Some(v) = value {
        f(dst, v);
    }
}
