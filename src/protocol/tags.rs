//! Static tag dictionary.
//!
//! Every tag in a main frame payload is a one-byte id followed by a value whose
//! width is fixed by the id. Within one record, ids appear in strictly
//! increasing order.

/// Semantic kind of a tag value, naming the record field it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    HardwareVersion,
    FirmwareVersion,
    /// 15 ASCII digits; the device identity.
    Imei,
    DeviceNumber,
    RecordNumber,
    /// Unix seconds, u32.
    Timestamp,
    Milliseconds,
    /// Navigation byte, latitude and longitude as i32 micro-degrees.
    Coordinates,
    /// Speed and course, both u16 in tenths.
    SpeedCourse,
    Altitude,
    Hdop,
    Status,
    SupplyVoltage,
    BatteryVoltage,
    Temperature,
    Acceleration,
    Outputs,
    Inputs,
    AnalogInput(u8),
    Rs232(u8),
    Thermometer(u8),
    IButton,
    Can(u8),
    Mileage,
    UserData(u8),
}

/// Static entry mapping a tag id to its width and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagDescriptor {
    pub id: u8,
    pub width: usize,
    pub kind: TagKind,
    pub name: &'static str,
}

const fn tag(id: u8, width: usize, kind: TagKind, name: &'static str) -> TagDescriptor {
    TagDescriptor {
        id,
        width,
        kind,
        name,
    }
}

/// Tag id carrying the device identity.
pub const TAG_IMEI: u8 = 0x03;

/// Number of analog input slots.
pub const ANALOG_INPUTS: usize = 4;
/// Number of RS-232 slots.
pub const RS232_SLOTS: usize = 2;
/// Number of thermometer slots.
pub const THERMOMETER_SLOTS: usize = 8;
/// Number of CAN extension slots.
pub const CAN_SLOTS: usize = 4;
/// Number of user data slots.
pub const USER_DATA_SLOTS: usize = 8;

/// The dictionary, sorted by id.
pub static TAG_DICTIONARY: &[TagDescriptor] = &[
    tag(0x01, 1, TagKind::HardwareVersion, "hardware_version"),
    tag(0x02, 1, TagKind::FirmwareVersion, "firmware_version"),
    tag(0x03, 15, TagKind::Imei, "imei"),
    tag(0x04, 2, TagKind::DeviceNumber, "device_number"),
    tag(0x10, 2, TagKind::RecordNumber, "record_number"),
    tag(0x20, 4, TagKind::Timestamp, "timestamp"),
    tag(0x21, 2, TagKind::Milliseconds, "milliseconds"),
    tag(0x30, 9, TagKind::Coordinates, "coordinates"),
    tag(0x33, 4, TagKind::SpeedCourse, "speed_course"),
    tag(0x34, 2, TagKind::Altitude, "altitude"),
    tag(0x35, 1, TagKind::Hdop, "hdop"),
    tag(0x40, 2, TagKind::Status, "status"),
    tag(0x41, 2, TagKind::SupplyVoltage, "supply_voltage"),
    tag(0x42, 2, TagKind::BatteryVoltage, "battery_voltage"),
    tag(0x43, 1, TagKind::Temperature, "temperature"),
    tag(0x44, 4, TagKind::Acceleration, "acceleration"),
    tag(0x45, 2, TagKind::Outputs, "outputs"),
    tag(0x46, 2, TagKind::Inputs, "inputs"),
    tag(0x50, 2, TagKind::AnalogInput(0), "analog_input_1"),
    tag(0x51, 2, TagKind::AnalogInput(1), "analog_input_2"),
    tag(0x52, 2, TagKind::AnalogInput(2), "analog_input_3"),
    tag(0x53, 2, TagKind::AnalogInput(3), "analog_input_4"),
    tag(0x58, 2, TagKind::Rs232(0), "rs232_0"),
    tag(0x59, 2, TagKind::Rs232(1), "rs232_1"),
    tag(0x70, 2, TagKind::Thermometer(0), "thermometer_0"),
    tag(0x71, 2, TagKind::Thermometer(1), "thermometer_1"),
    tag(0x72, 2, TagKind::Thermometer(2), "thermometer_2"),
    tag(0x73, 2, TagKind::Thermometer(3), "thermometer_3"),
    tag(0x74, 2, TagKind::Thermometer(4), "thermometer_4"),
    tag(0x75, 2, TagKind::Thermometer(5), "thermometer_5"),
    tag(0x76, 2, TagKind::Thermometer(6), "thermometer_6"),
    tag(0x77, 2, TagKind::Thermometer(7), "thermometer_7"),
    tag(0x90, 4, TagKind::IButton, "ibutton"),
    tag(0xC0, 4, TagKind::Can(0), "can_0"),
    tag(0xC1, 4, TagKind::Can(1), "can_1"),
    tag(0xC2, 4, TagKind::Can(2), "can_2"),
    tag(0xC3, 4, TagKind::Can(3), "can_3"),
    tag(0xD4, 4, TagKind::Mileage, "mileage"),
    tag(0xE2, 4, TagKind::UserData(0), "user_data_0"),
    tag(0xE3, 4, TagKind::UserData(1), "user_data_1"),
    tag(0xE4, 4, TagKind::UserData(2), "user_data_2"),
    tag(0xE5, 4, TagKind::UserData(3), "user_data_3"),
    tag(0xE6, 4, TagKind::UserData(4), "user_data_4"),
    tag(0xE7, 4, TagKind::UserData(5), "user_data_5"),
    tag(0xE8, 4, TagKind::UserData(6), "user_data_6"),
    tag(0xE9, 4, TagKind::UserData(7), "user_data_7"),
];

/// Look up a tag id.
pub fn lookup(id: u8) -> Option<&'static TagDescriptor> {
    TAG_DICTIONARY
        .binary_search_by_key(&id, |d| d.id)
        .ok()
        .map(|idx| &TAG_DICTIONARY[idx])
}
