//! `$FRCMD` command encoding for the partner gateway.
//!
//! ```text
//! $FRCMD,<id><suffix>,_SendMessage,,<DDMM.MMMM>,<N|S>,<DDDMM.MMMM>,<E|W>,<height>,
//!     <knots>,<heading>,<DDMMYY>,<HHMMSS.SS>,<valid>,Button1=..,..,Analog4=..
//! ```

use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use reqwest::Url;

use crate::error::ForwardError;
use crate::protocol::TelemetryRecord;

/// km/h to knots.
pub const KNOTS_PER_KMH: f64 = 0.539957;

/// Query parameter carrying the command.
pub const COMMAND_PARAM: &str = "cmd";

pub fn knots(kmh: f64) -> f64 {
    kmh * KNOTS_PER_KMH
}

/// Signed decimal degrees split into degrees, decimal minutes and hemisphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegreesMinutes {
    pub degrees: u32,
    pub minutes: f64,
    pub hemisphere: char,
}

impl DegreesMinutes {
    pub fn latitude(value: f64) -> Self {
        Self::split(value, 'N', 'S')
    }

    pub fn longitude(value: f64) -> Self {
        Self::split(value, 'E', 'W')
    }

    fn split(value: f64, positive: char, negative: char) -> Self {
        let hemisphere = if value < 0.0 { negative } else { positive };
        let abs = value.abs();
        let mut degrees = abs.trunc() as u32;
        let mut minutes = (abs - f64::from(degrees)) * 60.0;
        // 59.99999 would print as 60.0000
        if (minutes * 10_000.0).round() >= 600_000.0 {
            degrees += 1;
            minutes = 0.0;
        }
        Self {
            degrees,
            minutes,
            hemisphere,
        }
    }

    /// `DDMM.MMMM` for latitude (`width` 2) or `DDDMM.MMMM` for longitude (`width` 3).
    pub fn format(&self, width: usize) -> String {
        format!(
            "{:0width$}{:07.4}",
            self.degrees,
            self.minutes,
            width = width
        )
    }
}

/// One outbound gateway command.
#[derive(Debug, Clone, PartialEq)]
pub struct FrcmdCommand {
    pub identity: String,
    pub latitude: DegreesMinutes,
    pub longitude: DegreesMinutes,
    pub height: i16,
    pub speed_knots: f64,
    pub heading: f64,
    pub time: DateTime<Utc>,
    pub valid: bool,
    pub buttons: [bool; 4],
    /// Volts.
    pub analog: [f64; 4],
    pub speed_precision: usize,
}

impl FrcmdCommand {
    /// Build from a record. Identity, latitude and longitude are required.
    pub fn from_record(
        record: &TelemetryRecord,
        identity_suffix: &str,
        speed_precision: usize,
    ) -> Result<Self, ForwardError> {
        let identity = record
            .identity
            .as_ref()
            .ok_or(ForwardError::MissingField("identity"))?;
        let position = record
            .position
            .ok_or(ForwardError::MissingField("latitude"))?;
        if !position.latitude.is_finite() {
            return Err(ForwardError::MissingField("latitude"));
        }
        if !position.longitude.is_finite() {
            return Err(ForwardError::MissingField("longitude"));
        }

        let mut analog = [0.0; 4];
        for (volts, mv) in analog.iter_mut().zip(record.analog_inputs.iter()) {
            *volts = mv.map_or(0.0, |mv| f64::from(mv) / 1000.0);
        }

        Ok(Self {
            identity: format!("{identity}{identity_suffix}"),
            latitude: DegreesMinutes::latitude(position.latitude),
            longitude: DegreesMinutes::longitude(position.longitude),
            height: record.altitude.unwrap_or(0),
            speed_knots: knots(record.speed.unwrap_or(0.0)),
            heading: record.course.unwrap_or(0.0),
            time: record.effective_time().unwrap_or_else(Utc::now),
            valid: true,
            buttons: [0, 1, 2, 3].map(|bit| record.input_active(bit)),
            analog,
            speed_precision,
        })
    }

    /// Gateway URL with the command in the `cmd` parameter.
    pub fn to_url(&self, target: &str) -> Result<Url, ForwardError> {
        Url::parse_with_params(target, &[(COMMAND_PARAM, self.to_string())]).map_err(|e| {
            ForwardError::InvalidTarget {
                url: target.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn time_field(&self) -> String {
        let centis = self.time.nanosecond() % 1_000_000_000 / 10_000_000;
        format!("{}.{:02}", self.time.format("%H%M%S"), centis)
    }
}

impl fmt::Display for FrcmdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "$FRCMD,{},_SendMessage,,{},{},{},{},{},{:.prec$},{:.1},{},{},{}",
            self.identity,
            self.latitude.format(2),
            self.latitude.hemisphere,
            self.longitude.format(3),
            self.longitude.hemisphere,
            self.height,
            self.speed_knots,
            self.heading,
            self.time.format("%d%m%y"),
            self.time_field(),
            u8::from(self.valid),
            prec = self.speed_precision,
        )?;
        for (i, pressed) in self.buttons.iter().enumerate() {
            write!(f, ",Button{}={}", i + 1, u8::from(*pressed))?;
        }
        for (i, volts) in self.analog.iter().enumerate() {
            write!(f, ",Analog{}={:.2}", i + 1, volts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceIdentity, Position};
    use chrono::TimeZone;

    fn record() -> TelemetryRecord {
        let mut record = TelemetryRecord {
            identity: Some(DeviceIdentity::new("860000000000001")),
            position: Some(Position::new(10.5, -20.25)),
            speed: Some(100.0),
            course: Some(270.5),
            altitude: Some(152),
            event_time: Some(Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap()),
            milliseconds: Some(250),
            inputs: Some(0b0101),
            ..Default::default()
        };
        record.analog_inputs[0] = Some(12_340);
        record
    }

    #[test]
    fn test_degrees_minutes() {
        let north = DegreesMinutes::latitude(10.5);
        assert_eq!(north.degrees, 10);
        assert!((north.minutes - 30.0).abs() < 1e-9);
        assert_eq!(north.hemisphere, 'N');
        assert_eq!(north.format(2), "1030.0000");

        let south = DegreesMinutes::latitude(-10.5);
        assert_eq!(south.degrees, 10);
        assert!((south.minutes - 30.0).abs() < 1e-9);
        assert_eq!(south.hemisphere, 'S');

        let west = DegreesMinutes::longitude(-20.25);
        assert_eq!(west.format(3), "02015.0000");
        assert_eq!(west.hemisphere, 'W');
    }

    #[test]
    fn test_minutes_never_print_sixty() {
        let dm = DegreesMinutes::latitude(10.999_999_9);
        assert_eq!(dm.format(2), "1100.0000");
    }

    #[test]
    fn test_knots() {
        assert!((knots(100.0) - 53.9957).abs() < 1e-9);
        assert_eq!(format!("{:.4}", knots(100.0)), "53.9957");
    }

    #[test]
    fn test_command_text() {
        let command = FrcmdCommand::from_record(&record(), "F", 4).unwrap();
        assert_eq!(
            command.to_string(),
            "$FRCMD,860000000000001F,_SendMessage,,1030.0000,N,02015.0000,W,152,53.9957,270.5,\
             070324,140509.25,1,Button1=1,Button2=0,Button3=1,Button4=0,\
             Analog1=12.34,Analog2=0.00,Analog3=0.00,Analog4=0.00"
        );
    }

    #[test]
    fn test_missing_fields() {
        let mut no_position = record();
        no_position.position = None;
        assert!(matches!(
            FrcmdCommand::from_record(&no_position, "F", 4),
            Err(ForwardError::MissingField("latitude"))
        ));

        let mut no_identity = record();
        no_identity.identity = None;
        assert!(matches!(
            FrcmdCommand::from_record(&no_identity, "F", 4),
            Err(ForwardError::MissingField("identity"))
        ));
    }

    #[test]
    fn test_url_escapes_command() {
        let command = FrcmdCommand::from_record(&record(), "F", 4).unwrap();
        let url = command.to_url("http://gateway.local/api").unwrap();
        let query = url.query().unwrap();
        assert!(query.starts_with("cmd=%24FRCMD%2C860000000000001F%2C_SendMessage"));

        let (_, cmd) = url.query_pairs().next().unwrap();
        assert_eq!(cmd, command.to_string());

        assert!(matches!(
            command.to_url("::nope"),
            Err(ForwardError::InvalidTarget { .. })
        ));
    }
}
