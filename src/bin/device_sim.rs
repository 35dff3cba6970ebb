//! Device simulator.
//!
//! Connects to a gnss-relay server and plays a synthetic track as a tracker
//! would: several records per main frame, identity only in the first frame,
//! and a check of every acknowledgement.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use clap::Parser;
use colored::Colorize;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use gnss_relay::cli::SimArgs;
use gnss_relay::config::{init_logging, LoggingConfig};
use gnss_relay::error::{Error, LinkError, Result};
use gnss_relay::protocol::{encode, Ack, Frame, TelemetryRecord, FRAME_ACK};
use gnss_relay::types::{DeviceIdentity, Position};

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Metres per degree of latitude.
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Synthetic vehicle moving along a wandering heading.
struct Track {
    lat: f64,
    lon: f64,
    course: f64,
    speed: f64,
    sequence: u16,
}

impl Track {
    fn new(args: &SimArgs) -> Self {
        Self {
            lat: args.lat,
            lon: args.lon,
            course: 90.0,
            speed: args.speed,
            sequence: 0,
        }
    }

    /// Advance by `elapsed` and produce a fix.
    fn step(&mut self, rng: &mut impl Rng, elapsed: Duration, at: DateTime<Utc>) -> TelemetryRecord {
        self.course = (self.course + rng.gen_range(-15.0..15.0)).rem_euclid(360.0);
        let speed = (self.speed + rng.gen_range(-5.0..5.0)).max(0.0);

        let metres = speed / 3.6 * elapsed.as_secs_f64();
        let heading = self.course.to_radians();
        self.lat += metres * heading.cos() / METRES_PER_DEGREE;
        self.lon += metres * heading.sin() / (METRES_PER_DEGREE * self.lat.to_radians().cos());
        self.sequence = self.sequence.wrapping_add(1);

        let mut record = TelemetryRecord {
            sequence: Some(self.sequence),
            event_time: Some(at.trunc_subsecs(0)),
            milliseconds: Some(at.timestamp_subsec_millis() as u16),
            position: Some(Position::new(self.lat, self.lon)),
            satellites: Some(rng.gen_range(6..12)),
            speed: Some((speed * 10.0).round() / 10.0),
            course: Some((self.course * 10.0).round() / 10.0),
            altitude: Some(rng.gen_range(140..160)),
            hdop: Some(0.9),
            supply_voltage: Some(rng.gen_range(12_000..12_600)),
            battery_voltage: Some(4_100),
            inputs: Some(u16::from(rng.gen_bool(0.1))),
            ..Default::default()
        };
        record.analog_inputs[0] = Some(rng.gen_range(0..5_000));
        record
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = SimArgs::parse();
    init_logging(&LoggingConfig {
        level: args.log_level.clone(),
        ..Default::default()
    })?;

    if args.records_per_frame == 0 {
        return Err(Error::InvalidConfig("records-per-frame must be at least 1".into()));
    }

    let mut stream = TcpStream::connect(args.server).await?;
    stream.set_nodelay(true)?;
    info!("Connected to {}", args.server);

    let identity = DeviceIdentity::new(args.imei.as_str());
    let mut track = Track::new(&args);
    let mut rng = rand::thread_rng();
    let step = args.interval / args.records_per_frame as u32;
    let mut acked = 0u32;

    for n in 0..args.frames {
        let now = Utc::now();
        let mut records: Vec<TelemetryRecord> = (0..args.records_per_frame)
            .map(|i| {
                let behind = step * (args.records_per_frame - 1 - i) as u32;
                let at = now - chrono::Duration::from_std(behind).unwrap_or_else(|_| chrono::Duration::zero());
                track.step(&mut rng, step, at)
            })
            .collect();
        if n == 0 || args.always_identify {
            records[0].identity = Some(identity.clone());
        }

        let Some(bytes) = encode::main_frame(&records) else {
            warn!(frame = n, "Records do not fit in one frame, skipping");
            continue;
        };
        let frame = Frame::from_wire(bytes.clone().into())?;

        stream.write_all(&bytes).await?;
        debug!(frame = n, len = bytes.len(), records = records.len(), "Sent frame");

        let mut ack = [0u8; Ack::SIZE];
        tokio::time::timeout(ACK_TIMEOUT, stream.read_exact(&mut ack))
            .await
            .map_err(|_| LinkError::IdleTimeout(ACK_TIMEOUT))??;

        if ack[0] == FRAME_ACK && ack == frame.ack().to_bytes() {
            acked += 1;
            info!(
                frame = n,
                lat = format_args!("{:.6}", track.lat),
                lon = format_args!("{:.6}", track.lon),
                "Acknowledged"
            );
        } else {
            warn!(frame = n, ack = %hex::encode(ack), "Unexpected acknowledgement");
        }

        tokio::time::sleep(args.interval).await;
    }

    println!(
        "{} {acked}/{} frames acknowledged",
        "✓".green(),
        args.frames
    );
    Ok(())
}
