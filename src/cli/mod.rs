//! Command-line interface for gnss-relay.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::protocol::ChecksumPolicy;

/// gnss-relay - GNSS tracker ingestion and gateway forwarding
#[derive(Parser, Debug)]
#[command(
    name = "gnss-relay",
    author,
    version,
    about = "Ingestion server for tag-encoded GNSS tracker telemetry",
    long_about = r#"
gnss-relay accepts persistent TCP connections from GNSS trackers, acknowledges
and decodes their tag-encoded frames, stores the resulting records and forwards
them to a partner gateway as $FRCMD commands over HTTP.

QUICK START:
  Server:   gnss-relay serve --listen 0.0.0.0:7001
  Inspect:  gnss-relay decode 01 1a 00 03 38 36 30 ...
  Config:   gnss-relay config --output gnss-relay.toml
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "GNSS_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log format
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingestion server
    Serve(ServeArgs),

    /// Decode a captured frame given as hex and print its records as JSON
    Decode(DecodeArgs),

    /// Show example configuration
    Config(ConfigArgs),
}

/// Serve command arguments. Each one overrides the configuration file.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Listen addresses (can be specified multiple times)
    #[arg(long)]
    pub listen: Vec<SocketAddr>,

    /// Maximum concurrent device connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Checksum handling
    #[arg(long)]
    pub checksum_policy: Option<ChecksumPolicyArg>,

    /// Forwarder configuration file, reloaded on SIGHUP
    #[arg(long)]
    pub forwarder_config: Option<PathBuf>,

    /// Forward audit log (JSON lines)
    #[arg(long)]
    pub forward_log: Option<PathBuf>,

    /// Metrics HTTP bind address
    #[arg(long)]
    pub metrics_bind: Option<SocketAddr>,

    /// Disable the metrics HTTP server
    #[arg(long)]
    pub no_metrics: bool,
}

/// Decode command arguments
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Frame bytes in hex; whitespace is ignored
    #[arg(required = true, num_args = 1..)]
    pub hex: Vec<String>,

    /// Identity to inherit for records without one
    #[arg(long)]
    pub identity: Option<String>,

    /// Print compact JSON
    #[arg(long)]
    pub compact: bool,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print only the forwarder section
    #[arg(long)]
    pub forwarder: bool,

    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Device simulator arguments
#[derive(Parser, Debug)]
#[command(
    name = "device-sim",
    version,
    about = "Play a synthetic GNSS track against a gnss-relay server"
)]
pub struct SimArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7001")]
    pub server: SocketAddr,

    /// Device IMEI (15 digits)
    #[arg(long, default_value = "860000000000001")]
    pub imei: String,

    /// Frames to send
    #[arg(short = 'n', long, default_value = "10")]
    pub frames: u32,

    /// Records packed into each frame
    #[arg(long, default_value = "2")]
    pub records_per_frame: usize,

    /// Delay between frames
    #[arg(long, default_value = "1s", value_parser = humantime_duration)]
    pub interval: Duration,

    /// Starting latitude
    #[arg(long, default_value = "55.7558", allow_hyphen_values = true)]
    pub lat: f64,

    /// Starting longitude
    #[arg(long, default_value = "37.6173", allow_hyphen_values = true)]
    pub lon: f64,

    /// Cruise speed, km/h
    #[arg(long, default_value = "60")]
    pub speed: f64,

    /// Send the IMEI in every frame instead of only the first
    #[arg(long)]
    pub always_identify: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }
}

/// Checksum policy as a CLI value
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChecksumPolicyArg {
    Ignore,
    Warn,
    Reject,
}

impl From<ChecksumPolicyArg> for ChecksumPolicy {
    fn from(arg: ChecksumPolicyArg) -> Self {
        match arg {
            ChecksumPolicyArg::Ignore => ChecksumPolicy::Ignore,
            ChecksumPolicyArg::Warn => ChecksumPolicy::Warn,
            ChecksumPolicyArg::Reject => ChecksumPolicy::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from([
            "gnss-relay",
            "serve",
            "--listen",
            "127.0.0.1:7001",
            "--checksum-policy",
            "reject",
        ]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.listen.len(), 1);
                assert_eq!(args.checksum_policy, Some(ChecksumPolicyArg::Reject));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_decode_joins_hex_words() {
        let cli = Cli::parse_from(["gnss-relay", "decode", "01 02", "00", "--identity", "x"]);
        match cli.command {
            Commands::Decode(args) => {
                assert_eq!(args.hex, vec!["01 02", "00"]);
                assert_eq!(args.identity.as_deref(), Some("x"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_sim_defaults() {
        let args = SimArgs::parse_from(["device-sim", "--interval", "250ms", "--lat", "-33.9"]);
        assert_eq!(args.interval, Duration::from_millis(250));
        assert!((args.lat + 33.9).abs() < f64::EPSILON);
        assert_eq!(args.records_per_frame, 2);
    }
}
