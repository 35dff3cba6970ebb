//! gnss-relay CLI - GNSS tracker ingestion server.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use tracing::{error, info, warn};

use gnss_relay::cli::*;
use gnss_relay::config::{init_logging, Config, LoggingConfig};
use gnss_relay::error::{Error, Result};
use gnss_relay::forwarder::{
    FileConfigStore, ForwardLog, ForwarderConfigHandle, ForwarderConfigStore, HttpGatewayClient,
    JsonlForwardLog, MemoryForwardLog,
};
use gnss_relay::protocol::{Frame, FrameKind, IdentityContext, RecordDecoder};
use gnss_relay::server::{IngestServer, Pipeline, SessionTable, SignalHandler};
use gnss_relay::storage::MemoryStorage;
use gnss_relay::types::{ConnectionId, DeviceIdentity};
use gnss_relay::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format.as_str().to_string(),
        color: !cli.no_color,
    };
    init_logging(&log_config)?;

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Serve(args) => run_serve(args, config).await,
        Commands::Decode(args) => run_decode(&args),
        Commands::Config(args) => run_config(&args),
    }
}

/// Run the ingestion server
async fn run_serve(args: ServeArgs, mut config: Config) -> Result<()> {
    apply_overrides(&args, &mut config);
    config.validate()?;

    println!("{}", "╔══════════════════════════════════════════╗".bright_cyan());
    println!("{}", "║     GNSS RELAY                           ║".bright_cyan());
    println!("{}", format!("║     Version {VERSION:<29}║").bright_cyan());
    println!("{}", "╚══════════════════════════════════════════╝".bright_cyan());
    println!();

    // Forwarder configuration: the file wins over the main config section
    let store = config.server.forwarder_config_path.clone().map(FileConfigStore::new);
    let initial = match &store {
        Some(store) if store.path().exists() => store.get().await?,
        Some(store) => {
            store.update(&config.forwarder).await?;
            config.forwarder.clone()
        }
        None => config.forwarder.clone(),
    };
    initial.validate()?;
    let forwarder_config = ForwarderConfigHandle::new(initial);

    let forward_log: Arc<dyn ForwardLog> = match &config.server.forward_log_path {
        Some(path) => Arc::new(JsonlForwardLog::new(path)),
        None => {
            warn!("No forward_log_path configured, forward audit log kept in memory");
            Arc::new(MemoryForwardLog::new())
        }
    };

    warn!("Using in-memory storage; records are lost on restart");
    let pipeline = Arc::new(Pipeline::new(
        &config,
        Arc::new(MemoryStorage::new()),
        Arc::new(HttpGatewayClient::new()),
        forward_log,
        forwarder_config.clone(),
    ));

    let server = IngestServer::bind(config.server.clone(), Arc::clone(&pipeline)).await?;

    println!("{}", "Listening on:".bright_white());
    for addr in server.local_addrs() {
        println!("  {} {}", "→".cyan(), addr);
    }
    println!();

    #[cfg(feature = "metrics")]
    let metrics_server = if config.metrics.enabled {
        Some(start_metrics(&config, Arc::clone(&pipeline))?)
    } else {
        None
    };

    let signals = SignalHandler::new();
    if let Some(store) = store {
        let handle = forwarder_config.clone();
        signals.set_reload_callback(move || {
            let handle = handle.clone();
            let store = store.clone();
            tokio::spawn(async move {
                match handle.reload(&store).await {
                    Ok(version) => info!(version, "Forwarder configuration reloaded"),
                    Err(e) => error!("Forwarder configuration reload failed: {e}"),
                }
            });
        });
    }

    let listener = signals.clone();
    tokio::spawn(async move { listener.listen().await });

    let shutdown = server.shutdown_handle();
    let waiter = signals.clone();
    tokio::spawn(async move {
        waiter.wait_for_shutdown().await;
        let _ = shutdown.send(());
    });

    server.run().await?;

    #[cfg(feature = "metrics")]
    if let Some(metrics_server) = metrics_server {
        metrics_server.stop();
    }

    println!("{} Server stopped", "✓".green());
    Ok(())
}

fn apply_overrides(args: &ServeArgs, config: &mut Config) {
    if !args.listen.is_empty() {
        config.server.listen_addrs.clone_from(&args.listen);
    }
    if let Some(max) = args.max_connections {
        config.server.max_connections = max;
    }
    if let Some(policy) = args.checksum_policy {
        config.server.checksum_policy = policy.into();
    }
    if let Some(ref path) = args.forwarder_config {
        config.server.forwarder_config_path = Some(path.clone());
    }
    if let Some(ref path) = args.forward_log {
        config.server.forward_log_path = Some(path.clone());
    }
    if let Some(bind) = args.metrics_bind {
        config.metrics.http_bind = bind.to_string();
    }
    if args.no_metrics {
        config.metrics.enabled = false;
    }
}

#[cfg(feature = "metrics")]
fn start_metrics(
    config: &Config,
    pipeline: Arc<Pipeline>,
) -> Result<Arc<gnss_relay::metrics::MetricsHttpServer>> {
    use gnss_relay::metrics::{MetricsHttpServer, PrometheusMetrics};

    let addr: SocketAddr = config
        .metrics
        .http_bind
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("metrics.http_bind: {e}")))?;
    let metrics = PrometheusMetrics::new()
        .map_err(|e| Error::Config(format!("Failed to register metrics: {e}")))?;

    let server = Arc::new(MetricsHttpServer::new(addr, Arc::new(metrics), pipeline));
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = running.start().await {
            error!("Metrics HTTP server failed: {e}");
        }
    });
    println!("{} Metrics on http://{addr}/metrics", "→".cyan());
    Ok(server)
}

/// Decode a captured frame and print it as JSON
fn run_decode(args: &DecodeArgs) -> Result<()> {
    let frame = Frame::from_hex(&args.hex.join(""))?;

    let mut output = serde_json::json!({
        "kind": frame.kind.as_str(),
        "header": format!("0x{:02X}", frame.kind.header()),
        "archive_flag": frame.archive_flag,
        "payload_len": frame.payload.len(),
        "checksum": format!("{:04X}", frame.checksum),
        "computed_checksum": format!("{:04X}", frame.computed_checksum),
        "checksum_ok": frame.checksum_ok(),
        "ack": hex::encode(frame.ack().to_bytes()),
    });

    if frame.kind == FrameKind::Main {
        let sessions = SessionTable::new();
        let conn = ConnectionId::new();
        sessions.open(conn, SocketAddr::from(([0, 0, 0, 0], 0)));
        if let Some(ref identity) = args.identity {
            sessions.remember_identity(conn, &DeviceIdentity::new(identity.as_str()));
        }

        let decoded = RecordDecoder::new().decode_frame(&frame.payload, conn, &sessions, Utc::now())?;
        output["records"] = serde_json::to_value(&decoded.records)
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        output["rejected"] = decoded.rejected.into();
    }

    let text = if args.compact {
        serde_json::to_string(&output)
    } else {
        serde_json::to_string_pretty(&output)
    }
    .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
    println!("{text}");

    Ok(())
}

/// Print or write the example configuration
fn run_config(args: &ConfigArgs) -> Result<()> {
    let config = Config::example();

    let output = if args.forwarder {
        toml::to_string_pretty(&config.forwarder)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?
    } else {
        config.to_toml()?
    };

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{output}");
    }

    Ok(())
}
