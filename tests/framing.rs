//! Framing tests - a frame must be acknowledged exactly once however the
//! bytes are chunked on the wire.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::{TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

use gnss_relay::config::{Config, ServerConfig};
use gnss_relay::forwarder::{ForwarderConfig, ForwarderConfigHandle, HttpGatewayClient, MemoryForwardLog};
use gnss_relay::protocol::encode::{build_frame, main_frame};
use gnss_relay::protocol::{
    Ack, ChecksumPolicy, FrameCodec, FrameKind, TelemetryRecord, FRAME_IGNORABLE, FRAME_MAIN,
};
use gnss_relay::server::{IngestServer, Pipeline};
use gnss_relay::storage::MemoryStorage;
use gnss_relay::types::{DeviceIdentity, Position};

fn record(seq: u16) -> TelemetryRecord {
    TelemetryRecord {
        identity: Some(DeviceIdentity::new("860000000000001")),
        sequence: Some(seq),
        event_time: Utc.timestamp_opt(1_709_820_000, 0).single(),
        position: Some(Position::new(10.5, -20.25)),
        speed: Some(36.0),
        ..Default::default()
    }
}

struct Relay {
    addr: std::net::SocketAddr,
    storage: Arc<MemoryStorage>,
    pipeline: Arc<Pipeline>,
    shutdown: tokio::sync::broadcast::Sender<()>,
}

async fn start(policy: ChecksumPolicy) -> (std::net::SocketAddr, Arc<MemoryStorage>, tokio::sync::broadcast::Sender<()>) {
    let relay = start_with(ServerConfig {
        checksum_policy: policy,
        ..Default::default()
    })
    .await;
    (relay.addr, relay.storage, relay.shutdown)
}

async fn start_with(server: ServerConfig) -> Relay {
    let mut config = Config::default();
    config.queue.poll_interval = Duration::from_millis(1);
    config.server = ServerConfig {
        listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
        shutdown_grace: Duration::from_secs(1),
        ..server
    };

    let storage = Arc::new(MemoryStorage::new());
    let pipeline = Arc::new(Pipeline::new(
        &config,
        storage.clone(),
        Arc::new(HttpGatewayClient::new()),
        Arc::new(MemoryForwardLog::new()),
        ForwarderConfigHandle::new(ForwarderConfig::default()),
    ));
    let server = IngestServer::bind(config.server.clone(), Arc::clone(&pipeline)).await.unwrap();
    let addr = server.local_addrs()[0];
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.run());
    Relay {
        addr,
        storage,
        pipeline,
        shutdown,
    }
}

async fn read_ack(stream: &mut TcpStream) -> [u8; Ack::SIZE] {
    let mut ack = [0u8; Ack::SIZE];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut ack))
        .await
        .expect("ack timed out")
        .unwrap();
    ack
}

async fn wait_for_records(storage: &MemoryStorage, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while storage.len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("records were not stored in time");
}

// ============================================================================
// Codec
// ============================================================================

#[test]
fn test_byte_at_a_time_yields_one_frame() {
    let wire = main_frame(&[record(1), record(2)]).unwrap();
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();

    for byte in &wire {
        buf.extend_from_slice(&[*byte]);
        if let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
    }

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].wire_size(), wire.len());
    assert_eq!(frames[0].kind, FrameKind::Main);
    assert!(frames[0].checksum_ok());
    assert!(buf.is_empty());
}

#[test]
fn test_back_to_back_frames_in_one_read() {
    let first = main_frame(&[record(1)]).unwrap();
    let second = build_frame(FRAME_IGNORABLE, &[], false);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&second);
    buf.extend_from_slice(&first[..4]);

    let mut codec = FrameCodec::new();
    let a = codec.decode(&mut buf).unwrap().unwrap();
    let b = codec.decode(&mut buf).unwrap().unwrap();
    assert!(codec.decode(&mut buf).unwrap().is_none());

    assert_eq!(a.kind, FrameKind::Main);
    assert_eq!(b.kind, FrameKind::Ignorable);
    assert_eq!(buf.len(), 4, "partial third frame stays buffered");
}

// ============================================================================
// Over TCP
// ============================================================================

#[tokio::test]
async fn test_chunked_frame_acked_once() {
    let (addr, storage, shutdown) = start(ChecksumPolicy::Warn).await;
    let wire = main_frame(&[record(1)]).unwrap();
    let expected = [0x02, wire[wire.len() - 2], wire[wire.len() - 1]];

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    for byte in &wire {
        stream.write_all(&[*byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(read_ack(&mut stream).await, expected);

    // Nothing else should follow
    let mut extra = [0u8; 1];
    let more = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut extra)).await;
    assert!(more.is_err(), "only one ack expected");

    wait_for_records(&storage, 1).await;
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_ignorable_frame_acked_without_records() {
    let (addr, storage, shutdown) = start(ChecksumPolicy::Warn).await;
    let wire = build_frame(FRAME_IGNORABLE, &[0xAA, 0xBB], false);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&wire).await.unwrap();

    let ack = read_ack(&mut stream).await;
    assert_eq!(ack, [0x02, wire[5], wire[6]]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(storage.is_empty());
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_reject_policy_withholds_ack() {
    let (addr, storage, shutdown) = start(ChecksumPolicy::Reject).await;
    let mut corrupted = main_frame(&[record(1)]).unwrap();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xFF;
    let good = main_frame(&[record(2)]).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&corrupted).await.unwrap();
    stream.write_all(&good).await.unwrap();

    // The first ack on the wire belongs to the intact frame
    let ack = read_ack(&mut stream).await;
    assert_eq!(ack, [0x02, good[good.len() - 2], good[good.len() - 1]]);

    wait_for_records(&storage, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.len(), 1);
    assert_eq!(storage.all()[0].record.sequence, Some(2));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_undecodable_frame_acked_and_link_kept() {
    let relay = start_with(ServerConfig::default()).await;
    // Sequence tag followed by a tag id missing from the dictionary
    let broken = build_frame(FRAME_MAIN, &[0x10, 0x01, 0x00, 0xFF], false);
    let good = main_frame(&[record(7)]).unwrap();

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.write_all(&broken).await.unwrap();
    let ack = read_ack(&mut stream).await;
    assert_eq!(ack, [0x02, broken[broken.len() - 2], broken[broken.len() - 1]]);

    stream.write_all(&good).await.unwrap();
    let ack = read_ack(&mut stream).await;
    assert_eq!(ack, [0x02, good[good.len() - 2], good[good.len() - 1]]);

    wait_for_records(&relay.storage, 1).await;
    assert_eq!(relay.storage.all()[0].record.sequence, Some(7));

    let stats = relay.pipeline.stats.snapshot();
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(stats.link_errors, 0);
    assert_eq!(relay.pipeline.sessions.len(), 1);
    let _ = relay.shutdown.send(());
}

#[tokio::test]
async fn test_oversized_length_closes_link() {
    let relay = start_with(ServerConfig {
        max_frame_payload: 256,
        ..Default::default()
    })
    .await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.write_all(&[0x01, 0xFF, 0x7F]).await.unwrap();

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection should close");
    assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");

    tokio::time::timeout(Duration::from_secs(2), async {
        while !relay.pipeline.sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session should be removed");
    assert_eq!(relay.pipeline.stats.snapshot().link_errors, 1);
    assert!(relay.storage.is_empty());
    let _ = relay.shutdown.send(());
}
