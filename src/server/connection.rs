//! Per-connection framing loop.
//!
//! Frames on one connection are handled strictly in arrival order: ack,
//! classify, decode, enqueue. The codec's read buffer holds the residual tail
//! between socket reads.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use super::Pipeline;
use crate::config::ServerConfig;
use crate::error::{ErrorContext, LinkError, Result};
use crate::events::{Event, EventSink};
use crate::metrics::IngestStats;
use crate::protocol::{Frame, FrameCodec, FrameKind, RecordDecoder};
use crate::types::ConnectionId;

pub(crate) struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    pipeline: Arc<Pipeline>,
    decoder: RecordDecoder,
}

impl Connection {
    pub(crate) fn new(peer: SocketAddr, config: Arc<ServerConfig>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            config,
            pipeline,
            decoder: RecordDecoder::new(),
        }
    }

    /// Serve the connection until the peer leaves, an error occurs or
    /// shutdown is signalled. The session entry is removed on every path.
    pub(crate) async fn run(self, stream: TcpStream, mut shutdown: broadcast::Receiver<()>) {
        let stats = &self.pipeline.stats;
        stats.connection_opened();
        self.pipeline.sessions.open(self.id, self.peer);
        self.pipeline.events.publish(Event::ConnectionOpened {
            connection: self.id,
            peer: self.peer,
        });

        let codec = FrameCodec::with_max_payload(self.config.max_frame_payload);
        let mut framed = Framed::new(stream, codec);
        let idle = self.config.idle_timeout;

        let result: Result<()> = loop {
            let next = tokio::select! {
                next = tokio::time::timeout(idle, framed.next()) => next,
                _ = shutdown.recv() => break Ok(()),
            };

            match next {
                Err(_) => break Err(LinkError::IdleTimeout(idle).into()),
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(frame))) => {
                    if let Err(e) = self.on_frame(&mut framed, frame).await {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = result {
            IngestStats::incr(&stats.link_errors);
            let ctx = ErrorContext {
                connection: Some(self.id),
                peer_addr: Some(self.peer),
                operation: "read_frame",
            };
            warn!("Closing connection ({ctx}): {e}");
        }

        let identity = self.pipeline.sessions.close(self.id);
        stats.connection_closed();
        self.pipeline.events.publish(Event::ConnectionClosed {
            connection: self.id,
            peer: self.peer,
            identity,
        });
    }

    async fn on_frame(&self, framed: &mut Framed<TcpStream, FrameCodec>, frame: Frame) -> Result<()> {
        let stats = &self.pipeline.stats;
        let policy = self.config.checksum_policy;
        IngestStats::add(&stats.bytes_received, frame.wire_size() as u64);

        if policy.verifies() && !frame.checksum_ok() {
            IngestStats::incr(&stats.checksum_mismatches);
            warn!(
                conn = %self.id,
                peer = %self.peer,
                kind = frame.kind.as_str(),
                transmitted = format_args!("{:04X}", frame.checksum),
                computed = format_args!("{:04X}", frame.computed_checksum),
                "Checksum mismatch"
            );
        }
        if !policy.accepts(&frame) {
            IngestStats::incr(&stats.frames_refused);
            return Ok(());
        }

        // Ack before any decode or storage work
        framed.send(frame.ack()).await?;
        IngestStats::incr(&stats.acks_sent);

        match frame.kind {
            FrameKind::Main => {
                IngestStats::incr(&stats.frames_main);
                self.on_main(&frame);
            }
            FrameKind::Ignorable => {
                IngestStats::incr(&stats.frames_ignorable);
                self.pipeline.sessions.record_frame(self.id, 0);
                trace!(conn = %self.id, "Ignorable frame");
            }
            FrameKind::Extension(header) => {
                IngestStats::incr(&stats.frames_extension);
                self.pipeline.sessions.record_frame(self.id, 0);
                debug!(
                    conn = %self.id,
                    header = format_args!("0x{header:02X}"),
                    len = frame.payload.len(),
                    "Extension frame"
                );
            }
        }
        Ok(())
    }

    fn on_main(&self, frame: &Frame) {
        let pipeline = &self.pipeline;
        let stats = &pipeline.stats;

        let decoded = match self.decoder.decode_frame(
            &frame.payload,
            self.id,
            pipeline.sessions.as_ref(),
            Utc::now(),
        ) {
            Ok(decoded) => decoded,
            Err(e) => {
                IngestStats::incr(&stats.decode_errors);
                pipeline.sessions.record_frame(self.id, 0);
                warn!(
                    conn = %self.id,
                    peer = %self.peer,
                    len = frame.payload.len(),
                    "Dropping undecodable frame: {e}"
                );
                return;
            }
        };

        IngestStats::add(&stats.records_decoded, decoded.records.len() as u64);
        IngestStats::add(&stats.records_rejected, decoded.rejected as u64);
        pipeline.sessions.record_frame(self.id, decoded.records.len());

        if let Some(identity) = decoded.identity_changed {
            pipeline.events.publish(Event::DeviceUpdated {
                identity,
                connection: self.id,
                peer: self.peer,
            });
        }

        for record in decoded.records {
            if let Err(e) = pipeline.queue.enqueue(record) {
                warn!(conn = %self.id, "Record not queued: {e}");
            }
        }
    }
}
