//! Sensor transport adapters.
//!
//! A [`FrameSource`] connects some depth-sensor transport to the bus: it
//! turns whatever the transport delivers into [`SensorFrame`]s and publishes
//! them on [`Topic::SensorFrames`], where the pipeline picks them up.
//!
//! [`JsonLinesIngest`] is the built-in source.  It listens on a TCP socket
//! and accepts one JSON-encoded [`SensorFrame`] per line from any number of
//! producers, so a camera driver or a bag replayer in another process can feed
//! the node with nothing more than a socket and a serializer.
//!
//! ```text
//! {"stamp":"2026-01-01T00:00:00Z","frame_id":"/kinect","cloud":{...}}\n
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use perch_types::{Event, EventPayload, PerchError, SensorFrame};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Topic};

/// How often an idle accept loop re-checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Anything that can feed depth frames onto the bus.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Publish frames on [`Topic::SensorFrames`] until the source is exhausted
    /// or `shutdown` is set.
    async fn run(&self, bus: EventBus, shutdown: Arc<AtomicBool>) -> Result<(), PerchError>;
}

/// TCP listener accepting newline-delimited JSON [`SensorFrame`]s.
#[derive(Debug)]
pub struct JsonLinesIngest {
    listener: TcpListener,
}

impl JsonLinesIngest {
    /// Bind the ingest socket.
    pub async fn bind(addr: &str) -> Result<Self, PerchError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PerchError::Channel(format!("cannot bind frame ingest on {addr}: {e}")))?;
        Ok(Self { listener })
    }

    /// Address actually bound, useful when binding port `0`.
    pub fn local_addr(&self) -> Result<SocketAddr, PerchError> {
        self.listener
            .local_addr()
            .map_err(|e| PerchError::Channel(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for JsonLinesIngest {
    async fn run(&self, bus: EventBus, shutdown: Arc<AtomicBool>) -> Result<(), PerchError> {
        info!(addr = ?self.listener.local_addr().ok(), "frame ingest listening");
        while !shutdown.load(Ordering::SeqCst) {
            let accepted = match tokio::time::timeout(SHUTDOWN_POLL, self.listener.accept()).await {
                Err(_) => continue,
                Ok(accepted) => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "frame producer connected");
                    tokio::spawn(forward_frames(stream, bus.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "frame ingest accept failed"),
            }
        }
        Ok(())
    }
}

/// Parse one connection's lines into frames until the peer hangs up.
async fn forward_frames(stream: TcpStream, bus: EventBus, shutdown: Arc<AtomicBool>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "frame producer read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SensorFrame>(&line) {
            Ok(frame) => {
                let event = Event::new("frame_ingest", EventPayload::SensorFrame(frame));
                if let Err(e) = bus.publish_to(Topic::SensorFrames, event) {
                    debug!(error = %e, "frame dropped");
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed frame line"),
        }
    }
    debug!("frame producer disconnected");
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
