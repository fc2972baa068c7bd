//! Periodic telemetry stream
//!
//! Once a second the server sends every joined peer with a registered
//! stream address a `PingStream` datagram carrying a millisecond stamp and
//! the round trips of all joined peers. Peers echo the stamp straight back,
//! which yields their round trip on arrival.

use crate::client_manager::ClientManager;
use shared::ServerPacket;
use std::time::{Duration, Instant};

/// How often stream packets go out
pub const STREAM_INTERVAL: Duration = Duration::from_secs(1);

/// Millisecond clock the stream stamps are taken from
#[derive(Debug, Clone, Copy)]
pub struct StreamClock {
    started: Instant,
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Milliseconds since start, wrapping at `u32::MAX`
    pub fn now_ms(&self) -> u32 {
        stamp_from(self.started.elapsed())
    }

    /// Stamp for an outgoing stream packet. Never 0, since 0 marks a
    /// registration datagram.
    pub fn stamp(&self) -> u32 {
        self.now_ms().max(1)
    }
}

fn stamp_from(elapsed: Duration) -> u32 {
    (elapsed.as_millis() % (u128::from(u32::MAX) + 1)) as u32
}

/// Round trip from an echoed stamp, saturating into `u16`
pub fn round_trip(now_ms: u32, stamp: u32) -> u16 {
    u16::try_from(now_ms.wrapping_sub(stamp)).unwrap_or(u16::MAX)
}

/// The stream packet for the current roster
pub fn stream_packet(clients: &ClientManager, stamp: u32) -> ServerPacket {
    ServerPacket::PingStream {
        stamp,
        rtts: clients.rtts(),
    }
}
