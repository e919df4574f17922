//! Media stream configuration

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use softphone_rtp_core::PayloadAssociation;

/// Direction of a negotiated media leg (SDP `a=sendrecv` and friends)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransmitMode {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransmitMode {
    pub fn attribute(&self) -> &'static str {
        match self {
            TransmitMode::SendRecv => "sendrecv",
            TransmitMode::SendOnly => "sendonly",
            TransmitMode::RecvOnly => "recvonly",
            TransmitMode::Inactive => "inactive",
        }
    }

    pub fn from_attribute(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sendrecv" => Some(TransmitMode::SendRecv),
            "sendonly" => Some(TransmitMode::SendOnly),
            "recvonly" => Some(TransmitMode::RecvOnly),
            "inactive" => Some(TransmitMode::Inactive),
            _ => None,
        }
    }

    pub fn can_send(&self) -> bool {
        matches!(self, TransmitMode::SendRecv | TransmitMode::SendOnly)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, TransmitMode::SendRecv | TransmitMode::RecvOnly)
    }

    /// Our direction when answering a peer that offered `self`
    pub fn answer(&self) -> Self {
        match self {
            TransmitMode::SendOnly => TransmitMode::RecvOnly,
            TransmitMode::RecvOnly => TransmitMode::SendOnly,
            other => *other,
        }
    }
}

impl fmt::Display for TransmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.attribute())
    }
}

/// Timing and buffering knobs shared by every stream of a phone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSettings {
    /// Payload bytes per outbound packet (20 ms of 8 kHz G.711)
    pub frame_size: usize,
    pub packet_interval_ms: u64,
    /// How often a held stream sends a keepalive packet
    pub keepalive_interval_ms: u64,
    pub keepalive_payload_type: u8,
    /// Byte used to pad reads and fill receive gaps
    pub silence_byte: u8,
    /// Timestamp jump that forces the receive buffer to resynchronise
    pub resync_threshold: u32,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            frame_size: 160,
            packet_interval_ms: 20,
            keepalive_interval_ms: 10_000,
            keepalive_payload_type: softphone_rtp_core::payload::KEEPALIVE_PT,
            silence_byte: 0xFF,
            resync_threshold: 100_000,
        }
    }
}

impl MediaSettings {
    pub fn packet_interval(&self) -> Duration {
        Duration::from_millis(self.packet_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn with_packet_interval(mut self, interval: Duration) -> Self {
        self.packet_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = interval.as_millis() as u64;
        self
    }
}

/// Everything one media stream needs to run
#[derive(Debug, Clone)]
pub struct MediaStreamConfig {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub association: PayloadAssociation,
    pub transmit_mode: TransmitMode,
    pub settings: MediaSettings,
}

impl MediaStreamConfig {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, association: PayloadAssociation) -> Self {
        Self {
            local_addr,
            remote_addr,
            association,
            transmit_mode: TransmitMode::default(),
            settings: MediaSettings::default(),
        }
    }

    pub fn with_transmit_mode(mut self, mode: TransmitMode) -> Self {
        self.transmit_mode = mode;
        self
    }

    pub fn with_settings(mut self, settings: MediaSettings) -> Self {
        self.settings = settings;
        self
    }
}
