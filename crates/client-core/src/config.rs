//! Phone configuration
//!
//! [`PhoneConfig`] carries everything a [`crate::Phone`] needs at
//! construction: registrar, credentials, the local media port range and the
//! codecs this endpoint is willing to negotiate. Call forwarding is optional
//! and configured per phone instance.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use softphone_media_core::MediaSettings;
use softphone_rtp_core::PayloadType;

use crate::error::{ClientError, ClientResult};

/// Default local RTP port range
pub const DEFAULT_RTP_PORT_RANGE: RangeInclusive<u16> = 10000..=15000;

/// Default range session identifiers are drawn from
pub const DEFAULT_SESSION_ID_RANGE: RangeInclusive<u32> = 1..=100_000;

/// Unsolicited redirect of inbound calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ForwardingConfig {
    /// Number calls are redirected to
    pub number: String,
    /// Seconds an inbound call rings before it is forwarded
    pub delay_secs: u64,
    /// Forwarding timer armed for new inbound calls
    pub enabled: bool,
}

impl ForwardingConfig {
    pub fn new(number: impl Into<String>, delay: Duration) -> Self {
        Self {
            number: number.into(),
            delay_secs: delay.as_secs(),
            enabled: true,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// True when a forward timer should be scheduled
    pub fn is_armed(&self) -> bool {
        self.enabled && !self.number.is_empty()
    }
}

/// Configuration for a [`crate::Phone`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneConfig {
    pub server_host: String,
    pub server_port: u16,
    pub username: String,
    pub password: String,

    /// Address media sockets bind to
    pub local_ip: IpAddr,

    /// Local RTP ports, drawn at random per media leg
    pub rtp_port_range: RangeInclusive<u16>,

    pub session_id_range: RangeInclusive<u32>,

    /// Random draws tried before a pool reports exhaustion
    pub max_allocation_attempts: usize,

    /// Codecs accepted during negotiation
    pub supported_codecs: Vec<PayloadType>,

    /// Pause between forcing hold and sending a transfer
    pub transfer_settle_ms: u64,

    pub forwarding: Option<ForwardingConfig>,

    pub media: MediaSettings,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 5060,
            username: String::new(),
            password: String::new(),
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rtp_port_range: DEFAULT_RTP_PORT_RANGE,
            session_id_range: DEFAULT_SESSION_ID_RANGE,
            max_allocation_attempts: 1000,
            supported_codecs: vec![PayloadType::Pcmu, PayloadType::Pcma, PayloadType::TelephoneEvent],
            transfer_settle_ms: 500,
            forwarding: None,
            media: MediaSettings::default(),
        }
    }
}

impl PhoneConfig {
    pub fn new(server_host: impl Into<String>, server_port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = ip;
        self
    }

    pub fn with_rtp_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.rtp_port_range = range;
        self
    }

    pub fn with_session_id_range(mut self, range: RangeInclusive<u32>) -> Self {
        self.session_id_range = range;
        self
    }

    pub fn with_supported_codecs(mut self, codecs: Vec<PayloadType>) -> Self {
        self.supported_codecs = codecs;
        self
    }

    pub fn with_forwarding(mut self, forwarding: ForwardingConfig) -> Self {
        self.forwarding = Some(forwarding);
        self
    }

    pub fn with_media_settings(mut self, media: MediaSettings) -> Self {
        self.media = media;
        self
    }

    pub fn with_transfer_settle(mut self, settle: Duration) -> Self {
        self.transfer_settle_ms = settle.as_millis() as u64;
        self
    }

    pub fn transfer_settle(&self) -> Duration {
        Duration::from_millis(self.transfer_settle_ms)
    }

    /// Check the configuration before a phone is built from it
    pub fn validate(&self) -> ClientResult<()> {
        if self.rtp_port_range.is_empty() {
            return Err(ClientError::invalid_configuration(
                "rtp_port_range",
                format!("{}..={} is empty", self.rtp_port_range.start(), self.rtp_port_range.end()),
            ));
        }
        if *self.rtp_port_range.start() == 0 {
            return Err(ClientError::invalid_configuration("rtp_port_range", "port 0 is not assignable"));
        }
        if self.session_id_range.is_empty() {
            return Err(ClientError::invalid_configuration("session_id_range", "range is empty"));
        }
        if self.max_allocation_attempts == 0 {
            return Err(ClientError::invalid_configuration("max_allocation_attempts", "must be at least 1"));
        }
        if !self.supported_codecs.iter().any(PayloadType::is_audio) {
            return Err(ClientError::invalid_configuration("supported_codecs", "no audio codec"));
        }
        if let Some(forwarding) = &self.forwarding {
            if forwarding.enabled && forwarding.number.is_empty() {
                return Err(ClientError::invalid_configuration("forwarding.number", "forwarding enabled without a target"));
            }
        }
        Ok(())
    }
}
