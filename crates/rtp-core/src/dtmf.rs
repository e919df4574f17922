//! RFC 4733 telephone-event payloads

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Size of a telephone-event payload
pub const DTMF_EVENT_SIZE: usize = 4;

/// Volume sent with outbound events (-10 dBm0)
pub const DEFAULT_DTMF_VOLUME: u8 = 10;

/// Duration sent with outbound events, in timestamp units
pub const DEFAULT_DTMF_DURATION: u16 = 800;

/// DTMF tone definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtmfTone {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfTone {
    const ALL: [DtmfTone; 16] = [
        Self::Digit0,
        Self::Digit1,
        Self::Digit2,
        Self::Digit3,
        Self::Digit4,
        Self::Digit5,
        Self::Digit6,
        Self::Digit7,
        Self::Digit8,
        Self::Digit9,
        Self::Star,
        Self::Pound,
        Self::A,
        Self::B,
        Self::C,
        Self::D,
    ];

    /// Event code on the wire: digits map to themselves, `*` to 10, `#` to 11
    pub fn code(self) -> u8 {
        Self::ALL.iter().position(|t| *t == self).unwrap_or(0) as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn to_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            d @ '0'..='9' => Self::from_code(d as u8 - b'0'),
            '*' => Some(Self::Star),
            '#' => Some(Self::Pound),
            'A' => Some(Self::A),
            'B' => Some(Self::B),
            'C' => Some(Self::C),
            'D' => Some(Self::D),
            _ => None,
        }
    }
}

/// One telephone-event payload (RFC 4733 section 2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub tone: DtmfTone,
    /// E bit: last packet of the event
    pub end: bool,
    /// Power level in -dBm0, 6 bits
    pub volume: u8,
    pub duration: u16,
}

impl DtmfEvent {
    /// The event a phone sends for a key press
    pub fn key_press(tone: DtmfTone) -> Self {
        Self {
            tone,
            end: true,
            volume: DEFAULT_DTMF_VOLUME,
            duration: DEFAULT_DTMF_DURATION,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < DTMF_EVENT_SIZE {
            return Err(Error::BufferTooSmall {
                required: DTMF_EVENT_SIZE,
                available: payload.len(),
            });
        }

        let mut buf = payload;
        let code = buf.get_u8();
        let flags = buf.get_u8();
        let duration = buf.get_u16();

        let tone = DtmfTone::from_code(code)
            .ok_or_else(|| Error::InvalidPacket(format!("Unsupported telephone event code: {}", code)))?;

        Ok(Self {
            tone,
            end: flags & 0x80 != 0,
            volume: flags & 0x3F,
            duration,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DTMF_EVENT_SIZE);
        buf.put_u8(self.tone.code());
        let end_bit = if self.end { 0x80 } else { 0 };
        buf.put_u8(end_bit | (self.volume & 0x3F));
        buf.put_u16(self.duration);
        buf.freeze()
    }
}
