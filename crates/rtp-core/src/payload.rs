//! Payload types and per-leg payload associations
//!
//! RFC 3551 assigns fixed meanings to payload-type ids 0-34. Everything in
//! the dynamic range (96-127) only means something once an SDP `a=rtpmap`
//! line has bound it, which is what [`PayloadAssociation`] captures for one
//! negotiated media leg.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Payload id conventionally used for RFC 4733 telephone events
pub const DEFAULT_TELEPHONE_EVENT_PT: u8 = 101;

/// Payload id used for hold keepalive packets
pub const KEEPALIVE_PT: u8 = 126;

/// Semantic codec identifier carried by an RTP payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PayloadType {
    Pcmu,
    Gsm,
    G723,
    Dvi4_8000,
    Dvi4_16000,
    Lpc,
    Pcma,
    G722,
    L16Stereo,
    L16Mono,
    Qcelp,
    ComfortNoise,
    Mpa,
    G728,
    Dvi4_11025,
    Dvi4_22050,
    G729,
    CelB,
    Jpeg,
    Nv,
    H261,
    Mpv,
    Mp2t,
    H263,
    /// RFC 4733 telephone-event (always dynamic)
    TelephoneEvent,
    /// Offered id we could not resolve; kept so the media line is never dropped
    Unknown,
}

/// Media kind a payload type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
    AudioVideo,
    Event,
    Unknown,
}

impl PayloadType {
    /// The RFC 3551 static id, `None` for dynamic or unresolved types
    pub fn static_id(&self) -> Option<u8> {
        let id = match self {
            PayloadType::Pcmu => 0,
            PayloadType::Gsm => 3,
            PayloadType::G723 => 4,
            PayloadType::Dvi4_8000 => 5,
            PayloadType::Dvi4_16000 => 6,
            PayloadType::Lpc => 7,
            PayloadType::Pcma => 8,
            PayloadType::G722 => 9,
            PayloadType::L16Stereo => 10,
            PayloadType::L16Mono => 11,
            PayloadType::Qcelp => 12,
            PayloadType::ComfortNoise => 13,
            PayloadType::Mpa => 14,
            PayloadType::G728 => 15,
            PayloadType::Dvi4_11025 => 16,
            PayloadType::Dvi4_22050 => 17,
            PayloadType::G729 => 18,
            PayloadType::CelB => 25,
            PayloadType::Jpeg => 26,
            PayloadType::Nv => 28,
            PayloadType::H261 => 31,
            PayloadType::Mpv => 32,
            PayloadType::Mp2t => 33,
            PayloadType::H263 => 34,
            PayloadType::TelephoneEvent | PayloadType::Unknown => return None,
        };
        Some(id)
    }

    /// Encoding name as it appears in `a=rtpmap`
    pub fn encoding_name(&self) -> &'static str {
        match self {
            PayloadType::Pcmu => "PCMU",
            PayloadType::Gsm => "GSM",
            PayloadType::G723 => "G723",
            PayloadType::Dvi4_8000
            | PayloadType::Dvi4_16000
            | PayloadType::Dvi4_11025
            | PayloadType::Dvi4_22050 => "DVI4",
            PayloadType::Lpc => "LPC",
            PayloadType::Pcma => "PCMA",
            PayloadType::G722 => "G722",
            PayloadType::L16Stereo | PayloadType::L16Mono => "L16",
            PayloadType::Qcelp => "QCELP",
            PayloadType::ComfortNoise => "CN",
            PayloadType::Mpa => "MPA",
            PayloadType::G728 => "G728",
            PayloadType::G729 => "G729",
            PayloadType::CelB => "CelB",
            PayloadType::Jpeg => "JPEG",
            PayloadType::Nv => "nv",
            PayloadType::H261 => "H261",
            PayloadType::Mpv => "MPV",
            PayloadType::Mp2t => "MP2T",
            PayloadType::H263 => "H263",
            PayloadType::TelephoneEvent => "telephone-event",
            PayloadType::Unknown => "UNKNOWN",
        }
    }

    /// Sampling clock in Hz
    pub fn clock_rate(&self) -> u32 {
        match self {
            PayloadType::Dvi4_16000 => 16000,
            PayloadType::Dvi4_11025 => 11025,
            PayloadType::Dvi4_22050 => 22050,
            PayloadType::L16Stereo | PayloadType::L16Mono => 44100,
            PayloadType::Mpa
            | PayloadType::CelB
            | PayloadType::Jpeg
            | PayloadType::Nv
            | PayloadType::H261
            | PayloadType::Mpv
            | PayloadType::Mp2t
            | PayloadType::H263 => 90000,
            _ => 8000,
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        match self {
            PayloadType::CelB
            | PayloadType::Jpeg
            | PayloadType::Nv
            | PayloadType::H261
            | PayloadType::Mpv
            | PayloadType::H263 => MediaKind::Video,
            PayloadType::Mp2t => MediaKind::AudioVideo,
            PayloadType::TelephoneEvent => MediaKind::Event,
            PayloadType::Unknown => MediaKind::Unknown,
            _ => MediaKind::Audio,
        }
    }

    /// True for payloads that carry audio samples
    pub fn is_audio(&self) -> bool {
        self.media_kind() == MediaKind::Audio
    }

    /// Resolve an rtpmap encoding name, using the clock rate to tell the
    /// DVI4 and L16 variants apart
    pub fn from_encoding_name(name: &str, clock_rate: Option<u32>) -> Option<PayloadType> {
        PayloadTypeRegistry::global().by_name(name, clock_rate)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// Global payload type registry
static PAYLOAD_REGISTRY: OnceLock<PayloadTypeRegistry> = OnceLock::new();

/// RFC 3551 static payload types, keyed both by id and by encoding name
#[derive(Debug)]
pub struct PayloadTypeRegistry {
    by_id: HashMap<u8, PayloadType>,
    by_name: HashMap<String, Vec<PayloadType>>,
}

impl PayloadTypeRegistry {
    const STATIC_TYPES: [PayloadType; 24] = [
        PayloadType::Pcmu,
        PayloadType::Gsm,
        PayloadType::G723,
        PayloadType::Dvi4_8000,
        PayloadType::Dvi4_16000,
        PayloadType::Lpc,
        PayloadType::Pcma,
        PayloadType::G722,
        PayloadType::L16Stereo,
        PayloadType::L16Mono,
        PayloadType::Qcelp,
        PayloadType::ComfortNoise,
        PayloadType::Mpa,
        PayloadType::G728,
        PayloadType::Dvi4_11025,
        PayloadType::Dvi4_22050,
        PayloadType::G729,
        PayloadType::CelB,
        PayloadType::Jpeg,
        PayloadType::Nv,
        PayloadType::H261,
        PayloadType::Mpv,
        PayloadType::Mp2t,
        PayloadType::H263,
    ];

    fn new() -> Self {
        let mut by_id = HashMap::new();
        let mut by_name: HashMap<String, Vec<PayloadType>> = HashMap::new();

        for pt in Self::STATIC_TYPES {
            if let Some(id) = pt.static_id() {
                by_id.insert(id, pt);
            }
            by_name.entry(pt.encoding_name().to_ascii_lowercase()).or_default().push(pt);
        }
        by_name
            .entry(PayloadType::TelephoneEvent.encoding_name().to_string())
            .or_default()
            .push(PayloadType::TelephoneEvent);

        Self { by_id, by_name }
    }

    /// Shared registry instance
    pub fn global() -> &'static PayloadTypeRegistry {
        PAYLOAD_REGISTRY.get_or_init(PayloadTypeRegistry::new)
    }

    /// Static lookup by wire id
    pub fn by_id(&self, id: u8) -> Option<PayloadType> {
        self.by_id.get(&id).copied()
    }

    /// Case-insensitive lookup by encoding name
    pub fn by_name(&self, name: &str, clock_rate: Option<u32>) -> Option<PayloadType> {
        let candidates = self.by_name.get(&name.trim().to_ascii_lowercase())?;
        match clock_rate {
            Some(rate) => candidates
                .iter()
                .copied()
                .find(|pt| pt.clock_rate() == rate)
                .or_else(|| candidates.first().copied()),
            None => candidates.first().copied(),
        }
    }
}

/// Mapping from negotiated payload id to codec for one media leg.
///
/// Built once when the leg is negotiated; there is no way to mutate it
/// afterwards, only to derive a new association from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadAssociation {
    entries: BTreeMap<u8, PayloadType>,
}

impl PayloadAssociation {
    pub fn new(entries: BTreeMap<u8, PayloadType>) -> Self {
        Self { entries }
    }

    /// The plan an outbound call offers: PCMU on 0, telephone-event on 101
    pub fn default_offer() -> Self {
        [
            (0, PayloadType::Pcmu),
            (DEFAULT_TELEPHONE_EVENT_PT, PayloadType::TelephoneEvent),
        ]
        .into_iter()
        .collect()
    }

    pub fn get(&self, id: u8) -> Option<PayloadType> {
        self.entries.get(&id).copied()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, PayloadType)> + '_ {
        self.entries.iter().map(|(id, pt)| (*id, *pt))
    }

    /// Resolve a wire id: this association first, then the static registry
    pub fn resolve(&self, id: u8) -> Result<PayloadType> {
        self.get(id)
            .or_else(|| PayloadTypeRegistry::global().by_id(id))
            .ok_or(Error::UnknownPayloadType(id))
    }

    /// Keep only the entries whose codec is in `supported`
    pub fn intersect(&self, supported: &[PayloadType]) -> PayloadAssociation {
        self.iter().filter(|(_, pt)| supported.contains(pt)).collect()
    }

    /// True when at least one entry carries audio samples
    pub fn has_audio_codec(&self) -> bool {
        self.entries.values().any(PayloadType::is_audio)
    }

    /// First audio codec in id order, used for outbound media
    pub fn preferred_codec(&self) -> Option<(u8, PayloadType)> {
        self.iter().find(|(_, pt)| pt.is_audio())
    }

    /// Payload id bound to telephone-event, if negotiated
    pub fn telephone_event_id(&self) -> Option<u8> {
        self.iter()
            .find(|(_, pt)| *pt == PayloadType::TelephoneEvent)
            .map(|(id, _)| id)
    }
}

impl FromIterator<(u8, PayloadType)> for PayloadAssociation {
    fn from_iter<I: IntoIterator<Item = (u8, PayloadType)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_registry() {
        let registry = PayloadTypeRegistry::global();
        assert_eq!(registry.by_id(0), Some(PayloadType::Pcmu));
        assert_eq!(registry.by_id(8), Some(PayloadType::Pcma));
        assert_eq!(registry.by_id(34), Some(PayloadType::H263));
        assert_eq!(registry.by_id(2), None);
        assert_eq!(registry.by_id(101), None);
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(PayloadType::from_encoding_name("pcmu", None), Some(PayloadType::Pcmu));
        assert_eq!(
            PayloadType::from_encoding_name("telephone-event", Some(8000)),
            Some(PayloadType::TelephoneEvent)
        );
        assert_eq!(PayloadType::from_encoding_name("DVI4", Some(16000)), Some(PayloadType::Dvi4_16000));
        assert_eq!(PayloadType::from_encoding_name("opus", Some(48000)), None);
    }

    #[test]
    fn test_association_prefers_negotiated_mapping() {
        // A peer that rebinds static id 8 to PCMU wins over the registry
        let assoc: PayloadAssociation = [(8, PayloadType::Pcmu)].into_iter().collect();
        assert_eq!(assoc.resolve(8).unwrap(), PayloadType::Pcmu);
        assert_eq!(assoc.resolve(0).unwrap(), PayloadType::Pcmu);
        assert_eq!(assoc.resolve(100), Err(Error::UnknownPayloadType(100)));
    }

    #[test]
    fn test_preferred_codec_and_dtmf() {
        let assoc = PayloadAssociation::default_offer();
        assert_eq!(assoc.preferred_codec(), Some((0, PayloadType::Pcmu)));
        assert_eq!(assoc.telephone_event_id(), Some(101));

        let events_only: PayloadAssociation =
            [(101, PayloadType::TelephoneEvent)].into_iter().collect();
        assert!(!events_only.has_audio_codec());
        assert_eq!(events_only.preferred_codec(), None);
    }

    #[test]
    fn test_intersect() {
        let offered: PayloadAssociation = [
            (0, PayloadType::Pcmu),
            (18, PayloadType::G729),
            (101, PayloadType::TelephoneEvent),
        ]
        .into_iter()
        .collect();

        let kept = offered.intersect(&[PayloadType::Pcmu, PayloadType::TelephoneEvent]);
        assert_eq!(kept.len(), 2);
        assert!(!kept.contains(18));
    }
}
