//! Media negotiation against a remote session description
//!
//! Turns the connection and media lines of a remote offer or answer into a
//! list of [`MediaLeg`]s, one per (media line, connection line) pair.
//! Problems that leave the call usable in a degraded form are reported as
//! [`NegotiationWarning`]s next to the legs rather than as errors.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use softphone_media_core::TransmitMode;
use softphone_rtp_core::{PayloadAssociation, PayloadType, PayloadTypeRegistry};
use tracing::{debug, warn};

use crate::error::ClientResult;
use crate::signaling::{MediaDescription, MediaType, SessionDescription};

/// Non-fatal negotiation diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationWarning {
    /// Media line of a type this phone does not handle
    UnsupportedMediaType { media_type: String },
    /// Payload id that resolved neither numerically nor by rtpmap name
    UnknownPayloadType { id: u8, encoding_name: Option<String> },
    /// No offered codec is in the supported set
    NoCompatibleCodecs { port: u16 },
    /// Port counts do not divide evenly across connection lines
    AddressRatioMismatch {
        connections: u32,
        audio_ports: u32,
        video_ports: u32,
    },
}

impl fmt::Display for NegotiationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationWarning::UnsupportedMediaType { media_type } => {
                write!(f, "Unknown media description: {media_type}")
            }
            NegotiationWarning::UnknownPayloadType { id, encoding_name } => match encoding_name {
                Some(name) => write!(f, "RTP payload type {id} ({name}) not found"),
                None => write!(f, "RTP payload type {id} not found"),
            },
            NegotiationWarning::NoCompatibleCodecs { port } => {
                write!(f, "No compatible codecs offered for remote port {port}")
            }
            NegotiationWarning::AddressRatioMismatch { connections, audio_ports, video_ports } => write!(
                f,
                "Unable to assign ports for RTP: {connections} connections, {audio_ports} audio ports, {video_ports} video ports"
            ),
        }
    }
}

/// One media stream to create: local port, destination and codecs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLeg {
    /// Index of the media line in the session description
    pub media_index: usize,
    /// Index of the connection line in the session description
    pub connection_index: usize,
    pub local_port: u16,
    pub remote_addr: SocketAddr,
    pub association: PayloadAssociation,
    pub transmit_mode: TransmitMode,
}

/// Negotiated legs plus any warnings raised on the way
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    pub legs: Vec<MediaLeg>,
    pub warnings: Vec<NegotiationWarning>,
}

impl MediaLeg {
    /// (media line, connection line) this leg was built from
    pub fn key(&self) -> (usize, usize) {
        (self.media_index, self.connection_index)
    }
}

impl Negotiation {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, warning: NegotiationWarning) {
        warn!(%warning, "Media negotiation");
        self.warnings.push(warning);
    }
}

/// Resolve every offered id on a media line.
///
/// Numeric static ids win, then the rtpmap encoding name. Anything else
/// maps to [`PayloadType::Unknown`] so the line is never dropped silently.
pub fn resolve_offer(media: &MediaDescription) -> (PayloadAssociation, Vec<NegotiationWarning>) {
    let registry = PayloadTypeRegistry::global();
    let mut warnings = Vec::new();

    let association = media
        .payload_ids
        .iter()
        .map(|&id| {
            let rtpmap = media.rtpmap.get(&id);
            let resolved = registry
                .by_id(id)
                .or_else(|| rtpmap.and_then(|map| registry.by_name(&map.encoding_name, Some(map.clock_rate))));
            match resolved {
                Some(pt) => (id, pt),
                None => {
                    warnings.push(NegotiationWarning::UnknownPayloadType {
                        id,
                        encoding_name: rtpmap.map(|map| map.encoding_name.clone()),
                    });
                    (id, PayloadType::Unknown)
                }
            }
        })
        .collect();

    (association, warnings)
}

/// Check that every audio and video line carries one port per connection line
fn address_ratio_consistent(body: &SessionDescription) -> Result<(), NegotiationWarning> {
    let connections: u32 = body.connections.iter().map(|c| c.address_count as u32).sum();
    let (mut audio_ports, mut audio_lines, mut video_ports, mut video_lines) = (0u32, 0u32, 0u32, 0u32);
    for media in &body.media {
        match media.media_type {
            MediaType::Audio => {
                audio_ports += media.port_count as u32;
                audio_lines += 1;
            }
            MediaType::Video => {
                video_ports += media.port_count as u32;
                video_lines += 1;
            }
            MediaType::Other(_) => {}
        }
    }

    // Ports per line, compared without dividing
    let audio_ok = audio_ports == 0 || audio_ports == connections * audio_lines;
    let video_ok = video_ports == 0 || video_ports == connections * video_lines;
    if audio_ok && video_ok {
        Ok(())
    } else {
        Err(NegotiationWarning::AddressRatioMismatch {
            connections,
            audio_ports,
            video_ports,
        })
    }
}

/// Negotiate media legs for `body`.
///
/// `allocate_port` is called once per usable media line and should reserve
/// a local port; its error aborts negotiation. Audio lines with no codec in
/// `supported` are skipped with a warning, as are lines of other media
/// types. Each usable line yields one leg per connection line, the n-th
/// targeting the remote base port plus n.
pub fn negotiate<F>(body: &SessionDescription, supported: &[PayloadType], mut allocate_port: F) -> ClientResult<Negotiation>
where
    F: FnMut(&MediaDescription) -> ClientResult<u16>,
{
    let mut negotiation = Negotiation::default();

    if let Err(warning) = address_ratio_consistent(body) {
        negotiation.warn(warning);
        return Ok(negotiation);
    }

    for (media_index, media) in body.media.iter().enumerate() {
        if media.media_type != MediaType::Audio {
            negotiation.warn(NegotiationWarning::UnsupportedMediaType {
                media_type: media.media_type.to_string(),
            });
            continue;
        }

        let (offered, warnings) = resolve_offer(media);
        for warning in warnings {
            negotiation.warn(warning);
        }

        let codecs = offered.intersect(supported);
        if !codecs.has_audio_codec() {
            negotiation.warn(NegotiationWarning::NoCompatibleCodecs { port: media.port });
            continue;
        }

        let local_port = allocate_port(media)?;
        let transmit_mode = media.transmit_mode.unwrap_or(body.transmit_mode);
        for (offset, connection) in body.connections.iter().enumerate() {
            let remote_addr = SocketAddr::new(connection.address, media.port.wrapping_add(offset as u16));
            debug!(local_port, %remote_addr, codecs = codecs.len(), "Negotiated media leg");
            negotiation.legs.push(MediaLeg {
                media_index,
                connection_index: offset,
                local_port,
                remote_addr,
                association: codecs.clone(),
                transmit_mode,
            });
        }
    }

    Ok(negotiation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::signaling::ConnectionAddress;
    use std::net::IpAddr;

    fn supported() -> Vec<PayloadType> {
        vec![PayloadType::Pcmu, PayloadType::Pcma, PayloadType::TelephoneEvent]
    }

    fn remote() -> IpAddr {
        "192.0.2.10".parse().unwrap()
    }

    fn body(media: Vec<MediaDescription>) -> SessionDescription {
        SessionDescription {
            connections: vec![ConnectionAddress::unicast(remote())],
            media,
            transmit_mode: TransmitMode::SendRecv,
        }
    }

    #[test]
    fn test_single_audio_line() {
        let offer = body(vec![MediaDescription::audio(4000, vec![0, 101]).with_rtpmap(101, "telephone-event", 8000)]);
        let result = negotiate(&offer, &supported(), |_| Ok(12000)).unwrap();

        assert!(result.is_clean());
        assert_eq!(result.legs.len(), 1);
        let leg = &result.legs[0];
        assert_eq!(leg.local_port, 12000);
        assert_eq!(leg.remote_addr, SocketAddr::new(remote(), 4000));
        assert_eq!(leg.association.get(0), Some(PayloadType::Pcmu));
        assert_eq!(leg.association.get(101), Some(PayloadType::TelephoneEvent));
    }

    #[test]
    fn test_unknown_payload_kept_as_placeholder() {
        let media = MediaDescription::audio(4000, vec![8, 96]).with_rtpmap(96, "opus", 48000);
        let (assoc, warnings) = resolve_offer(&media);
        assert_eq!(assoc.get(96), Some(PayloadType::Unknown));
        assert_eq!(assoc.get(8), Some(PayloadType::Pcma));
        assert_eq!(
            warnings,
            vec![NegotiationWarning::UnknownPayloadType {
                id: 96,
                encoding_name: Some("opus".into())
            }]
        );

        // Placeholder never survives the intersection
        let result = negotiate(&body(vec![media]), &supported(), |_| Ok(12000)).unwrap();
        assert_eq!(result.legs[0].association.len(), 1);
    }

    #[test]
    fn test_empty_intersection_skips_line() {
        let offer = body(vec![MediaDescription::audio(4000, vec![18]).with_rtpmap(18, "G729", 8000)]);
        let mut allocations = 0;
        let result = negotiate(&offer, &supported(), |_| {
            allocations += 1;
            Ok(12000)
        })
        .unwrap();
        assert!(result.legs.is_empty());
        assert_eq!(allocations, 0);
        assert_eq!(result.warnings, vec![NegotiationWarning::NoCompatibleCodecs { port: 4000 }]);
    }

    #[test]
    fn test_legs_keep_line_index_past_skipped_line() {
        let offer = body(vec![
            MediaDescription::audio(4000, vec![18]).with_rtpmap(18, "G729", 8000),
            MediaDescription::audio(4002, vec![0]),
        ]);
        let result = negotiate(&offer, &supported(), |_| Ok(12000)).unwrap();
        assert_eq!(result.legs.len(), 1);
        assert_eq!(result.legs[0].key(), (1, 0));
        assert_eq!(result.legs[0].remote_addr, SocketAddr::new(remote(), 4002));
    }

    #[test]
    fn test_multiple_connections_offset_ports() {
        let mut offer = body(vec![MediaDescription::audio(4000, vec![0])]);
        offer.connections.push(ConnectionAddress::unicast("192.0.2.11".parse().unwrap()));
        offer.media[0].port_count = 2;

        let result = negotiate(&offer, &supported(), |_| Ok(12000)).unwrap();
        assert!(result.is_clean());
        let destinations: Vec<SocketAddr> = result.legs.iter().map(|l| l.remote_addr).collect();
        assert_eq!(
            destinations,
            vec!["192.0.2.10:4000".parse().unwrap(), "192.0.2.11:4001".parse().unwrap()]
        );
        assert!(result.legs.iter().all(|l| l.local_port == 12000));
    }

    #[test]
    fn test_ratio_mismatch_yields_no_legs() {
        let mut offer = body(vec![MediaDescription::audio(4000, vec![0])]);
        offer.connections.push(ConnectionAddress::unicast("192.0.2.11".parse().unwrap()));

        let result = negotiate(&offer, &supported(), |_| Ok(12000)).unwrap();
        assert!(result.legs.is_empty());
        assert!(matches!(result.warnings[0], NegotiationWarning::AddressRatioMismatch { connections: 2, audio_ports: 1, .. }));
    }

    #[test]
    fn test_video_line_warns_and_allocation_error_propagates() {
        let mut video = MediaDescription::audio(5000, vec![31]);
        video.media_type = MediaType::Video;
        let offer = body(vec![MediaDescription::audio(4000, vec![0]), video]);

        let result = negotiate(&offer, &supported(), |_| Ok(12000)).unwrap();
        assert_eq!(result.legs.len(), 1);
        assert_eq!(
            result.warnings,
            vec![NegotiationWarning::UnsupportedMediaType { media_type: "video".into() }]
        );

        let err = negotiate(&offer, &supported(), |_| Err(ClientError::resource_unavailable("rtp ports"))).unwrap_err();
        assert!(matches!(err, ClientError::ResourceUnavailable { .. }));
    }
}
