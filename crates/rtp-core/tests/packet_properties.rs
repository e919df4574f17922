use bytes::Bytes;
use proptest::prelude::*;

use softphone_rtp_core::payload::PayloadTypeRegistry;
use softphone_rtp_core::{Error, PayloadAssociation, PayloadType, RtpHeader, RtpPacket};

fn arb_packet() -> impl Strategy<Value = RtpPacket> {
    (
        any::<bool>(),
        0u8..128,
        any::<u16>(),
        any::<u32>(),
        any::<u32>(),
        prop::collection::vec(any::<u32>(), 0..=15),
        prop::option::of((any::<u16>(), prop::collection::vec(any::<u8>(), 0..8))),
        prop::collection::vec(any::<u8>(), 0..400),
    )
        .prop_map(|(marker, pt, seq, ts, ssrc, csrc, ext, payload)| {
            let mut header = RtpHeader::new(pt, seq, ts, ssrc)
                .with_marker(marker)
                .with_csrc(csrc)
                .unwrap();
            if let Some((id, words)) = ext {
                // Parsed extensions are always whole words
                let mut data = words;
                data.resize(data.len() / 4 * 4, 0);
                header = header.with_extension(id, Bytes::from(data));
            }
            RtpPacket::new(header, Bytes::from(payload))
        })
}

fn audio_codec() -> impl Strategy<Value = PayloadType> {
    prop_oneof![
        Just(PayloadType::Pcmu),
        Just(PayloadType::Pcma),
        Just(PayloadType::G722),
        Just(PayloadType::G729),
        Just(PayloadType::TelephoneEvent),
    ]
}

proptest! {
    #[test]
    fn build_then_parse_is_lossless(packet in arb_packet()) {
        let bytes = packet.build().unwrap();
        prop_assert_eq!(bytes.len(), 12 + 4 * packet.header.csrc.len()
            + packet.header.extension_data.as_ref().map_or(0, |d| 4 + d.len())
            + packet.payload.len());

        let decoded = RtpPacket::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded, &packet);
        prop_assert_eq!(decoded.build().unwrap(), bytes);
    }

    #[test]
    fn negotiated_mapping_wins(id in 0u8..128, codec in audio_codec()) {
        let assoc: PayloadAssociation = [(id, codec)].into_iter().collect();
        prop_assert_eq!(assoc.resolve(id).unwrap(), codec);
    }

    #[test]
    fn unmapped_ids_fall_back_or_fail(id in 0u8..128) {
        let empty = PayloadAssociation::default();
        match PayloadTypeRegistry::global().by_id(id) {
            Some(codec) => prop_assert_eq!(empty.resolve(id).unwrap(), codec),
            None => prop_assert_eq!(empty.resolve(id), Err(Error::UnknownPayloadType(id))),
        }
    }

    #[test]
    fn other_versions_are_rejected(version in 0u8..4, tail in prop::collection::vec(any::<u8>(), 11..40)) {
        let mut bytes = vec![version << 6];
        bytes.extend_from_slice(&tail);
        bytes[0] &= 0xC0; // no padding, extension or CSRC

        let result = RtpPacket::decode(&bytes);
        if version == 2 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result.unwrap_err(), Error::IncompatibleVersion(version));
        }
    }
}
