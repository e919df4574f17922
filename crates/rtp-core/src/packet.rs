use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

use crate::error::Error;
use crate::payload::{PayloadAssociation, PayloadType};
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Versions accepted by [`RtpHeader::parse`]
pub const COMPATIBLE_RTP_VERSIONS: &[u8] = &[RTP_VERSION];

/// Padding flag position in the first byte
pub const RTP_PADDING_FLAG: usize = 2;

/// Extension flag position in the first byte
pub const RTP_EXTENSION_FLAG: usize = 3;

/// CSRC count position in the first byte (4 bits)
pub const RTP_CC_OFFSET: usize = 4;

/// Marker bit position in the second byte
pub const RTP_MARKER_FLAG: usize = 0;

/// Payload type position in the second byte (7 bits)
pub const RTP_PT_OFFSET: usize = 1;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// Largest CSRC list the 4-bit count can describe
pub const RTP_MAX_CSRC: usize = 15;

/// RTP header implementation according to RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,

    /// Padding flag
    pub padding: bool,

    /// Extension flag
    pub extension: bool,

    /// CSRC count (number of contributing sources)
    pub cc: u8,

    /// Marker bit
    pub marker: bool,

    /// Raw 7-bit payload type
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: RtpSequenceNumber,

    /// Timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source identifier
    pub ssrc: RtpSsrc,

    /// Contributing source identifiers
    pub csrc: Vec<RtpCsrc>,

    /// Profile-defined extension identifier
    pub extension_id: Option<u16>,

    /// Extension data, a whole number of 32-bit words when parsed
    pub extension_data: Option<Bytes>,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

impl RtpHeader {
    /// Create a new RTP header with default values
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            cc: 0,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_id: None,
            extension_data: None,
        }
    }

    /// Set the marker bit
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Replace the CSRC list, keeping the count in step
    pub fn with_csrc(mut self, csrc: Vec<RtpCsrc>) -> Result<Self> {
        if csrc.len() > RTP_MAX_CSRC {
            return Err(Error::InvalidParameter(format!(
                "CSRC list of {} entries exceeds the maximum of {}",
                csrc.len(),
                RTP_MAX_CSRC
            )));
        }
        self.cc = csrc.len() as u8;
        self.csrc = csrc;
        Ok(self)
    }

    /// Attach a header extension
    pub fn with_extension(mut self, id: u16, data: Bytes) -> Self {
        self.extension = true;
        self.extension_id = Some(id);
        self.extension_data = Some(data);
        self
    }

    /// Get the size of the header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;

        if self.extension {
            let data_len = self.extension_data.as_ref().map_or(0, |d| d.len());
            size += 4 + (data_len + 3) / 4 * 4;
        }

        size
    }

    /// Parse an RTP header, accepting only [`COMPATIBLE_RTP_VERSIONS`]
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        Self::parse_with_versions(buf, COMPATIBLE_RTP_VERSIONS)
    }

    /// Parse an RTP header against an explicit set of accepted versions
    pub fn parse_with_versions(buf: &mut impl Buf, versions: &[u8]) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        // First byte: version (2 bits), padding (1 bit), extension (1 bit), CSRC count (4 bits)
        let first_byte = buf.get_u8();
        let bits = first_byte.view_bits::<Msb0>();

        let version = bits[0..2].load_be::<u8>();
        if !versions.contains(&version) {
            return Err(Error::IncompatibleVersion(version));
        }

        let padding = bits[RTP_PADDING_FLAG];
        let extension = bits[RTP_EXTENSION_FLAG];
        let cc = bits[RTP_CC_OFFSET..RTP_CC_OFFSET + 4].load_be::<u8>();

        // Second byte: marker (1 bit), payload type (7 bits)
        let second_byte = buf.get_u8();
        let bits = second_byte.view_bits::<Msb0>();

        let marker = bits[RTP_MARKER_FLAG];
        let payload_type = bits[RTP_PT_OFFSET..RTP_PT_OFFSET + 7].load_be::<u8>();

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let csrc_len = cc as usize * 4;
        if buf.remaining() < csrc_len {
            return Err(Error::BufferTooSmall {
                required: csrc_len,
                available: buf.remaining(),
            });
        }
        let csrc = (0..cc).map(|_| buf.get_u32()).collect();

        // RFC 3550 5.3.1: 16-bit profile id, 16-bit length in words, then data
        let (extension_id, extension_data) = if extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }

            let ext_id = buf.get_u16();
            let ext_length = buf.get_u16() as usize * 4;

            if buf.remaining() < ext_length {
                return Err(Error::BufferTooSmall {
                    required: ext_length,
                    available: buf.remaining(),
                });
            }

            (Some(ext_id), Some(buf.copy_to_bytes(ext_length)))
        } else {
            (None, None)
        };

        Ok(Self {
            version,
            padding,
            extension,
            cc,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_id,
            extension_data,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.cc as usize != self.csrc.len() {
            return Err(Error::InvalidParameter(format!(
                "CSRC count ({}) does not match CSRC list length ({})",
                self.cc,
                self.csrc.len()
            )));
        }

        buf.reserve(self.size());

        let mut first_byte = 0u8;
        let bits = first_byte.view_bits_mut::<Msb0>();
        bits[0..2].store_be(self.version & 0x03);
        bits.set(RTP_PADDING_FLAG, self.padding);
        bits.set(RTP_EXTENSION_FLAG, self.extension);
        bits[RTP_CC_OFFSET..RTP_CC_OFFSET + 4].store_be(self.cc & 0x0F);
        buf.put_u8(first_byte);

        let mut second_byte = 0u8;
        let bits = second_byte.view_bits_mut::<Msb0>();
        bits.set(RTP_MARKER_FLAG, self.marker);
        bits[RTP_PT_OFFSET..RTP_PT_OFFSET + 7].store_be(self.payload_type & 0x7F);
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            let ext_id = self.extension_id.ok_or_else(|| {
                Error::InvalidParameter("Extension flag is set but extension id is missing".to_string())
            })?;
            let ext_data = self.extension_data.clone().unwrap_or_default();
            let words = (ext_data.len() + 3) / 4;
            if words > u16::MAX as usize {
                return Err(Error::InvalidParameter(format!(
                    "Extension data of {} bytes does not fit the 16-bit length field",
                    ext_data.len()
                )));
            }

            buf.put_u16(ext_id);
            buf.put_u16(words as u16);
            buf.put_slice(&ext_data);
            buf.put_bytes(0, words * 4 - ext_data.len());
        }

        Ok(())
    }
}

/// RTP packet implementation
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,

    /// Everything after the header, including any trailing padding
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a new RTP packet
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a new RTP packet with basic parameters
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        let header = RtpHeader::new(payload_type, sequence_number, timestamp, ssrc);
        Self { header, payload }
    }

    /// Get the total size of the packet in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Frame a datagram without resolving its payload type
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let header = RtpHeader::parse(&mut buf)?;

        if let Some(id) = header.extension_id {
            trace!(
                profile = format_args!("{:#06x}", id),
                len = header.extension_data.as_ref().map_or(0, Bytes::len),
                "RTP header extension skipped"
            );
        }

        if header.padding {
            let padding = buf.last().copied().unwrap_or(0) as usize;
            if padding == 0 || padding > buf.len() {
                return Err(Error::InvalidPacket(format!(
                    "Invalid padding value: {} with {} payload bytes",
                    padding,
                    buf.len()
                )));
            }
        }

        Ok(Self { header, payload: buf })
    }

    /// Parse a datagram and resolve its payload type.
    ///
    /// The leg's negotiated association is consulted before the static
    /// registry, so a peer that rebinds a static id is honoured.
    pub fn parse(data: &[u8], association: &PayloadAssociation) -> Result<(Self, PayloadType)> {
        let packet = Self::decode(data)?;
        let codec = association.resolve(packet.header.payload_type)?;
        Ok((packet, codec))
    }

    /// Serialize the packet to bytes
    pub fn build(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Payload with RFC 3550 padding removed
    pub fn media_payload(&self) -> Bytes {
        if !self.header.padding {
            return self.payload.clone();
        }
        let padding = self.payload.last().copied().unwrap_or(0) as usize;
        self.payload.slice(..self.payload.len().saturating_sub(padding))
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
