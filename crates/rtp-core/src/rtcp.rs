//! Minimal RTCP: the receiver report + SDES compound packet a phone emits
//! once media starts flowing on an answered call (RFC 3550 section 6).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP version, shared with RTP
pub const RTCP_VERSION: u8 = 2;

/// Receiver Report packet type
pub const RTCP_PT_RR: u8 = 201;

/// Source Description packet type
pub const RTCP_PT_SDES: u8 = 202;

/// SDES CNAME item type
pub const SDES_CNAME: u8 = 1;

/// True when the second byte of a datagram marks it as RTCP (types 200-204)
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (200..=204).contains(&data[1])
}

fn put_common_header(buf: &mut BytesMut, count: u8, packet_type: u8, length_words: u16) {
    buf.put_u8((RTCP_VERSION << 6) | (count & 0x1F));
    buf.put_u8(packet_type);
    buf.put_u16(length_words);
}

/// Build an empty receiver report followed by an SDES chunk carrying `cname`.
pub fn receiver_report_with_cname(ssrc: RtpSsrc, cname: &str) -> Result<Bytes> {
    if cname.len() > 255 {
        return Err(Error::InvalidParameter(format!(
            "CNAME of {} bytes exceeds the SDES item limit",
            cname.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(8 + 12 + cname.len());

    // RR with zero report blocks: header + reporter SSRC
    put_common_header(&mut buf, 0, RTCP_PT_RR, 1);
    buf.put_u32(ssrc);

    // SDES chunk: SSRC, CNAME item, null terminator, pad to 32 bits
    let item_len = 2 + cname.len();
    let chunk_len = 4 + item_len + 1;
    let padded = (chunk_len + 3) / 4 * 4;

    put_common_header(&mut buf, 1, RTCP_PT_SDES, (padded / 4) as u16);
    buf.put_u32(ssrc);
    buf.put_u8(SDES_CNAME);
    buf.put_u8(cname.len() as u8);
    buf.put_slice(cname.as_bytes());
    buf.put_bytes(0, padded - chunk_len + 1);

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_layout() {
        let bytes = receiver_report_with_cname(0x1234, "abc").unwrap();

        assert_eq!(&bytes[..8], &[0x80, 201, 0, 1, 0, 0, 0x12, 0x34]);
        assert_eq!(bytes[8], 0x81);
        assert_eq!(bytes[9], 202);
        assert!(is_rtcp(&bytes));
        assert!(is_rtcp(&bytes[8..]));

        // SDES length field covers the chunk in 32-bit words
        let sdes_words = u16::from_be_bytes([bytes[10], bytes[11]]) as usize;
        assert_eq!(bytes.len(), 8 + 4 + sdes_words * 4);
        assert_eq!(&bytes[16..21], &[SDES_CNAME, 3, b'a', b'b', b'c']);
        assert_eq!(bytes[21], 0);
    }

    #[test]
    fn test_rtp_is_not_rtcp() {
        assert!(!is_rtcp(&[0x80, 0x00, 0x00, 0x01]));
        assert!(!is_rtcp(&[0x80]));
    }
}
