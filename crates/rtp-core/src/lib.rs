//! RTP core library for the softphone engine
//!
//! This crate provides the wire-level pieces of the media path:
//!
//! - `packet`: RFC 3550 RTP header and packet parsing/building
//! - `payload`: static payload-type registry and the per-leg `PayloadAssociation`
//! - `dtmf`: RFC 4733 telephone-event payloads
//! - `rtcp`: the minimal receiver report + SDES compound packet sent when a call is answered
//!
//! Everything here is synchronous and allocation-light; sockets and tasks
//! live in `softphone-media-core`.

mod error;

pub mod dtmf;
pub mod packet;
pub mod payload;
pub mod rtcp;

pub use error::Error;

pub use dtmf::{DtmfEvent, DtmfTone};
pub use packet::{RtpHeader, RtpPacket, COMPATIBLE_RTP_VERSIONS, RTP_MIN_HEADER_SIZE, RTP_VERSION};
pub use payload::{PayloadAssociation, PayloadType, PayloadTypeRegistry};

/// The default maximum size for RTP packets in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Typedef for RTP contributing source identifier
pub type RtpCsrc = u32;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        DtmfEvent, DtmfTone, Error, PayloadAssociation, PayloadType, Result, RtpCsrc, RtpHeader,
        RtpPacket, RtpSequenceNumber, RtpSsrc, RtpTimestamp,
    };
}
