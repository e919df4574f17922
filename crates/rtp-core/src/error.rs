use thiserror::Error;

/// Error type for RTP operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Version bits are outside the accepted set
    #[error("Incompatible RTP version: {0}")]
    IncompatibleVersion(u8),

    /// Payload type resolved neither through the leg's association nor the static registry
    #[error("Unknown RTP payload type: {0}")]
    UnknownPayloadType(u8),

    /// Buffer too small
    #[error("Buffer too small for RTP packet: need {required} but have {available}")]
    BufferTooSmall {
        required: usize,
        available: usize,
    },

    /// Invalid packet format
    #[error("Invalid RTP packet format: {0}")]
    InvalidPacket(String),

    /// Invalid parameter for RTP operation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    /// True for errors that make a single received packet unusable.
    ///
    /// These never affect the call the packet belongs to; the receive loop
    /// drops the packet and keeps going.
    pub fn is_protocol_parse_error(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleVersion(_)
                | Error::UnknownPayloadType(_)
                | Error::BufferTooSmall { .. }
                | Error::InvalidPacket(_)
        )
    }
}
