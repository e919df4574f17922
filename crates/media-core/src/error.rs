use std::io;
use thiserror::Error;

/// Result type for media operations
pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// Error types for media stream operations
#[derive(Debug, Error)]
pub enum MediaError {
    /// Packet-level framing or payload resolution error
    #[error("RTP error: {0}")]
    Rtp(#[from] softphone_rtp_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stream has no socket yet
    #[error("Media stream has not been started")]
    NotStarted,

    /// Stream was stopped and cannot be restarted
    #[error("Media stream has been stopped")]
    Stopped,

    /// No telephone-event payload type on this leg
    #[error("DTMF was not negotiated for this media stream")]
    DtmfNotNegotiated,

    #[error("Invalid DTMF digit: {0:?}")]
    InvalidDtmfDigit(char),

    /// Association carries no audio codec to send with
    #[error("No compatible codec negotiated")]
    NoCompatibleCodec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(MediaError::InvalidDtmfDigit('x').to_string(), "Invalid DTMF digit: 'x'");
        let rtp: MediaError = softphone_rtp_core::Error::IncompatibleVersion(1).into();
        assert_eq!(rtp.to_string(), "RTP error: Incompatible RTP version: 1");
    }
}
