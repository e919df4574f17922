//! Error types and handling for the client-core library
//!
//! # Error Categories
//!
//! - **State Errors** - An operation was invoked from a call state that does not
//!   allow it (answering a call that is not ringing, holding a call that is not
//!   connected). These are caller contract violations and are never retried.
//! - **Configuration Errors** - Invalid settings, can't recover without fixing config
//! - **Resource Errors** - Port or session-id pools exhausted
//! - **Signaling Errors** - The signaling collaborator refused or failed a request
//! - **Media / Protocol Errors** - Socket or RTP framing problems on a media leg
//!
//! Negotiation problems and terminal call failures are not errors: they are
//! reported as [`crate::negotiation::NegotiationWarning`] and
//! [`crate::call::CallFailure`] values.
//!
//! ```rust,no_run
//! # use softphone_client_core::{Phone, ClientError};
//! # use std::sync::Arc;
//! # async fn example(phone: Arc<Phone>, call_id: &str) {
//! use tracing::{error, info};
//!
//! match phone.answer(call_id).await {
//!     Ok(()) => info!(call_id, "Call answered"),
//!     Err(ClientError::InvalidCallState { current_state, .. }) => {
//!         info!(call_id, state = %current_state, "Call is no longer ringing");
//!     }
//!     Err(e) => error!(call_id, error = %e, category = e.category(), "Failed to answer call"),
//! }
//! # }
//! ```

use thiserror::Error;

use crate::call::CallState;

/// Result type alias for client-core operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Error types for phone and call operations
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Phone has not been started (or has been stopped)
    #[error("Phone is not started")]
    NotStarted,

    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: String },

    #[error("Call already exists: {call_id}")]
    CallAlreadyExists { call_id: String },

    /// Operation not allowed from the call's current state
    #[error("Cannot {operation} call {call_id} in state {current_state}")]
    InvalidCallState {
        call_id: String,
        operation: &'static str,
        current_state: CallState,
    },

    #[error("Call setup failed: {reason}")]
    CallSetupFailed { reason: String },

    /// Signaling collaborator failed a request
    #[error("Signaling error: {reason}")]
    Signaling { reason: String },

    #[error("Media error: {details}")]
    MediaError { details: String },

    #[error("No compatible codecs")]
    NoCompatibleCodecs,

    #[error("Protocol error: {reason}")]
    ProtocolError { reason: String },

    #[error("Invalid DTMF digit: {digit:?}")]
    InvalidDtmf { digit: char },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Allocation pool exhausted
    #[error("Resource unavailable: {resource}")]
    ResourceUnavailable { resource: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl ClientError {
    /// Create a state-guard error
    pub fn invalid_state(call_id: impl Into<String>, operation: &'static str, current_state: CallState) -> Self {
        Self::InvalidCallState {
            call_id: call_id.into(),
            operation,
            current_state,
        }
    }

    pub fn call_not_found(call_id: impl Into<String>) -> Self {
        Self::CallNotFound { call_id: call_id.into() }
    }

    pub fn call_setup_failed(reason: impl Into<String>) -> Self {
        Self::CallSetupFailed { reason: reason.into() }
    }

    pub fn signaling(reason: impl Into<String>) -> Self {
        Self::Signaling { reason: reason.into() }
    }

    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn resource_unavailable(resource: impl Into<String>) -> Self {
        Self::ResourceUnavailable { resource: resource.into() }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// True for state-guard violations
    pub fn is_state_error(&self) -> bool {
        matches!(self, ClientError::InvalidCallState { .. })
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Signaling { .. }
            | ClientError::MediaError { .. }
            | ClientError::ResourceUnavailable { .. } => true,

            ClientError::InvalidConfiguration { .. }
            | ClientError::InvalidCallState { .. }
            | ClientError::InvalidDtmf { .. }
            | ClientError::NoCompatibleCodecs => false,

            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::NotStarted => "registration",

            ClientError::CallNotFound { .. }
            | ClientError::CallAlreadyExists { .. }
            | ClientError::InvalidCallState { .. }
            | ClientError::CallSetupFailed { .. }
            | ClientError::InvalidDtmf { .. } => "call",

            ClientError::MediaError { .. } | ClientError::NoCompatibleCodecs => "media",

            ClientError::Signaling { .. } | ClientError::ProtocolError { .. } => "protocol",

            ClientError::InvalidConfiguration { .. } => "configuration",

            ClientError::ResourceUnavailable { .. } | ClientError::InternalError { .. } => "system",
        }
    }
}

impl From<softphone_media_core::MediaError> for ClientError {
    fn from(err: softphone_media_core::MediaError) -> Self {
        match err {
            softphone_media_core::MediaError::InvalidDtmfDigit(digit) => ClientError::InvalidDtmf { digit },
            softphone_media_core::MediaError::NoCompatibleCodec => ClientError::NoCompatibleCodecs,
            other => ClientError::MediaError { details: other.to_string() },
        }
    }
}

impl From<softphone_rtp_core::Error> for ClientError {
    fn from(err: softphone_rtp_core::Error) -> Self {
        ClientError::ProtocolError { reason: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let err = ClientError::invalid_state("abc@host", "answer", CallState::Online);
        assert_eq!(err.to_string(), "Cannot answer call abc@host in state ONLINE");
        assert!(err.is_state_error());
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), "call");
    }

    #[test]
    fn test_media_error_conversion() {
        let err: ClientError = softphone_media_core::MediaError::NoCompatibleCodec.into();
        assert!(matches!(err, ClientError::NoCompatibleCodecs));

        let err: ClientError = softphone_media_core::MediaError::NotStarted.into();
        assert_eq!(err.category(), "media");
        assert!(err.is_recoverable());
    }
}
