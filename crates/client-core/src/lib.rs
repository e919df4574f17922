//! Softphone call control
//!
//! This crate is the call-control half of the softphone engine. It sits
//! between a signaling collaborator (anything implementing
//! [`SignalingClient`]) and the RTP media legs from `softphone-media-core`:
//!
//! - [`Phone`] keeps the call directory and the port and session-id pools,
//!   places outbound calls and receives every inbound signaling event.
//! - [`Call`] is the per-dialog state machine: answer, hold, transfer,
//!   hangup, audio and DTMF.
//! - The status dispatcher maps each inbound [`SipStatus`] onto the call
//!   operation it implies and notifies the application.
//! - [`negotiation`] turns a remote session description into media legs.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use softphone_client_core::{
//!     CallDirectory, CallState, Phone, PhoneConfig, PhoneEventHandler, SignalingClient,
//! };
//!
//! struct Answerer;
//!
//! #[async_trait]
//! impl PhoneEventHandler for Answerer {
//!     async fn on_call_state(&self, state: CallState, calls: &CallDirectory, call_id: &str) {
//!         if state == CallState::RingingMe {
//!             if let Some(call) = calls.get(call_id) {
//!                 let _ = call.answer().await;
//!             }
//!         }
//!     }
//! }
//!
//! # async fn example(signaling: Arc<dyn SignalingClient>) -> softphone_client_core::ClientResult<()> {
//! let phone = Phone::new(PhoneConfig::new("pbx.example.com", 5060, "100", "secret"), signaling)?;
//! phone.set_event_handler(Arc::new(Answerer));
//! phone.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod phone;
pub mod pool;
pub mod signaling;
pub mod testing;

pub use call::{Call, CallDirection, CallFailure, CallState, FailureReason};
pub use config::{ForwardingConfig, PhoneConfig};
pub use directory::CallDirectory;
pub use error::{ClientError, ClientResult};
pub use events::{PhoneEvent, PhoneEventHandler, RegistrationStatus};
pub use negotiation::{MediaLeg, Negotiation, NegotiationWarning};
pub use phone::{Phone, PhoneStatus};
pub use signaling::{
    AuthChallenge, ConnectionAddress, HoldRequest, InviteOutcome, MediaDescription, MediaPlan, MediaType, Party,
    RtpMap, SessionDescription, SignalingClient, SipRequest, SipStatus, TransferRequest,
};

pub use softphone_media_core::TransmitMode;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
