//! Event handling for phone and call activity
//!
//! Applications observe the phone in two ways, which can be combined:
//!
//! - **Handler** - an implementation of [`PhoneEventHandler`] installed with
//!   [`crate::Phone::set_event_handler`]. It receives every call state
//!   notification together with the phone's [`CallDirectory`], so it can
//!   look the call up and act on it (answer, deny, start reading audio).
//! - **Subscription** - [`crate::Phone::subscribe`] returns a broadcast
//!   receiver of [`PhoneEvent`]s for passive consumers such as logging or UI.
//!
//! # Handler Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use softphone_client_core::{CallDirectory, CallState, PhoneEventHandler, RegistrationStatus};
//!
//! struct AutoAnswer;
//!
//! #[async_trait]
//! impl PhoneEventHandler for AutoAnswer {
//!     async fn on_call_state(&self, state: CallState, calls: &CallDirectory, call_id: &str) {
//!         if state == CallState::RingingMe {
//!             if let Some(call) = calls.get(call_id) {
//!                 let _ = call.answer().await;
//!             }
//!         }
//!     }
//!
//!     async fn on_registration_status(&self, status: RegistrationStatus) {
//!         println!("Registration: {status}");
//!     }
//! }
//! ```

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{CallFailure, CallState};
use crate::directory::CallDirectory;
use crate::negotiation::NegotiationWarning;

/// Registrar reachability as reported by the signaling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Online,
    Offline,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStatus::Online => f.write_str("ONLINE"),
            RegistrationStatus::Offline => f.write_str("OFFLINE"),
        }
    }
}

/// Events published on the phone's broadcast channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PhoneEvent {
    CallStateChanged {
        call_id: String,
        state: CallState,
        timestamp: DateTime<Utc>,
    },
    RegistrationChanged {
        status: RegistrationStatus,
        timestamp: DateTime<Utc>,
    },
    NegotiationWarning {
        call_id: String,
        warning: NegotiationWarning,
    },
    CallFailed {
        failure: CallFailure,
    },
}

impl PhoneEvent {
    /// Call the event refers to, if any
    pub fn call_id(&self) -> Option<&str> {
        match self {
            PhoneEvent::CallStateChanged { call_id, .. } | PhoneEvent::NegotiationWarning { call_id, .. } => Some(call_id),
            PhoneEvent::CallFailed { failure } => Some(&failure.call_id),
            PhoneEvent::RegistrationChanged { .. } => None,
        }
    }
}

/// Application callbacks
///
/// Only [`PhoneEventHandler::on_call_state`] is required. Callbacks run on
/// the task that delivered the signaling event; long work belongs in a
/// spawned task.
#[async_trait]
pub trait PhoneEventHandler: Send + Sync {
    /// A call entered `state`, or a signaling status mapped to it arrived
    async fn on_call_state(&self, state: CallState, calls: &CallDirectory, call_id: &str);

    async fn on_registration_status(&self, _status: RegistrationStatus) {
        // Default: ignore
    }

    async fn on_negotiation_warning(&self, _call_id: &str, _warning: &NegotiationWarning) {
        // Default: ignore
    }

    /// A dialing call ended with a terminal failure
    async fn on_call_failure(&self, _failure: &CallFailure) {
        // Default: ignore
    }
}
