//! Signaling collaborator boundary
//!
//! The phone does not speak SIP itself. A [`SignalingClient`] implementation
//! owns the transport, registration and message formatting; the phone drives
//! it with the outbound operations below and receives every inbound event as
//! an already parsed [`SipRequest`] through [`crate::Phone::on_call`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use softphone_media_core::TransmitMode;
use softphone_rtp_core::PayloadAssociation;

use crate::error::ClientResult;

/// Local port to offered codecs, one entry per media line
pub type MediaPlan = BTreeMap<u16, PayloadAssociation>;

/// Classification of an inbound signaling event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SipStatus {
    /// New INVITE, or re-INVITE for a known dialog
    Invite,
    /// 100 Trying
    Trying,
    /// 180 Ringing for a call placed by this phone
    Ringing,
    /// 180 Ringing this phone sent itself for an inbound call
    SelfRinging,
    /// 200 OK to an INVITE
    Ok,
    Bye,
    /// Dialog terminated without a BYE (remote CANCEL, 487)
    End,
    /// 603 Decline
    Decline,
    /// 486 Busy Here
    BusyHere,
    /// 404 Not Found
    NotFound,
    /// 480 Temporarily Unavailable
    TemporarilyUnavailable,
    /// Local hold acknowledged
    Hold,
    /// Remote party put the call on hold
    OnlineHold,
    /// 202 Accepted to a REFER
    TransferAccepted,
    TransferDeclined,
    Other(u16),
}

impl fmt::Display for SipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipStatus::Other(code) => write!(f, "{code}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// One side of a dialog as seen in From/To headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub number: String,
    pub display_name: Option<String>,
    pub tag: Option<String>,
}

impl Party {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Digest challenge carried by a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub realm: Option<String>,
    pub nonce: String,
}

/// A `c=` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAddress {
    pub address: IpAddr,
    /// Number of consecutive multicast addresses, 1 for unicast
    pub address_count: u16,
    pub ttl: Option<u8>,
}

impl ConnectionAddress {
    pub fn unicast(address: IpAddr) -> Self {
        Self {
            address,
            address_count: 1,
            ttl: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Other(String),
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
            MediaType::Other(kind) => f.write_str(kind),
        }
    }
}

/// `a=rtpmap` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpMap {
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// An `m=` line with its attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub port: u16,
    pub port_count: u16,
    /// Offered payload ids in preference order
    pub payload_ids: Vec<u8>,
    pub rtpmap: BTreeMap<u8, RtpMap>,
    pub transmit_mode: Option<TransmitMode>,
}

impl MediaDescription {
    pub fn audio(port: u16, payload_ids: Vec<u8>) -> Self {
        Self {
            media_type: MediaType::Audio,
            port,
            port_count: 1,
            payload_ids,
            rtpmap: BTreeMap::new(),
            transmit_mode: None,
        }
    }

    pub fn with_rtpmap(mut self, id: u8, encoding_name: impl Into<String>, clock_rate: u32) -> Self {
        self.rtpmap.insert(
            id,
            RtpMap {
                encoding_name: encoding_name.into(),
                clock_rate,
            },
        );
        self
    }
}

/// Parsed session description body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub connections: Vec<ConnectionAddress>,
    pub media: Vec<MediaDescription>,
    /// Session level direction attribute
    pub transmit_mode: TransmitMode,
}

/// Inbound signaling event or the request a dialog was created from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipRequest {
    pub call_id: String,
    pub status: SipStatus,
    pub from: Party,
    pub to: Party,
    pub contact: Option<String>,
    pub authentication: Option<AuthChallenge>,
    pub body: Option<SessionDescription>,
}

impl SipRequest {
    pub fn new(call_id: impl Into<String>, status: SipStatus, from: Party, to: Party) -> Self {
        Self {
            call_id: call_id.into(),
            status,
            from,
            to,
            contact: None,
            authentication: None,
            body: None,
        }
    }

    pub fn with_body(mut self, body: SessionDescription) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_authentication(mut self, nonce: impl Into<String>) -> Self {
        self.authentication = Some(AuthChallenge {
            realm: None,
            nonce: nonce.into(),
        });
        self
    }

    /// Body transmit mode, sendrecv when absent
    pub fn transmit_mode(&self) -> TransmitMode {
        self.body.as_ref().map(|b| b.transmit_mode).unwrap_or_default()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.authentication.as_ref().map(|a| a.nonce.as_str())
    }

    /// The party that is not `username`
    pub fn remote_party(&self, username: &str) -> &Party {
        if self.to.number == username {
            &self.from
        } else {
            &self.to
        }
    }

    /// Dialog tags as (local, remote) for a phone registered as `username`
    pub fn dialog_tags(&self, username: &str) -> (Option<String>, Option<String>) {
        if self.from.number == username {
            (self.from.tag.clone(), self.to.tag.clone())
        } else {
            (self.to.tag.clone(), self.from.tag.clone())
        }
    }
}

/// Result of placing an outbound INVITE
#[derive(Debug, Clone)]
pub struct InviteOutcome {
    pub request: SipRequest,
    pub call_id: String,
    pub session_id: u32,
}

/// Parameters of a hold/resume re-INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    pub call_id: String,
    /// Number the dialog was addressed to
    pub number: String,
    /// Remote party number
    pub call_to: String,
    pub plan: MediaPlan,
    pub transmit_mode: TransmitMode,
    pub tag_from: Option<String>,
    pub tag_to: Option<String>,
    pub nonce: Option<String>,
    pub is_hold: bool,
}

/// Parameters of a REFER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub call_id: String,
    /// Remote party of the call being transferred
    pub number: String,
    pub refer_to: String,
    /// Dialog replaced by an attended transfer, tags oriented to this phone
    pub replaces: Option<SipRequest>,
    pub plan: MediaPlan,
    pub transmit_mode: TransmitMode,
    pub tag_from: Option<String>,
    pub tag_to: Option<String>,
    pub nonce: Option<String>,
}

/// Outbound signaling operations the phone depends on
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Register and return the local signaling address
    async fn start(&self) -> ClientResult<SocketAddr>;

    async fn stop(&self) -> ClientResult<()>;

    async fn invite(&self, number: &str, plan: &MediaPlan, mode: TransmitMode) -> ClientResult<InviteOutcome>;

    /// Send 200 OK with a media answer
    async fn answer(&self, request: &SipRequest, session_id: u32, plan: &MediaPlan, mode: TransmitMode) -> ClientResult<()>;

    async fn bye(&self, request: &SipRequest) -> ClientResult<()>;

    async fn cancel(&self, request: &SipRequest) -> ClientResult<()>;

    /// Send 486 Busy Here
    async fn busy(&self, request: &SipRequest) -> ClientResult<()>;

    /// Send a hold/resume re-INVITE, returning the request it produced
    async fn hold(&self, hold: HoldRequest) -> ClientResult<SipRequest>;

    async fn transfer(&self, transfer: TransferRequest) -> ClientResult<()>;

    /// Send 302 Moved Temporarily to `target`
    async fn moved_temporarily(&self, request: &SipRequest, target: &str) -> ClientResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SipRequest {
        SipRequest::new(
            "call-1",
            SipStatus::Ringing,
            Party::new("alice").with_tag("a-tag"),
            Party::new("bob").with_tag("b-tag").with_display_name("Bob"),
        )
    }

    #[test]
    fn test_dialog_tags_follow_local_side() {
        let req = request();
        assert_eq!(req.dialog_tags("alice"), (Some("a-tag".into()), Some("b-tag".into())));
        assert_eq!(req.dialog_tags("bob"), (Some("b-tag".into()), Some("a-tag".into())));
    }

    #[test]
    fn test_remote_party() {
        let req = request();
        assert_eq!(req.remote_party("alice").number, "bob");
        assert_eq!(req.remote_party("bob").number, "alice");
        assert_eq!(req.transmit_mode(), TransmitMode::SendRecv);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SipStatus::BusyHere.to_string(), "BusyHere");
        assert_eq!(SipStatus::Other(488).to_string(), "488");
    }
}
